//! Segments: the unit of work reported to the collector.
//!
//! A [`Segment`] is a cheap, cloneable handle. All mutation goes through a per-segment lock, so
//! the interceptor that owns the segment and any handler code holding a clone may annotate it
//! concurrently. Subsegments are owned by their parent and are written through the parent's
//! [`Connection`].
//!
//! Every segment and subsegment is sent as its own document when it is closed, so the size of a
//! document does not grow with the number of outbound calls. The collector correlates the
//! documents by trace ID and parent ID.
//!
//! ```rust,no_run
//! # use grpc_xray::{Segment, Status};
//! # async fn call_external() -> Result<(), Status> { Ok(()) }
//! # async fn handler(segment: &Segment) -> Result<(), Status> {
//! let sub = segment.new_subsegment("external-service").close_on_drop();
//! if let Err(status) = call_external().await {
//!     sub.record_error(&status);
//!     return Err(status);
//! }
//! # Ok(())
//! # }
//! ```

mod document;

use std::{
    collections::BTreeMap,
    error::Error,
    fmt,
    net::SocketAddr,
    ops::Deref,
    sync::Arc,
};

use faststr::FastStr;
use parking_lot::Mutex;

pub use self::document::{
    AnnotationValue, Cause, Exception, Http, HttpRequest, HttpResponse, SegmentDocument,
    ServiceInfo,
};
use crate::{
    id::new_id,
    metadata::{self, MetadataMap, USER_AGENT_METADATA_KEY},
    status::{Code, Status},
    transport::Connection,
};

const SUBSEGMENT_TYPE: &str = "subsegment";

/// A traced unit of work: the whole inbound call, or one outbound call made while serving it.
#[derive(Clone)]
pub struct Segment {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    connection: Connection,
}

struct State {
    doc: SegmentDocument,
    name: FastStr,
    closed: bool,
    subsegments: Vec<Segment>,
}

impl Segment {
    /// Starts a new segment of the trace `trace_id`, called from the span `span_id`.
    ///
    /// The segment gets a fresh ID and records `span_id` as its parent.
    pub fn new(
        name: impl Into<FastStr>,
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        connection: Connection,
    ) -> Self {
        let name = name.into();
        let doc = SegmentDocument {
            id: new_id(),
            trace_id: trace_id.into(),
            parent_id: Some(span_id.into()),
            name: name.to_string(),
            start_time: now(),
            in_progress: true,
            ..Default::default()
        };
        Self::from_state(doc, name, connection)
    }

    fn from_state(doc: SegmentDocument, name: FastStr, connection: Connection) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    doc,
                    name,
                    closed: false,
                    subsegments: Vec::new(),
                }),
                connection,
            }),
        }
    }

    /// Starts a subsegment named `name` and appends it to this segment.
    ///
    /// The subsegment shares the trace ID, takes this segment's ID as its parent and is sent
    /// through the same connection.
    pub fn new_subsegment(&self, name: impl Into<FastStr>) -> Segment {
        let name = name.into();
        let mut state = self.inner.state.lock();
        let doc = SegmentDocument {
            id: new_id(),
            trace_id: state.doc.trace_id.clone(),
            parent_id: Some(state.doc.id.clone()),
            name: name.to_string(),
            kind: Some(SUBSEGMENT_TYPE.to_owned()),
            start_time: now(),
            in_progress: true,
            ..Default::default()
        };
        let sub = Self::from_state(doc, name, self.inner.connection.clone());
        state.subsegments.push(sub.clone());
        sub
    }

    pub fn id(&self) -> String {
        self.inner.state.lock().doc.id.clone()
    }

    pub fn trace_id(&self) -> String {
        self.inner.state.lock().doc.trace_id.clone()
    }

    pub fn parent_id(&self) -> Option<String> {
        self.inner.state.lock().doc.parent_id.clone()
    }

    pub fn set_parent_id(&self, parent_id: impl Into<String>) {
        self.inner.state.lock().doc.parent_id = Some(parent_id.into());
    }

    pub fn name(&self) -> FastStr {
        self.inner.state.lock().name.clone()
    }

    pub fn is_subsegment(&self) -> bool {
        self.inner.state.lock().doc.kind.is_some()
    }

    /// Returns the subsegments created so far, in creation order.
    pub fn subsegments(&self) -> Vec<Segment> {
        self.inner.state.lock().subsegments.clone()
    }

    /// Records the request facet and the namespace (`"remote"` for calls to dependencies, empty
    /// for the entry segment).
    ///
    /// The user agent is read from `md` and the client IP from `peer`; either falls back to an
    /// empty value when unavailable.
    pub fn record_request(
        &self,
        method: &str,
        namespace: &str,
        md: &MetadataMap,
        peer: Option<SocketAddr>,
    ) {
        let request = HttpRequest {
            method: method.to_owned(),
            user_agent: metadata::value(md, USER_AGENT_METADATA_KEY).to_owned(),
            client_ip: peer.map(|p| p.ip().to_string()).unwrap_or_default(),
        };
        let mut state = self.inner.state.lock();
        state.doc.namespace = namespace.to_owned();
        state.doc.http.get_or_insert_with(Http::default).request = Some(request);
    }

    /// Records the status code the call completed with.
    pub fn record_response(&self, code: Code) {
        let mut state = self.inner.state.lock();
        state.doc.http.get_or_insert_with(Http::default).response = Some(HttpResponse {
            status: code.as_i32(),
        });
    }

    /// Flags the segment and records `err` as a cause.
    ///
    /// A [`Status`] is classified by its code: `ResourceExhausted` is a throttle, codes blaming
    /// the caller are errors, everything else is a fault. An `Ok` status is ignored. Any other
    /// error is a fault.
    pub fn record_error(&self, err: &(dyn Error + 'static)) {
        let (kind, class) = match err.downcast_ref::<Status>() {
            Some(status) => match Classification::of(status.code()) {
                Classification::Ok => return,
                class => (format!("{:?}", status.code()), class),
            },
            None => ("error".to_owned(), Classification::Fault),
        };
        let exception = Exception {
            id: new_id(),
            message: err.to_string(),
            kind,
        };

        let mut state = self.inner.state.lock();
        match class {
            Classification::Ok => {}
            Classification::Throttle => {
                state.doc.throttle = true;
                state.doc.error = true;
            }
            Classification::Error => state.doc.error = true,
            Classification::Fault => state.doc.fault = true,
        }
        state
            .doc
            .cause
            .get_or_insert_with(Cause::default)
            .exceptions
            .push(exception);
    }

    /// Records the outcome of a call: the response status and, unless it is `Ok`, the error.
    pub fn record_status(&self, status: &Status) {
        self.record_response(status.code());
        self.record_error(status);
    }

    /// Adds an indexed annotation.
    pub fn add_annotation(&self, key: impl Into<String>, value: impl Into<AnnotationValue>) {
        self.inner
            .state
            .lock()
            .doc
            .annotations
            .insert(key.into(), value.into());
    }

    /// Adds a non-indexed metadata value under `namespace`.
    pub fn add_metadata(
        &self,
        namespace: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) {
        self.inner
            .state
            .lock()
            .doc
            .metadata
            .entry(namespace.into())
            .or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
    }

    pub fn set_service_version(&self, version: impl Into<String>) {
        self.inner.state.lock().doc.service = Some(ServiceInfo {
            version: version.into(),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Ends the segment and sends it to the collector.
    ///
    /// Subsegments still open are closed first, so none outlives its parent. The document sent
    /// does not embed the subsegments; each of them is sent on its own. Only the first call has
    /// any effect.
    pub fn close(&self) {
        let subsegments = {
            let state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.subsegments.clone()
        };
        for sub in &subsegments {
            sub.close();
        }

        let doc = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.doc.end_time = Some(now());
            state.doc.in_progress = false;
            state.doc.clone()
        };
        self.inner.connection.send(&doc);
    }

    /// Returns the current document with snapshots of the subsegments embedded.
    pub fn to_document(&self) -> SegmentDocument {
        let state = self.inner.state.lock();
        let mut doc = state.doc.clone();
        // parent before children, never the other way around
        doc.subsegments = state.subsegments.iter().map(Segment::to_document).collect();
        doc
    }

    /// Wraps the segment in a guard that closes it when dropped.
    pub fn close_on_drop(self) -> SegmentGuard {
        SegmentGuard(self)
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Segment")
            .field("id", &state.doc.id)
            .field("trace_id", &state.doc.trace_id)
            .field("parent_id", &state.doc.parent_id)
            .field("name", &state.name)
            .field("closed", &state.closed)
            .finish()
    }
}

enum Classification {
    Ok,
    Throttle,
    Error,
    Fault,
}

impl Classification {
    fn of(code: Code) -> Self {
        match code {
            Code::Ok => Self::Ok,
            Code::ResourceExhausted => Self::Throttle,
            Code::Cancelled
            | Code::InvalidArgument
            | Code::NotFound
            | Code::AlreadyExists
            | Code::PermissionDenied
            | Code::FailedPrecondition
            | Code::OutOfRange
            | Code::Unauthenticated => Self::Error,
            Code::Unknown
            | Code::DeadlineExceeded
            | Code::Aborted
            | Code::Unimplemented
            | Code::Internal
            | Code::Unavailable
            | Code::DataLoss => Self::Fault,
        }
    }
}

/// Closes the wrapped segment when dropped, including when a panic unwinds through it or the
/// call's future is dropped.
///
/// A segment dropped during a panic is flagged as a fault first.
#[must_use = "the segment is closed as soon as the guard is dropped"]
pub struct SegmentGuard(Segment);

impl SegmentGuard {
    pub fn segment(&self) -> &Segment {
        &self.0
    }
}

impl Deref for SegmentGuard {
    type Target = Segment;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for SegmentGuard {
    fn drop(&mut self) {
        if std::thread::panicking() && !self.0.is_closed() {
            let mut state = self.0.inner.state.lock();
            state.doc.fault = true;
            state
                .doc
                .cause
                .get_or_insert_with(Cause::default)
                .exceptions
                .push(Exception {
                    id: new_id(),
                    message: "panic while the segment was open".to_owned(),
                    kind: "panic".to_owned(),
                });
        }
        self.0.close();
    }
}

/// Current time in epoch seconds with microsecond precision.
fn now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
