use faststr::FastStr;
use motore::{layer::Layer, Service};

use super::stream::StreamServerTracingLayer;
use crate::{
    config::XrayConfig,
    context::ServerContext,
    error::ConnectionError,
    metadata::{MetadataMap, TraceContext},
    segment::Segment,
    status::{Code, Status},
    transport::Connection,
    Request,
};

/// Opens segments for inbound calls and sends them to the collector daemon.
///
/// One tracer is shared by every server layer of a process; they all write through the same
/// [`Connection`].
///
/// ```rust,no_run
/// # async fn run() -> Result<(), grpc_xray::error::ConnectionError> {
/// use grpc_xray::{config::XrayConfig, XrayTracer};
///
/// let tracer = XrayTracer::connect(&XrayConfig::new("calc", "127.0.0.1:2000")).await?;
/// let unary = tracer.layer();
/// let streaming = tracer.stream_layer();
/// # let _ = (unary, streaming);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct XrayTracer {
    service: FastStr,
    connection: Connection,
}

impl XrayTracer {
    /// Connects to the daemon described by `config`.
    ///
    /// Fails if the daemon cannot be resolved or connected to within the dial timeout. No layer
    /// can be built without a connection; whether to run untraced is up to the caller.
    pub async fn connect(config: &XrayConfig) -> Result<Self, ConnectionError> {
        let connection = Connection::from_config(config).await?;
        Ok(Self::new(config.service_name.clone(), connection))
    }

    pub fn new(service: impl Into<FastStr>, connection: Connection) -> Self {
        Self {
            service: service.into(),
            connection,
        }
    }

    /// The service name segments are reported under.
    pub fn service(&self) -> &FastStr {
        &self.service
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Returns the layer for unary and client-streaming methods.
    pub fn layer(&self) -> ServerTracingLayer {
        ServerTracingLayer::new(self.clone())
    }

    /// Returns the layer for server-streaming and bidirectional methods.
    pub fn stream_layer(&self) -> StreamServerTracingLayer {
        StreamServerTracingLayer::new(self.clone())
    }

    /// Opens the segment of an inbound call and stores it in `cx`.
    ///
    /// Returns `None`, leaving `cx` untouched, if `md` carries no trace identity.
    pub(crate) fn start(&self, cx: &mut ServerContext, md: &MetadataMap) -> Option<Segment> {
        let Some(trace) = TraceContext::extract(md) else {
            tracing::debug!("[XRAY] no trace metadata on {}, skip tracing", cx.method());
            return None;
        };

        let segment = Segment::new(
            self.service.clone(),
            trace.trace_id,
            trace.span_id,
            self.connection.clone(),
        );
        if let Some(parent) = trace.parent_span_id {
            segment.set_parent_id(parent);
        }
        segment.record_request(cx.method(), "", md, cx.peer());
        cx.set_segment(segment.clone());
        Some(segment)
    }
}

/// A [`Layer`] tracing unary calls: the segment is closed when the handler returns.
#[derive(Clone, Debug)]
pub struct ServerTracingLayer {
    tracer: XrayTracer,
}

impl ServerTracingLayer {
    pub fn new(tracer: XrayTracer) -> Self {
        Self { tracer }
    }

    /// Connects to the daemon at `daemon` with the default options, reporting segments as
    /// `service`.
    pub async fn connect(
        service: impl Into<FastStr>,
        daemon: impl Into<FastStr>,
    ) -> Result<Self, ConnectionError> {
        XrayTracer::connect(&XrayConfig::new(service, daemon))
            .await
            .map(Self::new)
    }
}

impl<S> Layer<S> for ServerTracingLayer {
    type Service = ServerTracing<S>;

    fn layer(self, inner: S) -> Self::Service {
        ServerTracing {
            inner,
            tracer: self.tracer,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerTracing<S> {
    inner: S,
    tracer: XrayTracer,
}

impl<S, T> Service<ServerContext, Request<T>> for ServerTracing<S>
where
    S: Service<ServerContext, Request<T>, Error = Status> + Send + Sync,
    T: Send + 'static,
{
    type Response = S::Response;
    type Error = Status;

    async fn call(
        &self,
        cx: &mut ServerContext,
        req: Request<T>,
    ) -> Result<Self::Response, Self::Error> {
        let Some(segment) = self.tracer.start(cx, req.metadata()) else {
            return self.inner.call(cx, req).await;
        };
        // closes on every path out of here, including a panicking handler
        let segment = segment.close_on_drop();

        let result = self.inner.call(cx, req).await;
        match &result {
            Ok(_) => segment.record_response(Code::Ok),
            Err(status) => segment.record_status(status),
        }
        result
    }
}
