//! Call metadata and the trace identity carried inside it.
//!
//! Lookups never fail: a missing key is simply the empty string, which callers read as "tracing
//! is not active for this call".

mod map;

pub use self::map::MetadataMap;

/// Key of the request ID in the metadata.
pub const REQUEST_ID_METADATA_KEY: &str = "X-Request-Id";
/// Key of the trace ID shared by every segment of a request chain.
pub const TRACE_ID_METADATA_KEY: &str = "trace-id";
/// Key of the span ID of the calling segment.
pub const SPAN_ID_METADATA_KEY: &str = "span-id";
/// Key of the span ID of the caller's parent, if any.
pub const PARENT_SPAN_ID_METADATA_KEY: &str = "parent-span-id";
/// Key of the caller's user agent, set by the runtime.
pub const USER_AGENT_METADATA_KEY: &str = "user-agent";

/// Returns true if `key` has at least one value in `md`.
pub fn has_key(md: &MetadataMap, key: &str) -> bool {
    md.contains_key(key)
}

/// Returns the first value of `key`, or an empty string if there is none.
pub fn value<'a>(md: &'a MetadataMap, key: &str) -> &'a str {
    md.get(key).unwrap_or_default()
}

/// Writes the trace, span and (when not empty) parent span IDs into `md`.
pub fn with_span<'a>(
    md: &'a mut MetadataMap,
    trace_id: &str,
    span_id: &str,
    parent_id: &str,
) -> &'a mut MetadataMap {
    if !parent_id.is_empty() {
        set_or_warn(md, PARENT_SPAN_ID_METADATA_KEY, parent_id);
    }
    set_or_warn(md, TRACE_ID_METADATA_KEY, trace_id);
    set_or_warn(md, SPAN_ID_METADATA_KEY, span_id);
    md
}

fn set_or_warn(md: &mut MetadataMap, key: &str, value: &str) {
    if let Err(e) = md.insert(key, value) {
        tracing::warn!("[XRAY] skip writing trace metadata {key}: {e}");
    }
}

/// Trace identity propagated between processes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
}

impl TraceContext {
    /// Reads the trace identity from `md`.
    ///
    /// Returns `None` unless both the trace ID and the span ID are present and not empty.
    pub fn extract(md: &MetadataMap) -> Option<Self> {
        let trace_id = value(md, TRACE_ID_METADATA_KEY);
        let span_id = value(md, SPAN_ID_METADATA_KEY);
        if trace_id.is_empty() || span_id.is_empty() {
            return None;
        }
        let parent_span_id = Some(value(md, PARENT_SPAN_ID_METADATA_KEY))
            .filter(|p| !p.is_empty())
            .map(ToOwned::to_owned);
        Some(Self {
            trace_id: trace_id.to_owned(),
            span_id: span_id.to_owned(),
            parent_span_id,
        })
    }

    /// Writes the trace identity into `md`.
    pub fn inject(&self, md: &mut MetadataMap) {
        with_span(
            md,
            &self.trace_id,
            &self.span_id,
            self.parent_span_id.as_deref().unwrap_or_default(),
        );
    }
}
