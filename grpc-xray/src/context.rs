//! Per-call contexts threaded through the middleware chains.
//!
//! The server context carries what the runtime knows about the inbound call plus what the
//! middleware adds to it: the request ID and the open segment. Handlers read the segment from
//! the context and hand it to the client context of any outbound call they make.

use std::net::SocketAddr;

use faststr::FastStr;

use crate::segment::Segment;

/// Context of an inbound call.
#[derive(Debug, Clone, Default)]
pub struct ServerContext {
    method: FastStr,
    peer: Option<SocketAddr>,
    request_id: Option<FastStr>,
    segment: Option<Segment>,
}

impl ServerContext {
    /// Creates a context for a call to `method` (`/package.Service/Method`).
    pub fn new(method: impl Into<FastStr>) -> Self {
        Self {
            method: method.into(),
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    #[inline]
    pub fn method(&self) -> &FastStr {
        &self.method
    }

    /// Address of the caller, if the transport knows it.
    #[inline]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[inline]
    pub fn request_id(&self) -> Option<&FastStr> {
        self.request_id.as_ref()
    }

    #[inline]
    pub fn set_request_id(&mut self, request_id: impl Into<FastStr>) {
        self.request_id = Some(request_id.into());
    }

    /// The segment of this call, if it is traced.
    #[inline]
    pub fn segment(&self) -> Option<&Segment> {
        self.segment.as_ref()
    }

    #[inline]
    pub fn set_segment(&mut self, segment: Segment) {
        self.segment = Some(segment);
    }
}

/// Context of an outbound call.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    method: FastStr,
    segment: Option<Segment>,
}

impl ClientContext {
    /// Creates a context for a call to `method` made outside of any traced call.
    pub fn new(method: impl Into<FastStr>) -> Self {
        Self {
            method: method.into(),
            segment: None,
        }
    }

    /// Creates a context for a call made while serving `server`, carrying its segment along.
    pub fn from_server(server: &ServerContext, method: impl Into<FastStr>) -> Self {
        Self {
            method: method.into(),
            segment: server.segment.clone(),
        }
    }

    #[inline]
    pub fn method(&self) -> &FastStr {
        &self.method
    }

    /// The segment of the inbound call this call is made for, if any.
    #[inline]
    pub fn segment(&self) -> Option<&Segment> {
        self.segment.as_ref()
    }
}
