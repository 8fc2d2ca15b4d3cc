//! Error types of the tracing middleware.
//!
//! Only [`ConnectionError`] ever reaches user code, and only while the tracing layers are being
//! built. Failures that happen while a call is in flight are logged and swallowed.

use std::{io, net::SocketAddr, time::Duration};

use faststr::FastStr;

/// The collector daemon could not be reached when the connection was set up.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The daemon address did not resolve to any socket address.
    #[error("xray: failed to resolve daemon address {addr}: {source}")]
    Resolve {
        addr: FastStr,
        #[source]
        source: io::Error,
    },
    /// Resolving and connecting took longer than the dial timeout.
    #[error("xray: timed out after {timeout:?} connecting to daemon {addr}")]
    Timeout { addr: FastStr, timeout: Duration },
    /// The local socket could not be bound or connected.
    #[error("xray: failed to connect to daemon {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// A segment document could not be delivered.
///
/// Never surfaced to a traced call, the transport logs it and drops the segment.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("failed to encode segment document: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("segment datagram of {size} bytes exceeds the {limit} bytes limit")]
    Oversize { size: usize, limit: usize },
    #[error("failed to write segment datagram: {0}")]
    Io(#[from] io::Error),
}

/// A metadata key or value is not valid on the wire.
#[derive(Debug, thiserror::Error)]
pub enum InvalidMetadata {
    #[error("invalid metadata key {0:?}")]
    Key(String),
    #[error("invalid value for metadata key {0:?}")]
    Value(String),
}
