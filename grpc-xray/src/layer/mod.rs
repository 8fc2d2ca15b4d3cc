//! Middleware layers.
//!
//! Server stacks apply [`RequestIdLayer`] outside of [`ServerTracingLayer`] (or
//! [`StreamServerTracingLayer`]), so that the tracing layer and the handler both see the request
//! ID. Client stacks apply [`ClientTracingLayer`] in front of the transport.

pub mod client;
pub mod request_id;
pub mod server;
pub mod stream;

pub use self::{
    client::ClientTracingLayer,
    request_id::RequestIdLayer,
    server::{ServerTracingLayer, XrayTracer},
    stream::{StreamServerTracingLayer, TracedStream},
};
