#![cfg_attr(not(doctest), doc = include_str!("../README.md"))]

pub mod config;
pub mod context;
pub mod error;
pub mod id;
pub mod layer;
pub mod metadata;
pub mod request;
pub mod response;
pub mod segment;
pub mod status;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_helpers;

pub type BoxStream<'l, T> = std::pin::Pin<Box<dyn futures::Stream<Item = T> + Send + 'l>>;

pub use motore::{layer::Layer, Service};

pub use self::{
    config::{RequestIdConfig, XrayConfig},
    context::{ClientContext, ServerContext},
    layer::{
        ClientTracingLayer, RequestIdLayer, ServerTracingLayer, StreamServerTracingLayer,
        XrayTracer,
    },
    metadata::{MetadataMap, TraceContext},
    request::Request,
    response::Response,
    segment::{Segment, SegmentGuard},
    status::{Code, Status},
    transport::Connection,
};
