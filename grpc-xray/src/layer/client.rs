use faststr::FastStr;
use motore::{layer::Layer, Service};

use crate::{
    context::ClientContext,
    metadata,
    status::{Code, Status},
    Request,
};

/// A [`Layer`] tracing outbound calls to `host` as subsegments of the calling segment.
///
/// The subsegment's identity is written into the outgoing metadata so that the callee can
/// continue the trace. Calls made outside of a traced call pass through untouched.
///
/// For streaming methods the subsegment covers the establishment of the stream.
#[derive(Clone, Debug)]
pub struct ClientTracingLayer {
    host: FastStr,
}

impl ClientTracingLayer {
    pub fn new(host: impl Into<FastStr>) -> Self {
        Self { host: host.into() }
    }
}

impl<S> Layer<S> for ClientTracingLayer {
    type Service = ClientTracing<S>;

    fn layer(self, inner: S) -> Self::Service {
        ClientTracing {
            inner,
            host: self.host,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClientTracing<S> {
    inner: S,
    host: FastStr,
}

impl<S, T> Service<ClientContext, Request<T>> for ClientTracing<S>
where
    S: Service<ClientContext, Request<T>, Error = Status> + Send + Sync,
    T: Send + 'static,
{
    type Response = S::Response;
    type Error = Status;

    async fn call(
        &self,
        cx: &mut ClientContext,
        mut req: Request<T>,
    ) -> Result<Self::Response, Self::Error> {
        let Some(sub) = cx.segment().map(|seg| seg.new_subsegment(self.host.clone())) else {
            return self.inner.call(cx, req).await;
        };
        let sub = sub.close_on_drop();

        metadata::with_span(
            req.metadata_mut(),
            &sub.trace_id(),
            &sub.id(),
            sub.parent_id().as_deref().unwrap_or_default(),
        );
        sub.record_request(cx.method(), "remote", req.metadata(), None);

        let result = self.inner.call(cx, req).await;
        match &result {
            Ok(_) => sub.record_response(Code::Ok),
            Err(status) => sub.record_status(status),
        }
        result
    }
}
