use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::{ready, Stream};
use motore::{layer::Layer, Service};
use pin_project::{pin_project, pinned_drop};

use super::server::XrayTracer;
use crate::{
    context::ServerContext,
    segment::SegmentGuard,
    status::{Code, Status},
    Request, Response,
};

/// A [`Layer`] tracing calls that answer with a stream.
///
/// The segment opens once per call and closes when the response stream ends, or when it is
/// dropped before that.
#[derive(Clone, Debug)]
pub struct StreamServerTracingLayer {
    tracer: XrayTracer,
}

impl StreamServerTracingLayer {
    pub fn new(tracer: XrayTracer) -> Self {
        Self { tracer }
    }
}

impl<S> Layer<S> for StreamServerTracingLayer {
    type Service = StreamServerTracing<S>;

    fn layer(self, inner: S) -> Self::Service {
        StreamServerTracing {
            inner,
            tracer: self.tracer,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StreamServerTracing<S> {
    inner: S,
    tracer: XrayTracer,
}

impl<S, T, St, U> Service<ServerContext, Request<T>> for StreamServerTracing<S>
where
    S: Service<ServerContext, Request<T>, Response = Response<St>, Error = Status> + Send + Sync,
    St: Stream<Item = Result<U, Status>> + Send,
    T: Send + 'static,
{
    type Response = Response<TracedStream<St>>;
    type Error = Status;

    async fn call(
        &self,
        cx: &mut ServerContext,
        req: Request<T>,
    ) -> Result<Self::Response, Self::Error> {
        let Some(segment) = self.tracer.start(cx, req.metadata()) else {
            return self
                .inner
                .call(cx, req)
                .await
                .map(|resp| resp.map(TracedStream::untraced));
        };
        let segment = segment.close_on_drop();

        match self.inner.call(cx, req).await {
            Ok(resp) => Ok(resp.map(|inner| TracedStream::new(inner, segment))),
            Err(status) => {
                segment.record_status(&status);
                Err(status)
            }
        }
    }
}

/// A response stream that closes the call's segment when it ends.
///
/// Error items are recorded on the segment and passed on unchanged.
#[pin_project(PinnedDrop)]
pub struct TracedStream<St> {
    #[pin]
    inner: St,
    segment: Option<SegmentGuard>,
    failed: bool,
}

impl<St> TracedStream<St> {
    fn new(inner: St, segment: SegmentGuard) -> Self {
        Self {
            inner,
            segment: Some(segment),
            failed: false,
        }
    }

    fn untraced(inner: St) -> Self {
        Self {
            inner,
            segment: None,
            failed: false,
        }
    }
}

impl<St, U> Stream for TracedStream<St>
where
    St: Stream<Item = Result<U, Status>>,
{
    type Item = Result<U, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let item = ready!(this.inner.poll_next(cx));
        match &item {
            Some(Ok(_)) => {}
            Some(Err(status)) => {
                if let Some(segment) = this.segment.as_ref() {
                    segment.record_status(status);
                    *this.failed = true;
                }
            }
            None => {
                if let Some(segment) = this.segment.take() {
                    if !*this.failed {
                        segment.record_response(Code::Ok);
                    }
                }
            }
        }
        Poll::Ready(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[pinned_drop]
impl<St> PinnedDrop for TracedStream<St> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if let Some(segment) = this.segment.as_ref() {
            if !*this.failed && !std::thread::panicking() {
                segment.record_status(&Status::cancelled("response stream dropped before it ended"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::{
        metadata::with_span,
        test_helpers::{server_cx, FakeDaemon, MockStreamHandler},
    };

    fn traced_request() -> Request<String> {
        let mut req = Request::new("count".to_owned());
        with_span(req.metadata_mut(), "T1", "S1", "");
        req
    }

    fn items(n: usize) -> Vec<Result<String, Status>> {
        (0..n).map(|i| Ok(i.to_string())).collect()
    }

    #[tokio::test]
    async fn segment_closes_once_when_stream_ends() {
        let daemon = FakeDaemon::bind().await;
        let tracer = XrayTracer::new("calc", daemon.connect().await);
        let svc = tracer
            .stream_layer()
            .layer(MockStreamHandler::new(items(3)));

        let mut cx = server_cx("/calc.Calc/Count");
        let mut stream = svc
            .call(&mut cx, traced_request())
            .await
            .unwrap()
            .into_inner();
        let segment = cx.segment().cloned().unwrap();
        assert!(!segment.is_closed());

        let mut got = Vec::new();
        while let Some(item) = stream.next().await {
            got.push(item.unwrap());
            assert!(!segment.is_closed());
        }
        assert_eq!(got, vec!["0", "1", "2"]);
        assert!(segment.is_closed());
        drop(stream);

        let doc = daemon.recv().await;
        assert_eq!(doc["id"], segment.id().as_str());
        assert_eq!(doc["http"]["response"]["status"], 0);
        assert!(doc.get("error").is_none());
        daemon.assert_idle().await;
    }

    #[tokio::test]
    async fn error_items_are_recorded() {
        let daemon = FakeDaemon::bind().await;
        let tracer = XrayTracer::new("calc", daemon.connect().await);
        let svc = tracer.stream_layer().layer(MockStreamHandler::new(vec![
            Ok("0".to_owned()),
            Err(Status::data_loss("lost a page")),
        ]));

        let stream = svc
            .call(&mut server_cx("/calc.Calc/Count"), traced_request())
            .await
            .unwrap()
            .into_inner();
        let got = stream.collect::<Vec<_>>().await;
        assert_eq!(got[1], Err(Status::data_loss("lost a page")));

        let doc = daemon.recv().await;
        assert_eq!(doc["fault"], true);
        assert_eq!(doc["http"]["response"]["status"], 15);
        daemon.assert_idle().await;
    }

    #[tokio::test]
    async fn dropped_stream_closes_segment() {
        let daemon = FakeDaemon::bind().await;
        let tracer = XrayTracer::new("calc", daemon.connect().await);
        let svc = tracer
            .stream_layer()
            .layer(MockStreamHandler::new(items(10)));

        let mut stream = svc
            .call(&mut server_cx("/calc.Calc/Count"), traced_request())
            .await
            .unwrap()
            .into_inner();
        assert_eq!(stream.next().await, Some(Ok("0".to_owned())));
        drop(stream);

        let doc = daemon.recv().await;
        assert_eq!(doc["error"], true);
        assert_eq!(doc["http"]["response"]["status"], 1);
        daemon.assert_idle().await;
    }

    #[tokio::test]
    async fn untraced_stream_is_untouched() {
        let daemon = FakeDaemon::bind().await;
        let tracer = XrayTracer::new("calc", daemon.connect().await);
        let svc = tracer
            .stream_layer()
            .layer(MockStreamHandler::new(items(2)));

        let mut cx = server_cx("/calc.Calc/Count");
        let stream = svc
            .call(&mut cx, Request::new(String::new()))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(stream.collect::<Vec<_>>().await, items(2));
        assert!(cx.segment().is_none());
        daemon.assert_idle().await;
    }
}
