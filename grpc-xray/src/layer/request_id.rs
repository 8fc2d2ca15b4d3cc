use motore::{layer::Layer, Service};

use crate::{
    config::RequestIdConfig,
    context::ServerContext,
    id::short_id,
    metadata::{self, REQUEST_ID_METADATA_KEY},
    Request,
};

/// A [`Layer`] that gives every inbound call a request ID.
///
/// The ID is written into the request metadata under [`REQUEST_ID_METADATA_KEY`] and stored in
/// the [`ServerContext`]. It must be applied outside of the tracing layers.
#[derive(Clone, Debug, Default)]
pub struct RequestIdLayer {
    config: RequestIdConfig,
}

impl RequestIdLayer {
    pub fn new(config: RequestIdConfig) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestId<S>;

    fn layer(self, inner: S) -> Self::Service {
        RequestId {
            inner,
            config: self.config,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RequestId<S> {
    inner: S,
    config: RequestIdConfig,
}

impl<S> RequestId<S> {
    fn request_id(&self, md: &metadata::MetadataMap) -> String {
        if self.config.trust_incoming_id {
            if let Some(incoming) = md
                .get(REQUEST_ID_METADATA_KEY)
                .filter(|id| !id.is_empty())
            {
                return truncate(incoming, self.config.max_id_length).to_owned();
            }
        }
        short_id()
    }
}

impl<S, T> Service<ServerContext, Request<T>> for RequestId<S>
where
    S: Service<ServerContext, Request<T>> + Send + Sync,
    T: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;

    async fn call(
        &self,
        cx: &mut ServerContext,
        mut req: Request<T>,
    ) -> Result<Self::Response, Self::Error> {
        let id = self.request_id(req.metadata());
        if let Err(e) = req.metadata_mut().insert(REQUEST_ID_METADATA_KEY, &id) {
            tracing::warn!("[XRAY] skip writing request id {id:?}: {e}");
        }
        cx.set_request_id(id);

        self.inner.call(cx, req).await
    }
}

/// Cuts `s` to at most `max` bytes on a char boundary. `0` means no limit.
fn truncate(s: &str, max: usize) -> &str {
    if max == 0 || s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
