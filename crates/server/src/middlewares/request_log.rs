use poem::{Endpoint, Middleware, Request, Result};

use crate::ClientIpExt;

/// Logs every incoming request through `tracing`.
///
/// Method, URI, HTTP version and resolved client address go out at `debug`.
/// Headers are only logged at `trace` since they may carry credentials.
pub struct RequestLog;

impl<E: Endpoint> Middleware<E> for RequestLog {
    type Output = RequestLogEndpoint<E>;

    fn transform(&self, ep: E) -> Self::Output {
        RequestLogEndpoint { inner: ep }
    }
}

/// The endpoint wrapper produced by [`RequestLog`].
pub struct RequestLogEndpoint<E> {
    inner: E,
}

impl<E: Endpoint> Endpoint for RequestLogEndpoint<E> {
    type Output = E::Output;

    async fn call(&self, req: Request) -> Result<Self::Output> {
        let client_ip = req.client_ip().unwrap_or_default();
        tracing::debug!(
            method = %req.method(),
            uri = %req.uri(),
            version = ?req.version(),
            %client_ip,
            "incoming request"
        );
        tracing::trace!(headers = ?req.headers(), "request headers");

        self.inner.call(req).await
    }
}
