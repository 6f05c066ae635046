use poem::{
    endpoint::BoxEndpoint,
    http::{header, Version},
    Endpoint, EndpointExt, Request, Response, Result,
};

use crate::cors::HandlerOptions;

/// Content-type prefix shared by every binary gRPC payload encoding
/// (`application/grpc`, `application/grpc+proto`, `application/grpc+json`).
pub const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// A type-erased handler for one side of the server.
pub type BoxHandler = BoxEndpoint<'static, Response>;

/// Returns `true` when the request is a gRPC call: it arrived over HTTP/2 and
/// its `content-type` starts with `application/grpc`.
///
/// Anything else, gRPC-Web from browsers included, is plain HTTP.
pub fn is_grpc_request(req: &Request) -> bool {
    req.version() == Version::HTTP_2
        && req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|content_type| content_type.starts_with(GRPC_CONTENT_TYPE))
}

/// Dispatches each request, unmodified, to either the gRPC or the HTTP/JSON
/// handler according to [`is_grpc_request`].
pub struct GrpcHttpRouter<H, G> {
    http: H,
    grpc: G,
}

impl<H, G> GrpcHttpRouter<H, G> {
    pub fn new(http: H, grpc: G) -> Self {
        Self { http, grpc }
    }
}

impl<H, G> Endpoint for GrpcHttpRouter<H, G>
where
    H: Endpoint<Output = Response>,
    G: Endpoint<Output = Response>,
{
    type Output = Response;

    async fn call(&self, req: Request) -> Result<Self::Output> {
        if is_grpc_request(&req) {
            self.grpc.call(req).await
        } else {
            self.http.call(req).await
        }
    }
}

/// Combines the HTTP/JSON and gRPC handlers into the server's top-level
/// handler.
///
/// This is the extension point for custom routing or CORS behavior. Any
/// function with the matching signature implements it, so [`default_handler`]
/// and [`cors_handler`](crate::cors_handler) can be passed directly.
///
/// # Examples
///
/// ```rust
/// use gear_server::{cors_handler, ServerConfig};
///
/// let config = ServerConfig {
///     handler_factory: std::sync::Arc::new(cors_handler),
///     ..Default::default()
/// };
/// ```
pub trait HandlerFactory: Send + Sync + 'static {
    fn build(
        &self,
        http: BoxHandler,
        grpc: BoxHandler,
        options: Option<&HandlerOptions>,
    ) -> BoxHandler;
}

impl<F> HandlerFactory for F
where
    F: Fn(BoxHandler, BoxHandler, Option<&HandlerOptions>) -> BoxHandler + Send + Sync + 'static,
{
    fn build(
        &self,
        http: BoxHandler,
        grpc: BoxHandler,
        options: Option<&HandlerOptions>,
    ) -> BoxHandler {
        self(http, grpc, options)
    }
}

/// Routes by protocol only. The options are ignored.
pub fn default_handler(
    http: BoxHandler,
    grpc: BoxHandler,
    _options: Option<&HandlerOptions>,
) -> BoxHandler {
    GrpcHttpRouter::new(http, grpc).boxed()
}
