use std::{collections::HashSet, fmt, sync::Arc};

use poem::{
    http::{header, HeaderName, HeaderValue, Method},
    Endpoint, EndpointExt, Request, Response, Result,
};

use crate::router::{BoxHandler, GrpcHttpRouter};

const BASE_ALLOWED_HEADERS: &[&str] = &[
    "Accept",
    "Content-Type",
    "Content-Length",
    "Accept-Encoding",
    "X-CSRF-Token",
    "Authorization",
    "X-User-Agent",
    "X-Grpc-Web",
    "grpc-status",
    "grpc-message",
    "Api-Token",
    "X-Auth-Token",
    "Traceparent",
];

const ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
const EXPOSE_HEADERS: &str = "Content-Length, Content-Range, grpc-status, grpc-message";
const MAX_AGE: &str = "1728000";

type OriginFn = dyn Fn(&Request) -> String + Send + Sync;

/// How the `Access-Control-Allow-Origin` response header is chosen.
#[derive(Clone, Default)]
pub enum AllowOrigin {
    /// Always `*`.
    #[default]
    Any,
    /// Echo the request `Origin` when it is in the list, otherwise send an
    /// empty value. `Access-Control-Allow-Credentials: true` is sent as well,
    /// whether or not the origin matched.
    List(HashSet<String>),
    /// Ask a callback for every request.
    /// `Access-Control-Allow-Credentials: true` is sent as well.
    Dynamic(Arc<OriginFn>),
}

impl AllowOrigin {
    pub fn list<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::List(origins.into_iter().map(Into::into).collect())
    }

    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&Request) -> String + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(f))
    }

    /// Returns the allow-origin value and whether credentials are allowed.
    fn resolve(&self, req: &Request) -> (HeaderValue, bool) {
        match self {
            AllowOrigin::Any => (HeaderValue::from_static("*"), false),
            AllowOrigin::Dynamic(f) => (
                HeaderValue::from_str(&f(req)).unwrap_or_else(|_| HeaderValue::from_static("")),
                true,
            ),
            AllowOrigin::List(origins) => {
                let origin = req
                    .headers()
                    .get(header::ORIGIN)
                    .filter(|origin| {
                        origin
                            .to_str()
                            .is_ok_and(|origin| origins.contains(origin))
                    })
                    .cloned()
                    .unwrap_or_else(|| HeaderValue::from_static(""));
                (origin, true)
            }
        }
    }
}

impl fmt::Debug for AllowOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllowOrigin::Any => f.write_str("Any"),
            AllowOrigin::List(origins) => f.debug_tuple("List").field(origins).finish(),
            AllowOrigin::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Options handed to a [`HandlerFactory`](crate::HandlerFactory).
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    pub allow_origin: AllowOrigin,
    /// Appended to the built-in `Access-Control-Allow-Headers` list.
    pub additional_allowed_headers: Vec<String>,
}

/// Routes by protocol like [`default_handler`](crate::default_handler), with
/// CORS headers added to every response and preflight requests answered
/// directly.
pub fn cors_handler(
    http: BoxHandler,
    grpc: BoxHandler,
    options: Option<&HandlerOptions>,
) -> BoxHandler {
    Cors::new(GrpcHttpRouter::new(http, grpc), options).boxed()
}

/// Endpoint adding CORS response headers in front of another endpoint.
///
/// `OPTIONS` requests get an empty `200 OK` carrying only the CORS headers
/// and never reach the inner endpoint.
pub struct Cors<E> {
    inner: E,
    allow_origin: AllowOrigin,
    allow_headers: HeaderValue,
}

impl<E> Cors<E> {
    pub fn new(inner: E, options: Option<&HandlerOptions>) -> Self {
        let (allow_origin, extra) = match options {
            Some(options) => (
                options.allow_origin.clone(),
                options.additional_allowed_headers.as_slice(),
            ),
            None => (AllowOrigin::Any, &[][..]),
        };

        Self {
            inner,
            allow_origin,
            allow_headers: allow_headers(extra),
        }
    }

    fn apply(&self, (origin, credentials): (HeaderValue, bool), resp: &mut Response) {
        let headers = resp.headers_mut();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        if credentials {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOW_METHODS),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            self.allow_headers.clone(),
        );
        headers.insert(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static(EXPOSE_HEADERS),
        );
        headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static(MAX_AGE));
    }
}

fn allow_headers(extra: &[String]) -> HeaderValue {
    let mut names: Vec<&str> = BASE_ALLOWED_HEADERS.to_vec();
    for name in extra {
        if HeaderName::from_bytes(name.as_bytes()).is_ok() {
            names.push(name);
        } else {
            tracing::warn!(header = %name, "ignoring invalid CORS allowed header");
        }
    }

    // Every entry is a valid header name, so the joined value is valid too.
    HeaderValue::from_str(&names.join(", "))
        .unwrap_or_else(|_| HeaderValue::from_static("Accept, Content-Type"))
}

impl<E> Endpoint for Cors<E>
where
    E: Endpoint<Output = Response>,
{
    type Output = Response;

    async fn call(&self, req: Request) -> Result<Self::Output> {
        let origin = self.allow_origin.resolve(&req);

        if req.method() == Method::OPTIONS {
            let mut resp = Response::default();
            self.apply(origin, &mut resp);
            return Ok(resp);
        }

        let mut resp = self.inner.get_response(req).await;
        self.apply(origin, &mut resp);
        Ok(resp)
    }
}
