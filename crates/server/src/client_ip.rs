use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use poem::{
    http::{HeaderMap, StatusCode},
    Endpoint, Error, FromRequest, Middleware, Request, RequestBody, Result,
};

/// Header appended by reverse proxies, listing the client and every hop.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// The best-effort address of the client that originated a request.
///
/// Resolution never fails: when neither the forwarded-address header nor the
/// transport peer yields an address, the value is [`ClientIp::UNKNOWN`]. That
/// sentinel is distinct from "not resolved at all", which accessors report as
/// `None` (see [`ClientIpExt`](crate::ClientIpExt)).
///
/// Handlers can take it as a parameter once [`RealIp`] is installed:
///
/// ```rust,ignore
/// #[poem::handler]
/// fn whoami(ip: gear_server::ClientIp) -> String {
///     ip.to_string()
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClientIp(Option<IpAddr>);

impl ClientIp {
    /// No address could be determined for the request.
    pub const UNKNOWN: ClientIp = ClientIp(None);

    /// Wraps a known address.
    pub fn new(addr: IpAddr) -> Self {
        Self(Some(addr))
    }

    /// Returns the address, or `None` for [`ClientIp::UNKNOWN`].
    #[inline]
    pub fn addr(&self) -> Option<IpAddr> {
        self.0
    }

    #[inline]
    pub fn is_unknown(&self) -> bool {
        self.0.is_none()
    }
}

impl From<IpAddr> for ClientIp {
    fn from(addr: IpAddr) -> Self {
        Self::new(addr)
    }
}

impl fmt::Display for ClientIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(addr) => fmt::Display::fmt(&addr, f),
            None => f.write_str("unknown"),
        }
    }
}

impl<'a> FromRequest<'a> for ClientIp {
    async fn from_request(req: &'a Request, _body: &mut RequestBody) -> Result<Self> {
        req.extensions().get::<ClientIp>().copied().ok_or_else(|| {
            Error::from_string(
                "client ip was not resolved, the `RealIp` middleware is not installed",
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        })
    }
}

/// Resolves the client address from request headers and the transport peer.
///
/// The first token of the first `X-Forwarded-For` value wins when it parses
/// as an IPv4 or IPv6 address. Later tokens are never consulted. Otherwise
/// the peer address is used with its port discarded, and failing that the
/// result is [`ClientIp::UNKNOWN`].
///
/// The forwarded header is trusted as-is: a proxy that sanitizes it must sit
/// in front of the server.
pub fn resolve(headers: &HeaderMap, peer: Option<&SocketAddr>) -> ClientIp {
    headers
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(first_forwarded_ip)
        .or_else(|| peer.map(SocketAddr::ip))
        .map(ClientIp::new)
        .unwrap_or(ClientIp::UNKNOWN)
}

fn first_forwarded_ip(value: &str) -> Option<IpAddr> {
    let first = value.split(',').next()?.trim();
    parse_ip(first)
}

fn parse_ip(token: &str) -> Option<IpAddr> {
    if let Ok(addr) = token.parse() {
        return Some(addr);
    }

    // IPv6 scoped addresses, e.g. `fe80::1%eth0`. The zone is dropped.
    match token.split_once('%') {
        Some((addr, zone)) if !zone.is_empty() => addr.parse().ok().filter(IpAddr::is_ipv6),
        _ => None,
    }
}

/// Middleware that resolves the [`ClientIp`] of every request and stores it in
/// the request extensions, where gRPC and HTTP handlers can read it.
///
/// Installed by [`Server`](crate::Server) around both protocol branches.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealIp;

impl<E: Endpoint> Middleware<E> for RealIp {
    type Output = RealIpEndpoint<E>;

    fn transform(&self, ep: E) -> Self::Output {
        RealIpEndpoint { inner: ep }
    }
}

/// The endpoint wrapper produced by [`RealIp`].
pub struct RealIpEndpoint<E> {
    inner: E,
}

impl<E: Endpoint> Endpoint for RealIpEndpoint<E> {
    type Output = E::Output;

    async fn call(&self, mut req: Request) -> Result<Self::Output> {
        let client_ip = resolve(req.headers(), req.remote_addr().as_socket_addr());
        req.extensions_mut().insert(client_ip);
        self.inner.call(req).await
    }
}
