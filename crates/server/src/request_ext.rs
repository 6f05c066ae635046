use crate::ClientIp;

/// Extension trait for reading the resolved client address off a request.
///
/// Implemented for both [`poem::Request`] (HTTP/JSON handlers and middleware)
/// and [`poem_grpc::Request<T>`] (gRPC service methods). gRPC requests inherit
/// the extensions of the HTTP request they were decoded from, so the value
/// stored by [`RealIp`](crate::RealIp) is visible on either side.
///
/// # Examples
///
/// ```rust,ignore
/// use gear_server::ClientIpExt;
///
/// async fn say_hello(&self, req: poem_grpc::Request<HelloRequest>) -> Result<Response<HelloReply>, Status> {
///     match req.client_ip() {
///         Some(ip) => tracing::info!(client_ip = %ip, "hello"),
///         None => tracing::warn!("client ip resolver is not installed"),
///     }
///     // ...
/// }
/// ```
pub trait ClientIpExt {
    /// Returns the resolved client address.
    ///
    /// `None` means resolution never ran for this request. A request whose
    /// address could not be determined yields `Some(ClientIp::UNKNOWN)`.
    fn client_ip(&self) -> Option<ClientIp>;
}

impl ClientIpExt for poem::Request {
    #[inline]
    fn client_ip(&self) -> Option<ClientIp> {
        self.extensions().get::<ClientIp>().copied()
    }
}

impl<T> ClientIpExt for poem_grpc::Request<T> {
    #[inline]
    fn client_ip(&self) -> Option<ClientIp> {
        self.extensions().get::<ClientIp>().copied()
    }
}
