//! # gear-server
//!
//! Serve gRPC and HTTP/JSON on a single port behind a reverse proxy, built on
//! top of [poem](https://docs.rs/poem) and [poem-grpc](https://docs.rs/poem-grpc).
//!
//! ## Key Components
//!
//! - [`Server`] — Owns one listener and dispatches each request to the gRPC
//!   services or the HTTP/JSON gateway, with tracing and metrics middleware.
//! - [`RealIp`] / [`ClientIp`] — Resolves the real client address from
//!   `X-Forwarded-For` or the transport peer and hands it to handlers.
//! - [`HandlerFactory`] — The protocol routing strategy, with
//!   [`default_handler`] and the CORS-enabled [`cors_handler`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gear_server::{cors_handler, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), gear_server::ServerError> {
//!     let config = ServerConfig {
//!         handler_factory: std::sync::Arc::new(cors_handler),
//!         ..ServerConfig::from_env()?
//!     };
//!     Server::new(config)
//!         // .add_service(my_grpc_service)
//!         .serve()
//!         .await
//! }
//! ```

/// Middleware installed by [`Server`] around both protocol branches.
///
/// - [`middlewares::RequestLog`] — Logs incoming requests through `tracing`.
/// - [`middlewares::RequestDuration`] — Prometheus request duration histogram,
///   exposed by [`middlewares::metrics_endpoint`].
pub mod middlewares;

mod client_ip;
mod cors;
mod drain;
mod error;
mod gateway;
mod request_ext;
mod router;
mod server;
mod telemetry;

pub use client_ip::{resolve, ClientIp, RealIp, RealIpEndpoint, X_FORWARDED_FOR};
pub use cors::{cors_handler, AllowOrigin, Cors, HandlerOptions};
pub use error::ServerError;
pub use gateway::JsonOptions;
pub use request_ext::ClientIpExt;
pub use router::{
    default_handler, is_grpc_request, BoxHandler, GrpcHttpRouter, HandlerFactory,
    GRPC_CONTENT_TYPE,
};
pub use server::{RunningServer, Server, ServerConfig};
