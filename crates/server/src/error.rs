use std::io;

use thiserror::Error;

/// Errors surfaced by [`Server`](crate::Server) and
/// [`RunningServer`](crate::RunningServer).
///
/// Client address resolution and protocol routing have no failure path and
/// never produce one of these.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),

    #[error("server stopped unexpectedly: {0}")]
    Serve(#[source] io::Error),

    /// The shutdown deadline passed before in-flight calls finished. The
    /// server is still running; call [`RunningServer::abort`](crate::RunningServer::abort)
    /// to force it down.
    #[error("graceful shutdown did not finish before the deadline")]
    ShutdownTimeout,

    #[error("server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("failed to initialize telemetry: {0}")]
    Telemetry(String),
}
