use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use poem::{
    endpoint::BoxEndpoint,
    listener::{Acceptor, Listener, TcpAcceptor, TcpListener},
    middleware::{AddData, OpenTelemetryMetrics, OpenTelemetryTracing, TokioMetrics},
    EndpointExt, IntoEndpoint, Middleware, Response, Route, Server as HttpServer,
};
use poem_grpc::{RouteGrpc, Service};
use tokio::{sync::oneshot, task::JoinHandle};

use crate::{
    default_handler,
    drain::DrainGate,
    middlewares::{RequestDuration, RequestLog},
    telemetry, BoxHandler, HandlerFactory, HandlerOptions, JsonOptions, RealIp, ServerError,
};

const DEFAULT_PORT: u16 = 8080;

/// Configuration of a [`Server`].
///
/// [`ServerConfig::from_env`] reads the same settings from the environment.
#[derive(Clone)]
pub struct ServerConfig {
    /// Port to listen on, on all interfaces. `0` picks any free port; the
    /// actual one is reported by [`RunningServer::port`].
    pub port: u16,
    /// Combines the HTTP/JSON gateway and the gRPC router into the top-level
    /// handler. Defaults to [`default_handler`].
    pub handler_factory: Arc<dyn HandlerFactory>,
    /// Passed to the handler factory, e.g. CORS settings for
    /// [`cors_handler`](crate::cors_handler).
    pub handler_options: Option<HandlerOptions>,
    /// JSON rendering options made available to gateway handlers.
    pub json: JsonOptions,
    /// Enables poem's tokio runtime metrics middleware.
    pub tokio_metrics: bool,
    /// Exports request spans over OTLP.
    pub otlp_tracing: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            handler_factory: Arc::new(default_handler),
            handler_options: None,
            json: JsonOptions::default(),
            tokio_metrics: false,
            otlp_tracing: true,
        }
    }
}

impl ServerConfig {
    /// Builds a configuration from environment variables:
    ///
    /// | Variable | Effect |
    /// |---|---|
    /// | `MICRO_SERVER_PORT` | Listen port, `8080` when unset |
    /// | `GEAR_ENABLE_TOKIO_METRICS=1` | Sets [`tokio_metrics`](Self::tokio_metrics) |
    /// | `GEAR_JSON_EMIT_UNPOPULATED=1` | Sets [`JsonOptions::emit_unpopulated`] |
    /// | `GEAR_DISABLE_OTLP_TRACING=1` | Clears [`otlp_tracing`](Self::otlp_tracing) |
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] if `MICRO_SERVER_PORT` is not a port
    /// number.
    pub fn from_env() -> Result<Self, ServerError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ServerError> {
        let flag = |name: &str| var(name).as_deref() == Some("1");

        let mut config = Self::default();
        if let Some(port) = var("MICRO_SERVER_PORT") {
            config.port = port.trim().parse().map_err(|_| {
                ServerError::Config(format!("MICRO_SERVER_PORT is not a port number: `{port}`"))
            })?;
        }
        config.tokio_metrics = flag("GEAR_ENABLE_TOKIO_METRICS");
        config.json.emit_unpopulated = flag("GEAR_JSON_EMIT_UNPOPULATED");
        config.otlp_tracing = !flag("GEAR_DISABLE_OTLP_TRACING");
        Ok(config)
    }
}

/// Serves gRPC and HTTP/JSON on a single port.
///
/// Requests arriving over HTTP/2 with an `application/grpc*` content type go
/// to the registered gRPC services, everything else goes to the gateway
/// endpoint. The split is made by the configured
/// [`HandlerFactory`](crate::HandlerFactory). Both branches run behind this
/// middleware stack:
///
/// | Middleware | Purpose |
/// |---|---|
/// | [`AddData`] + [`OpenTelemetryTracing`] | Distributed tracing (when `otlp_tracing` is set) |
/// | [`OpenTelemetryMetrics`] | Request-level OpenTelemetry metrics |
/// | [`RequestDuration`] | Prometheus histogram `micro_request_duration_seconds` |
/// | [`TokioMetrics`] | Tokio runtime metrics (when `tokio_metrics` is set) |
/// | [`RealIp`] | Resolves the [`ClientIp`](crate::ClientIp) of the request |
/// | [`RequestLog`] | Logs method, URI, version and client address |
///
/// # Examples
///
/// ```rust,no_run
/// use gear_server::{Server, ServerConfig};
/// use poem::{handler, Route};
///
/// #[handler]
/// fn health() -> &'static str {
///     "ok"
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<(), gear_server::ServerError> {
///     Server::new(ServerConfig::from_env()?)
///         // .add_service(my_grpc_service)
///         .gateway(Route::new().at("/healthz", health))
///         .serve()
///         .await
/// }
/// ```
pub struct Server {
    config: ServerConfig,
    grpc: RouteGrpc,
    gateway: BoxHandler,
}

impl Server {
    /// Creates a server with no gRPC services and a gateway answering
    /// `404 Not Found` to everything.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            grpc: RouteGrpc::new(),
            gateway: Route::new().boxed(),
        }
    }

    /// Registers a gRPC service. Calls can be chained to add several.
    pub fn add_service<S>(mut self, service: S) -> Self
    where
        S: IntoEndpoint<Endpoint = BoxEndpoint<'static, Response>> + Service,
    {
        self.grpc = self.grpc.add_service(service);
        self
    }

    /// Sets the endpoint serving plain HTTP/JSON requests, typically a
    /// [`Route`] of transcoding handlers.
    pub fn gateway<E>(mut self, ep: E) -> Self
    where
        E: IntoEndpoint,
        E::Endpoint: 'static,
    {
        self.gateway = ep.into_endpoint().map_to_response().boxed();
        self
    }

    /// The configured port. May be `0`; see [`RunningServer::port`].
    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Binds the listener and serves until the process stops.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the port cannot be bound and
    /// [`ServerError::Serve`] if the server fails while running.
    pub async fn serve(self) -> Result<(), ServerError> {
        let port = self.config.port;
        let app = self.into_app(&DrainGate::new())?;
        let (acceptor, _) = bind(port).await?;

        HttpServer::new_with_acceptor(acceptor)
            .http2_max_concurrent_streams(None)
            .http2_max_header_list_size(16384 * 64)
            .run(app)
            .await
            .map_err(ServerError::Serve)
    }

    /// Binds the listener and serves in a background task, with an extra
    /// user-supplied middleware applied outermost.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the port cannot be bound.
    pub async fn start_with_middleware<T>(self, middleware: T) -> Result<RunningServer, ServerError>
    where
        T: Middleware<BoxHandler> + 'static,
        T::Output: 'static,
    {
        let port = self.config.port;
        let gate = DrainGate::new();
        let app = self
            .into_app(&gate)?
            .with(middleware)
            .map_to_response()
            .boxed();
        let (acceptor, local_addr) = bind(port).await?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = HttpServer::new_with_acceptor(acceptor)
            .http2_max_concurrent_streams(None)
            .http2_max_header_list_size(16384 * 64);
        let task = tokio::spawn(async move {
            let signal = async move {
                let _ = shutdown_rx.await;
            };
            server.run_with_graceful_shutdown(app, signal, None).await
        });

        Ok(RunningServer {
            local_addr,
            gate,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Binds the listener and serves in a background task.
    ///
    /// Shorthand for [`start_with_middleware(())`](Self::start_with_middleware).
    pub async fn start(self) -> Result<RunningServer, ServerError> {
        self.start_with_middleware(()).await
    }

    fn into_app(self, gate: &DrainGate) -> Result<BoxHandler, ServerError> {
        let ServerConfig {
            handler_factory,
            handler_options,
            json,
            tokio_metrics,
            otlp_tracing,
            ..
        } = self.config;

        let grpc = gate.guard(self.grpc.into_endpoint()).boxed();
        let http = self.gateway.with(AddData::new(json)).boxed();
        let app = handler_factory
            .build(http, grpc, handler_options.as_ref())
            .with(RequestLog)
            .with(RealIp)
            .with(
                OpenTelemetryMetrics::new()
                    .combine(RequestDuration)
                    .combine_if(tokio_metrics, TokioMetrics::new()),
            )
            .boxed();

        if !otlp_tracing {
            return Ok(app);
        }
        let tracer = telemetry::init_tracer()?;
        Ok(app
            .with(AddData::new(tracer.clone()).combine(OpenTelemetryTracing::new(tracer)))
            .boxed())
    }
}

async fn bind(port: u16) -> Result<(TcpAcceptor, SocketAddr), ServerError> {
    let acceptor = TcpListener::bind(format!("0.0.0.0:{port}"))
        .into_acceptor()
        .await
        .map_err(ServerError::Bind)?;
    let local_addr = acceptor
        .local_addr()
        .first()
        .and_then(|addr| addr.as_socket_addr().copied())
        .ok_or_else(|| {
            ServerError::Bind(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "listener has no socket address",
            ))
        })?;

    tracing::info!(address = %local_addr, "listener bound");
    Ok((acceptor, local_addr))
}

/// Handle to a server started with [`Server::start`].
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) stops the
/// server gracefully in the background.
pub struct RunningServer {
    local_addr: SocketAddr,
    gate: DrainGate,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<io::Result<()>>>,
}

impl RunningServer {
    /// The address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The port the listener is actually bound to, useful when the
    /// configured port was `0`.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stops the server gracefully.
    ///
    /// New gRPC calls are rejected with `UNAVAILABLE` right away and running
    /// ones are allowed to finish. Then the HTTP layer stops accepting
    /// connections and waits for open ones to close. Both phases together are
    /// bounded by `deadline`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::ShutdownTimeout`] when the deadline passes
    /// first. The server keeps draining; the caller can retry or
    /// [`abort`](Self::abort) it.
    pub async fn shutdown(&mut self, deadline: Duration) -> Result<(), ServerError> {
        match tokio::time::timeout(deadline, self.stop()).await {
            Ok(res) => res,
            Err(_) => {
                tracing::warn!(
                    ?deadline,
                    in_flight_grpc_calls = self.gate.in_flight(),
                    "graceful shutdown deadline exceeded"
                );
                Err(ServerError::ShutdownTimeout)
            }
        }
    }

    async fn stop(&mut self) -> Result<(), ServerError> {
        tracing::info!(
            in_flight_grpc_calls = self.gate.in_flight(),
            "draining grpc calls"
        );
        self.gate.drain().await;

        tracing::info!("stopping http server");
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let res = task.await;
        self.task = None;
        res?.map_err(ServerError::Serve)
    }

    /// Stops the server immediately, dropping in-flight requests.
    pub fn abort(self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
