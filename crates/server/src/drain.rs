use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use poem::{http::StatusCode, Endpoint, IntoResponse, Request, Response, Result};
use tokio::sync::Notify;

/// gRPC status code `UNAVAILABLE`.
const GRPC_UNAVAILABLE: &str = "14";

/// Tracks in-flight gRPC calls so shutdown can stop admitting new calls and
/// wait for the running ones to finish before the listener is closed.
#[derive(Debug, Clone, Default)]
pub(crate) struct DrainGate {
    state: Arc<GateState>,
}

#[derive(Debug, Default)]
struct GateState {
    closed: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl DrainGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a call, or returns `None` once the gate is closed.
    fn enter(&self) -> Option<CallGuard> {
        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.state.closed.load(Ordering::SeqCst) {
            self.leave();
            return None;
        }
        Some(CallGuard { gate: self.clone() })
    }

    fn leave(&self) {
        if self.state.in_flight.fetch_sub(1, Ordering::SeqCst) == 1
            && self.state.closed.load(Ordering::SeqCst)
        {
            self.state.idle.notify_waiters();
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Rejects new calls from now on and waits until no call is running.
    pub(crate) async fn drain(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        loop {
            let idle = self.state.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Wraps a gRPC endpoint so its calls are tracked by this gate.
    pub(crate) fn guard<E>(&self, inner: E) -> Gated<E> {
        Gated {
            inner,
            gate: self.clone(),
        }
    }
}

struct CallGuard {
    gate: DrainGate,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.gate.leave();
    }
}

pub(crate) struct Gated<E> {
    inner: E,
    gate: DrainGate,
}

impl<E: Endpoint> Endpoint for Gated<E> {
    type Output = Response;

    async fn call(&self, req: Request) -> Result<Self::Output> {
        let Some(_guard) = self.gate.enter() else {
            return Ok(unavailable());
        };
        self.inner.call(req).await.map(IntoResponse::into_response)
    }
}

fn unavailable() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .content_type("application/grpc")
        .header("grpc-status", GRPC_UNAVAILABLE)
        .header("grpc-message", "server is shutting down")
        .finish()
}
