//! Server-side middleware installed by [`Server`](crate::Server).

mod request_duration;
mod request_log;

pub use request_duration::{metrics_endpoint, RequestDuration, RequestDurationEndpoint};
pub use request_log::{RequestLog, RequestLogEndpoint};
