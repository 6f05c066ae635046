use std::time::Instant;

use once_cell::sync::Lazy;
use poem::{
    endpoint::{make_sync, BoxEndpoint},
    http::StatusCode,
    Endpoint, EndpointExt, IntoResponse, Middleware, Request, Response, Result,
};
use prometheus::{register_histogram_vec, Encoder, HistogramVec, TextEncoder};

use crate::is_grpc_request;

static REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "micro_request_duration_seconds",
        "Time spent serving a request, by protocol and HTTP status.",
        &["protocol", "status"]
    )
    .expect("micro_request_duration_seconds should register once")
});

/// Records every request in the `micro_request_duration_seconds` histogram,
/// labelled with the protocol branch it took (`grpc` or `http`) and the HTTP
/// status of the response.
pub struct RequestDuration;

impl<E: Endpoint> Middleware<E> for RequestDuration {
    type Output = RequestDurationEndpoint<E>;

    fn transform(&self, ep: E) -> Self::Output {
        RequestDurationEndpoint { inner: ep }
    }
}

/// The endpoint wrapper produced by [`RequestDuration`].
pub struct RequestDurationEndpoint<E> {
    inner: E,
}

impl<E: Endpoint> Endpoint for RequestDurationEndpoint<E> {
    type Output = Response;

    async fn call(&self, req: Request) -> Result<Self::Output> {
        let protocol = if is_grpc_request(&req) { "grpc" } else { "http" };
        let start = Instant::now();
        let res = self.inner.call(req).await.map(IntoResponse::into_response);
        let status = match &res {
            Ok(resp) => resp.status(),
            Err(err) => err.status(),
        };
        REQUEST_DURATION
            .with_label_values(&[protocol, status.as_str()])
            .observe(start.elapsed().as_secs_f64());
        res
    }
}

/// An endpoint rendering the default prometheus registry in the text
/// exposition format. Mount it on the gateway, e.g. at `/metrics`.
pub fn metrics_endpoint() -> BoxEndpoint<'static, Response> {
    make_sync(|_| {
        let mut buf = Vec::new();
        match TextEncoder::new().encode(&prometheus::gather(), &mut buf) {
            Ok(()) => Response::builder()
                .content_type(prometheus::TEXT_FORMAT)
                .body(buf),
            Err(err) => Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(err.to_string()),
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use poem::http::Version;

    use super::*;

    #[tokio::test]
    async fn observes_requests_by_protocol() {
        let ep = make_sync(|_| "ok").with(RequestDuration);
        let grpc_before = REQUEST_DURATION
            .with_label_values(&["grpc", "200"])
            .get_sample_count();

        ep.call(
            Request::builder()
                .version(Version::HTTP_2)
                .content_type("application/grpc")
                .finish(),
        )
        .await
        .unwrap();
        ep.call(Request::builder().finish()).await.unwrap();

        assert_eq!(
            REQUEST_DURATION
                .with_label_values(&["grpc", "200"])
                .get_sample_count(),
            grpc_before + 1
        );
        assert!(
            REQUEST_DURATION
                .with_label_values(&["http", "200"])
                .get_sample_count()
                >= 1
        );
    }

    #[tokio::test]
    async fn metrics_endpoint_exposes_histogram() {
        let ep = make_sync(|_| "ok").with(RequestDuration);
        ep.call(Request::builder().finish()).await.unwrap();

        let body = metrics_endpoint()
            .call(Request::builder().finish())
            .await
            .unwrap()
            .into_body()
            .into_string()
            .await
            .unwrap();
        assert!(body.contains("micro_request_duration_seconds"));
    }
}
