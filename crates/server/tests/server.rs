use std::time::Duration;

use gear_server::{
    cors_handler, AllowOrigin, ClientIp, ClientIpExt, HandlerOptions, RunningServer, Server,
    ServerConfig, ServerError,
};
use poem::{
    endpoint::BoxEndpoint, handler, EndpointExt, IntoEndpoint, Request, Response, Route,
};
use reqwest::{header, Client, Method, StatusCode, Version};

#[handler]
fn whoami(ip: ClientIp) -> String {
    ip.to_string()
}

#[handler]
fn version(req: &Request) -> String {
    format!("{:?}", req.version())
}

#[handler]
fn gateway() -> &'static str {
    "gateway"
}

#[handler]
async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(2)).await;
    "slow"
}

/// Unary gRPC service answering with a raw frame, enough to exercise routing
/// without generated code.
struct Echo;

impl poem_grpc::Service for Echo {
    const NAME: &'static str = "test.Echo";
}

impl IntoEndpoint for Echo {
    type Endpoint = BoxEndpoint<'static, Response>;

    fn into_endpoint(self) -> Self::Endpoint {
        Route::new()
            .at("/Whoami", grpc_whoami)
            .at("/Slow", grpc_slow)
            .boxed()
    }
}

fn grpc_reply(message: &str) -> Response {
    let mut frame = vec![0];
    frame.extend_from_slice(&(message.len() as u32).to_be_bytes());
    frame.extend_from_slice(message.as_bytes());
    Response::builder()
        .content_type("application/grpc")
        .header("grpc-status", "0")
        .body(frame)
}

#[handler]
fn grpc_whoami(req: &Request) -> Response {
    let ip = req
        .client_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "missing".to_string());
    grpc_reply(&ip)
}

#[handler]
async fn grpc_slow() -> Response {
    tokio::time::sleep(Duration::from_secs(1)).await;
    grpc_reply("slow")
}

fn config() -> ServerConfig {
    ServerConfig {
        port: 0,
        otlp_tracing: false,
        ..Default::default()
    }
}

async fn start(config: ServerConfig) -> RunningServer {
    Server::new(config)
        .add_service(Echo)
        .gateway(
            Route::new()
                .at("/whoami", whoami)
                .at("/version", version)
                .at("/slow", slow)
                .at("/helloworld.Greeter/SayHello", gateway),
        )
        .start()
        .await
        .unwrap()
}

fn url(server: &RunningServer, path: &str) -> String {
    format!("http://127.0.0.1:{}{}", server.port(), path)
}

fn h2_client() -> Client {
    Client::builder().http2_prior_knowledge().build().unwrap()
}

/// Sends an empty unary call, returning the grpc-status and the message.
async fn grpc_call(url: String, forwarded_for: Option<&str>) -> (String, String) {
    let mut req = h2_client()
        .post(url)
        .header(header::CONTENT_TYPE, "application/grpc")
        .header(header::TE, "trailers")
        .body(vec![0u8; 5]);
    if let Some(forwarded_for) = forwarded_for {
        req = req.header("x-forwarded-for", forwarded_for);
    }
    let resp = req.send().await.unwrap();
    assert_eq!(resp.version(), Version::HTTP_2);

    let status = resp
        .headers()
        .get("grpc-status")
        .map(|value| value.to_str().unwrap().to_string())
        .unwrap_or_default();
    let body = resp.bytes().await.unwrap();
    let message = String::from_utf8(body.get(5..).unwrap_or_default().to_vec()).unwrap();
    (status, message)
}

#[tokio::test(flavor = "multi_thread")]
async fn resolves_client_ip_from_forwarded_header_and_peer() {
    let mut server = start(config()).await;
    assert_ne!(server.port(), 0);
    let client = Client::new();

    let resp = client
        .get(url(&server, "/whoami"))
        .header("X-Forwarded-For", "203.0.113.42, 70.41.3.18")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "203.0.113.42");

    let resp = client.get(url(&server, "/whoami")).send().await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "127.0.0.1");

    let resp = client
        .get(url(&server, "/whoami"))
        .header("x-forwarded-for", "not-an-ip, 203.0.113.42")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "127.0.0.1");

    server.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn serves_http1_and_h2c_on_one_port() {
    let mut server = start(config()).await;

    let resp = Client::new()
        .get(url(&server, "/version"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.version(), Version::HTTP_11);
    assert_eq!(resp.text().await.unwrap(), "HTTP/1.1");

    let resp = h2_client()
        .get(url(&server, "/version"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.version(), Version::HTTP_2);
    assert_eq!(resp.text().await.unwrap(), "HTTP/2.0");

    server.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn grpc_content_type_needs_http2_to_reach_grpc() {
    let mut server = start(config()).await;
    let path = "/helloworld.Greeter/SayHello";

    let resp = Client::new()
        .post(url(&server, path))
        .header(header::CONTENT_TYPE, "application/grpc+proto")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "gateway");

    let resp = h2_client()
        .post(url(&server, path))
        .header(header::CONTENT_TYPE, "application/json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "gateway");

    // The gRPC router has no such service.
    let resp = h2_client()
        .post(url(&server, path))
        .header(header::CONTENT_TYPE, "application/grpc+proto")
        .send()
        .await
        .unwrap();
    assert_ne!(resp.text().await.unwrap(), "gateway");

    server.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cors_preflight_and_allow_list() {
    let mut server = start(ServerConfig {
        handler_factory: std::sync::Arc::new(cors_handler),
        handler_options: Some(HandlerOptions {
            allow_origin: AllowOrigin::list(["https://app.example.com"]),
            additional_allowed_headers: vec!["X-Tenant".to_string()],
        }),
        ..config()
    })
    .await;
    let client = Client::new();

    // Preflight never reaches the gateway, which has no such route.
    let resp = client
        .request(Method::OPTIONS, url(&server, "/no-such-route"))
        .header(header::ORIGIN, "https://app.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://app.example.com"
    );
    assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    assert!(resp.headers()[header::ACCESS_CONTROL_ALLOW_HEADERS]
        .to_str()
        .unwrap()
        .ends_with("X-Tenant"));
    assert_eq!(resp.text().await.unwrap(), "");

    let resp = client
        .get(url(&server, "/whoami"))
        .header(header::ORIGIN, "https://evil.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "");
    assert_eq!(resp.text().await.unwrap(), "127.0.0.1");

    server.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_closes_the_listener() {
    let mut server = start(config()).await;
    let url = url(&server, "/whoami");
    assert!(Client::new().get(&url).send().await.is_ok());

    server.shutdown(Duration::from_secs(5)).await.unwrap();

    let client = Client::builder().pool_max_idle_per_host(0).build().unwrap();
    assert!(client.get(&url).send().await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn grpc_service_sees_client_ip() {
    let mut server = start(config()).await;
    let method = url(&server, "/test.Echo/Whoami");

    let (status, message) = grpc_call(method.clone(), Some("203.0.113.42, 70.41.3.18")).await;
    assert_eq!(status, "0");
    assert_eq!(message, "203.0.113.42");

    let (status, message) = grpc_call(method, None).await;
    assert_eq!(status, "0");
    assert_eq!(message, "127.0.0.1");

    server.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_rejects_new_grpc_calls_while_draining() {
    let mut server = start(config()).await;
    let whoami_url = url(&server, "/whoami");
    let grpc_whoami_url = url(&server, "/test.Echo/Whoami");

    let in_flight = tokio::spawn(grpc_call(url(&server, "/test.Echo/Slow"), None));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let shutdown = tokio::spawn(async move { server.shutdown(Duration::from_secs(5)).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Draining: new gRPC calls are refused, HTTP is still served.
    let (status, message) = grpc_call(grpc_whoami_url, None).await;
    assert_eq!(status, "14");
    assert_eq!(message, "");
    let resp = Client::new().get(&whoami_url).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(!shutdown.is_finished());

    let (status, message) = in_flight.await.unwrap();
    assert_eq!(status, "0");
    assert_eq!(message, "slow");
    shutdown.await.unwrap().unwrap();

    let client = Client::builder().pool_max_idle_per_host(0).build().unwrap();
    assert!(client.get(&whoami_url).send().await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_deadline_expires_then_retry_succeeds() {
    let mut server = start(config()).await;

    let in_flight = tokio::spawn(Client::new().get(url(&server, "/slow")).send());
    tokio::time::sleep(Duration::from_millis(200)).await;

    let res = server.shutdown(Duration::from_millis(300)).await;
    assert!(matches!(res, Err(ServerError::ShutdownTimeout)));

    server.shutdown(Duration::from_secs(5)).await.unwrap();
    let resp = in_flight.await.unwrap().unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "slow");
}

#[tokio::test(flavor = "multi_thread")]
async fn h2c_upgrade_is_served_as_http1() {
    let mut server = start(config()).await;

    let resp = Client::new()
        .get(url(&server, "/version"))
        .header(header::CONNECTION, "Upgrade, HTTP2-Settings")
        .header(header::UPGRADE, "h2c")
        .header("HTTP2-Settings", "AAMAAABkAARAAAAAAAIAAAAA")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.version(), Version::HTTP_11);
    assert_eq!(resp.text().await.unwrap(), "HTTP/1.1");

    server.shutdown(Duration::from_secs(5)).await.unwrap();
}
