//! Inbound API routes and authentication.

use std::pin::Pin;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_openssl::SslStream;
use tower::ServiceExt;
use vnode_agent::metrics::Metrics;
use vnode_agent::provider::{CpuStats, PodReference, PodStats, StatsSummary};
use vnode_agent::server::{self, AppState};
use vnode_agent::{MockOrchestrator, MockProvider, OpContext, PodCache, PodKey};

mod support;

struct Api {
    provider: Arc<MockProvider>,
    orchestrator: Arc<MockOrchestrator>,
    cache: Arc<PodCache>,
    state: AppState,
}

impl Api {
    fn new(anonymous_auth: bool) -> Self {
        let provider = Arc::new(MockProvider::new());
        let orchestrator = Arc::new(MockOrchestrator::new());
        let cache = Arc::new(PodCache::new());
        let state = AppState {
            provider: provider.clone(),
            orchestrator: orchestrator.clone(),
            cache: cache.clone(),
            metrics: Metrics::new().unwrap(),
            node_name: support::NODE.to_string(),
            anonymous_auth,
            ctx: OpContext::background(),
        };
        Self {
            provider,
            orchestrator,
            cache,
            state,
        }
    }

    fn router(&self) -> Router {
        server::router(self.state.clone())
    }

    async fn get(&self, uri: &str, token: Option<&str>) -> (StatusCode, header::HeaderMap, String) {
        let mut request = Request::builder().uri(uri);
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let response = self
            .router()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }
}

#[tokio::test]
async fn test_healthz_needs_no_credentials() {
    let api = Api::new(false);
    let (status, _, body) = api.get("/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn test_missing_credentials_are_rejected_as_problem() {
    let api = Api::new(false);
    let (status, headers, body) = api.get("/pods", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        headers.get(header::CONTENT_TYPE).unwrap(),
        "application/problem+json"
    );
    assert!(headers.contains_key("x-request-id"));

    let problem: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(problem["status"], 401);
    assert_eq!(problem["code"], "Unauthorized");
    assert_eq!(
        problem["request_id"].as_str(),
        headers.get("x-request-id").and_then(|v| v.to_str().ok())
    );
}

#[tokio::test]
async fn test_reviewed_bearer_token_is_admitted() {
    let api = Api::new(false);
    api.orchestrator.allow_token("s3cret", "system:apiserver");

    let (status, _, _) = api.get("/pods", Some("wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, body) = api.get("/pods", Some("s3cret")).await;
    assert_eq!(status, StatusCode::OK);
    let list: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(list["items"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_pods_lists_cache_and_running_pods_lists_provider() {
    let api = Api::new(true);
    api.cache.upsert(support::pod("a", "p1", "U1", 1)).await;
    api.provider.insert_pod(support::pod("a", "p2", "U2", 1));

    let (status, _, body) = api.get("/pods", None).await;
    assert_eq!(status, StatusCode::OK);
    let list: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(list["items"][0]["metadata"]["name"], "p1");

    let (status, _, body) = api.get("/runningpods/", None).await;
    assert_eq!(status, StatusCode::OK);
    let list: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(list["items"][0]["metadata"]["name"], "p2");
}

#[tokio::test]
async fn test_container_logs_honour_tail_lines() {
    let api = Api::new(true);
    api.provider
        .set_logs(&PodKey::new("a", "p1"), "app", "one\ntwo\nthree\n");

    let (status, headers, body) = api.get("/containerLogs/a/p1/app?tailLines=2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    assert_eq!(body, "two\nthree\n");

    let (status, _, body) = api.get("/containerLogs/a/p1/sidecar", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let problem: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(problem["code"], "NotFound");
}

#[tokio::test]
async fn test_exec_without_command_is_bad_request() {
    let api = Api::new(true);
    let (status, _, _) = api.get("/exec/a/p1/app?tty=1", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stats_summary_is_empty_when_unsupported() {
    let api = Api::new(true);
    let (status, _, body) = api.get("/stats/summary", None).await;
    assert_eq!(status, StatusCode::OK);
    let summary: StatsSummary = serde_json::from_str(&body).unwrap();
    assert_eq!(summary, StatsSummary::empty(support::NODE));
}

#[tokio::test]
async fn test_resource_metrics_render_provider_stats() {
    let api = Api::new(true);
    api.provider.set_stats(StatsSummary {
        pods: vec![PodStats {
            pod_ref: PodReference {
                name: "p1".into(),
                namespace: "a".into(),
                uid: "U1".into(),
            },
            cpu: Some(CpuStats {
                time: Utc::now(),
                usage_nano_cores: Some(250_000_000),
                usage_core_nano_seconds: Some(3_000_000_000),
            }),
            ..Default::default()
        }],
        ..Default::default()
    });

    let (status, headers, body) = api.get("/metrics/resource", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .contains("version=0.0.4"));
    assert!(body.contains("scrape_error 0"), "{body}");
    assert!(
        body.contains(r#"pod_cpu_usage_seconds_total{namespace="a",pod="p1"} 3"#),
        "{body}"
    );
    assert!(body.contains("node_cpu_usage_seconds_total 3"), "{body}");
}

#[tokio::test]
async fn test_resource_metrics_flag_scrape_errors() {
    let api = Api::new(true);
    api.provider.fail_next(
        vnode_agent::provider::Operation::GetStatsSummary,
        vnode_agent::Error::Retryable("connection refused".into()),
    );

    let (status, _, body) = api.get("/metrics/resource", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("scrape_error 1"), "{body}");
}

#[tokio::test]
async fn test_serves_over_tls() {
    let api = Api::new(false);
    let pair = vnode_agent::tls::generate_self_signed("vn-1", &["localhost".to_string()]).unwrap();
    let acceptor = Arc::new(server::tls::build_acceptor(&pair, None).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let ctx = OpContext::background();
    let task = tokio::spawn(server::serve(ctx.clone(), listener, acceptor, api.router()));

    let request = |path: &str| {
        format!("GET {path} HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
    };
    let healthz = https_get(addr, &request("/healthz")).await;
    assert!(healthz.starts_with("HTTP/1.1 200"), "{healthz}");
    assert!(healthz.ends_with("ok"), "{healthz}");

    let pods = https_get(addr, &request("/pods")).await;
    assert!(pods.starts_with("HTTP/1.1 401"), "{pods}");

    ctx.cancel();
    task.await.unwrap().unwrap();
}

async fn https_get(addr: std::net::SocketAddr, request: &str) -> String {
    let mut connector = SslConnector::builder(SslMethod::tls()).unwrap();
    connector.set_verify(SslVerifyMode::NONE);
    let ssl = connector
        .build()
        .configure()
        .unwrap()
        .into_ssl("localhost")
        .unwrap();

    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut stream = SslStream::new(ssl, tcp).unwrap();
    Pin::new(&mut stream).connect().await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    // The server may drop the connection without close_notify.
    let _ = stream.read_to_end(&mut response).await;
    String::from_utf8_lossy(&response).into_owned()
}
