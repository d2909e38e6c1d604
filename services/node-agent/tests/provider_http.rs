//! Provider protocol client against a stub HTTP server.

use std::time::Duration;

use futures_util::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rstest::rstest;
use vnode_agent::provider::LogOptions;
use vnode_agent::{Error, HttpProvider, OpContext, PodKey, Provider};
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn pod() -> Pod {
    Pod {
        metadata: ObjectMeta {
            namespace: Some("a".into()),
            name: Some("p1".into()),
            uid: Some("U1".into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn provider(server: &MockServer) -> HttpProvider {
    HttpProvider::new(&server.uri(), Duration::from_secs(2)).unwrap()
}

#[rstest]
#[case(400, "InvalidArgument")]
#[case(404, "NotFound")]
#[case(409, "Conflict")]
#[case(422, "InvalidArgument")]
#[case(429, "Retryable")]
#[case(500, "Retryable")]
#[case(503, "Retryable")]
#[case(418, "Internal")]
#[tokio::test]
async fn test_status_codes_map_to_error_kinds(#[case] status: u16, #[case] kind: &str) {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/updatePod"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;

    let err = provider(&server)
        .await
        .update_pod(&OpContext::background(), &pod())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), kind);
}

#[tokio::test]
async fn test_create_sends_pod_and_maps_conflict_to_already_exists() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/createPod"))
        .and(body_partial_json(serde_json::json!({
            "metadata": { "namespace": "a", "name": "p1", "uid": "U1" }
        })))
        .respond_with(ResponseTemplate::new(409))
        .expect(1)
        .mount(&server)
        .await;

    let err = provider(&server)
        .await
        .create_pod(&OpContext::background(), &pod())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)), "{err:?}");
}

#[tokio::test]
async fn test_error_body_message_and_code_are_kept() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/createPod"))
        .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
            "message": "image pull failed",
            "code": "ErrImagePull"
        })))
        .mount(&server)
        .await;

    let err = provider(&server)
        .await
        .create_pod(&OpContext::background(), &pod())
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    let text = err.to_string();
    assert!(text.contains("image pull failed"), "{text}");
    assert!(text.contains("ErrImagePull"), "{text}");
}

#[tokio::test]
async fn test_oversized_error_body_is_truncated() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/getPod"))
        .respond_with(ResponseTemplate::new(500).set_body_string("x".repeat(2_000_000)))
        .mount(&server)
        .await;

    let err = provider(&server)
        .await
        .get_pod(&OpContext::background(), &PodKey::new("a", "p1"))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(err.to_string().len() < 1_100_000);
}

#[tokio::test]
async fn test_get_pod_sends_namespace_and_name() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/getPod"))
        .and(query_param("namespace", "a"))
        .and(query_param("name", "p1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(pod()))
        .expect(1)
        .mount(&server)
        .await;

    let found = provider(&server)
        .await
        .get_pod(&OpContext::background(), &PodKey::new("a", "p1"))
        .await
        .unwrap();
    assert_eq!(found.metadata.uid.as_deref(), Some("U1"));
}

#[tokio::test]
async fn test_null_pod_list_is_empty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/getPods"))
        .respond_with(ResponseTemplate::new(200).set_body_string("null"))
        .mount(&server)
        .await;

    let pods = provider(&server)
        .await
        .get_pods(&OpContext::background())
        .await
        .unwrap();
    assert!(pods.is_empty());
}

#[tokio::test]
async fn test_delete_of_missing_pod_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/deletePod"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    provider(&server)
        .await
        .delete_pod(&OpContext::background(), &pod())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_missing_stats_endpoint_is_not_found() {
    let server = MockServer::start().await;

    let err = provider(&server)
        .await
        .get_stats_summary(&OpContext::background())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "{err:?}");
}

#[tokio::test]
async fn test_container_logs_stream_with_options() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/getContainerLogs"))
        .and(query_param("namespace", "a"))
        .and(query_param("podName", "p1"))
        .and(query_param("containerName", "app"))
        .and(query_param("tail", "10"))
        .and(query_param("follow", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_string("line 1\nline 2\n"))
        .expect(1)
        .mount(&server)
        .await;

    let options = LogOptions {
        tail: Some(10),
        follow: true,
        ..Default::default()
    };
    let stream = provider(&server)
        .await
        .get_container_logs(&OpContext::background(), &PodKey::new("a", "p1"), "app", &options)
        .await
        .unwrap();
    let chunks: Vec<_> = stream.try_collect().await.unwrap();
    assert_eq!(chunks.concat(), b"line 1\nline 2\n");
}

#[tokio::test]
async fn test_unreachable_provider_is_retryable() {
    // Nothing listens on the discard port.
    let provider = HttpProvider::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
    let err = provider
        .capacity(&OpContext::background())
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "{err:?}");
}

#[tokio::test]
async fn test_cancelled_context_aborts_call() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/capacity"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let ctx = OpContext::background();
    ctx.cancel();
    let err = provider(&server).await.capacity(&ctx).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled), "{err:?}");
}
