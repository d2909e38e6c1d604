//! Kubelet-compatible endpoints.
//!
//! Provides:
//! - GET /healthz
//! - GET /pods, GET /runningpods/
//! - GET /containerLogs/{namespace}/{pod}/{container}
//! - GET|POST /exec/{namespace}/{pod}/{container} (WebSocket)
//! - GET /stats/summary, GET /metrics/resource

use axum::{
    body::Body,
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        FromRequestParts, Path, Query, Request, State,
    },
    http::{header::CONTENT_TYPE, Method},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures_util::{stream, SinkExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::List;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn, Instrument};

use crate::error::{Error, Result};
use crate::pod::PodKey;
use crate::provider::{ByteStream, ExecRequest, LogOptions, StatsSummary};

use super::error::ApiError;
use super::AppState;

const STDIN_BUFFER: usize = 16;

fn pod_list(items: Vec<Pod>) -> List<Pod> {
    List {
        items,
        metadata: Default::default(),
    }
}

pub async fn healthz() -> &'static str {
    "ok"
}

/// Pods bound to this node, as last seen from the orchestrator.
pub async fn pods(State(state): State<AppState>) -> Json<List<Pod>> {
    let pods = state.cache.list().await.into_iter().map(|c| c.pod).collect();
    Json(pod_list(pods))
}

/// Pods the provider is actually running.
pub async fn running_pods(State(state): State<AppState>) -> Result<Json<List<Pod>>, ApiError> {
    let ctx = state.ctx.operation();
    let pods = state.provider.get_pods(&ctx).await?;
    Ok(Json(pod_list(pods)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogQuery {
    pub tail_lines: Option<i64>,
    pub follow: Option<bool>,
    pub timestamps: Option<bool>,
    pub limit_bytes: Option<i64>,
    pub since_seconds: Option<i64>,
}

impl From<LogQuery> for LogOptions {
    fn from(query: LogQuery) -> Self {
        Self {
            tail: query.tail_lines,
            follow: query.follow.unwrap_or(false),
            timestamps: query.timestamps.unwrap_or(false),
            limit_bytes: query.limit_bytes,
            since_seconds: query.since_seconds,
        }
    }
}

pub async fn container_logs(
    State(state): State<AppState>,
    Path((namespace, pod, container)): Path<(String, String, String)>,
    Query(query): Query<LogQuery>,
) -> Result<Response, ApiError> {
    let key = PodKey::new(namespace, pod);
    let options = LogOptions::from(query);
    info!(pod = %key, container = %container, follow = options.follow, "Streaming container logs");

    let ctx = state.ctx.operation().with_attribute("pod", &key);
    let logs = state
        .provider
        .get_container_logs(&ctx, &key, &container, &options)
        .await?;

    Response::builder()
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from_stream(logs))
        .map_err(|e| ApiError::internal("Internal", e.to_string()))
}

/// Exec query: `command` repeats once per argument.
fn exec_request(key: &PodKey, container: String, query: &[(String, String)]) -> Result<ExecRequest, ApiError> {
    let flag = |name: &str| {
        query
            .iter()
            .any(|(k, v)| k == name && matches!(v.as_str(), "1" | "true" | "True"))
    };
    let command: Vec<String> = query
        .iter()
        .filter(|(k, _)| k == "command")
        .map(|(_, v)| v.clone())
        .collect();
    if command.is_empty() {
        return Err(ApiError::bad_request("InvalidArgument", "at least one command is required"));
    }

    Ok(ExecRequest {
        namespace: key.namespace.clone(),
        pod_name: key.name.clone(),
        container_name: container,
        command,
        tty: flag("tty"),
        stdin: flag("input") || flag("stdin"),
    })
}

/// Upgrade to a WebSocket and proxy it to the provider's exec stream.
///
/// POST is accepted for clients that open the upgrade that way; it is
/// treated exactly like GET.
pub async fn exec(
    State(state): State<AppState>,
    Path((namespace, pod, container)): Path<(String, String, String)>,
    Query(query): Query<Vec<(String, String)>>,
    request: Request,
) -> Result<Response, ApiError> {
    let key = PodKey::new(namespace, pod);
    let exec = exec_request(&key, container, &query)?;

    let (mut parts, _) = request.into_parts();
    parts.method = Method::GET;
    let upgrade = WebSocketUpgrade::from_request_parts(&mut parts, &state)
        .await
        .map_err(|e| ApiError::bad_request("InvalidArgument", e.body_text()))?;

    info!(pod = %key, container = %exec.container_name, command = ?exec.command, tty = exec.tty, "Exec session accepted");
    let span = state.ctx.span("exec");
    Ok(upgrade.on_upgrade(move |socket| exec_session(socket, state, exec).instrument(span)))
}

async fn exec_session(socket: WebSocket, state: AppState, request: ExecRequest) {
    let ctx = state
        .ctx
        .operation()
        .with_attribute("pod", format!("{}/{}", request.namespace, request.pod_name));
    let (mut sender, mut receiver) = socket.split();

    let (stdin_tx, stdin_rx) = mpsc::channel::<Result<Bytes>>(STDIN_BUFFER);
    let (stdin, mut stdin_tx): (ByteStream, _) = if request.stdin {
        (ReceiverStream::new(stdin_rx).boxed(), Some(stdin_tx))
    } else {
        (stream::empty().boxed(), None)
    };

    let mut output = match state.provider.run_in_container(&ctx, &request, stdin).await {
        Ok(output) => output,
        Err(e) => {
            warn!(error = %e, "Exec failed to start");
            let frame = CloseFrame {
                code: close_code::ERROR,
                reason: e.to_string().into(),
            };
            let _ = sender.send(Message::Close(Some(frame))).await;
            return;
        }
    };

    let mut client_open = true;
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            chunk = output.next() => match chunk {
                Some(Ok(bytes)) => {
                    if sender.send(Message::Binary(bytes)).await.is_err() {
                        debug!("Exec client went away");
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Exec output stream failed");
                    break;
                }
                None => break,
            },
            frame = receiver.next(), if client_open => match frame {
                Some(Ok(Message::Binary(data))) => forward_stdin(&mut stdin_tx, data).await,
                Some(Ok(Message::Text(text))) => {
                    forward_stdin(&mut stdin_tx, Bytes::copy_from_slice(text.as_str().as_bytes())).await
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    client_open = false;
                    stdin_tx = None;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    debug!("Exec session closed");
}

async fn forward_stdin(stdin: &mut Option<mpsc::Sender<Result<Bytes>>>, data: Bytes) {
    if let Some(tx) = stdin {
        if tx.send(Ok(data)).await.is_err() {
            *stdin = None;
        }
    }
}

async fn stats(state: &AppState) -> Result<StatsSummary> {
    let ctx = state.ctx.operation();
    match state.provider.get_stats_summary(&ctx).await {
        Ok(summary) => Ok(summary.aggregated(&state.node_name)),
        Err(Error::NotFound(_)) => Ok(StatsSummary::empty(&state.node_name)),
        Err(e) => Err(e),
    }
}

pub async fn stats_summary(State(state): State<AppState>) -> Result<Json<StatsSummary>, ApiError> {
    Ok(Json(stats(&state).await?))
}

pub async fn metrics_resource(State(state): State<AppState>) -> Result<Response, ApiError> {
    let summary = match stats(&state).await {
        Ok(summary) => Some(summary),
        Err(e) => {
            warn!(error = %e, "Failed to scrape provider stats");
            None
        }
    };
    let body = state.metrics.render_resource(summary.as_ref())?;
    Ok((
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_exec_request_collects_repeated_command() {
        let key = PodKey::new("a", "p1");
        let request = exec_request(
            &key,
            "app".into(),
            &query(&[("command", "ls"), ("command", "-l"), ("input", "1"), ("tty", "false")]),
        )
        .unwrap();
        assert_eq!(request.command, vec!["ls", "-l"]);
        assert!(request.stdin);
        assert!(!request.tty);
        assert_eq!(request.pod_name, "p1");
    }

    #[test]
    fn test_exec_request_requires_command() {
        let key = PodKey::new("a", "p1");
        let err = exec_request(&key, "app".into(), &query(&[("tty", "1")])).unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_log_query_maps_to_options() {
        let options = LogOptions::from(LogQuery {
            tail_lines: Some(10),
            follow: Some(true),
            ..Default::default()
        });
        assert_eq!(options.tail, Some(10));
        assert!(options.follow);
        assert!(!options.timestamps);
    }
}
