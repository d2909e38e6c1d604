//! HTTP client for the provider protocol.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{NodeAddress, NodeCondition, NodeDaemonEndpoints, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::{ByteStream, ErrorBody, ExecRequest, LogOptions, Provider, StatsSummary};
use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::pod::PodKey;

/// Default deadline for non-streaming calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Error bodies are read up to this many bytes.
const MAX_ERROR_BODY: usize = 1_000_000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const STDIN_BUFFER: usize = 16;

/// Provider client over HTTP/1.1. Cheap to clone and safe to share.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpProvider {
    /// Create a client for the provider at `endpoint`.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("invalid provider endpoint {endpoint:?}: {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .http1_only()
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::Internal(format!("invalid provider path {path:?}: {e}")))?;
        Ok(self
            .client
            .request(method, url)
            .header(CONTENT_TYPE, "application/json"))
    }

    /// Send and check the status; `creating` turns 409 into `AlreadyExists`.
    async fn send(request: RequestBuilder, creating: bool) -> Result<Response> {
        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(error_from_response(response, creating).await)
    }

    /// Non-streaming call: whole exchange under the client deadline.
    async fn call(&self, ctx: &OpContext, request: RequestBuilder, creating: bool) -> Result<Bytes> {
        ctx.run(Some(self.timeout), async move {
            let response = Self::send(request, creating).await?;
            Ok(response.bytes().await?)
        })
        .await
    }

    async fn get_json<T: DeserializeOwned>(&self, ctx: &OpContext, request: RequestBuilder) -> Result<T> {
        let body = self.call(ctx, request, false).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Streaming call: the deadline covers the response head only.
    async fn open_stream(&self, ctx: &OpContext, request: RequestBuilder) -> Result<ByteStream> {
        let response = ctx
            .run(Some(self.timeout), Self::send(request, false))
            .await?;
        let cancelled = ctx.token().clone().cancelled_owned();
        Ok(response
            .bytes_stream()
            .map_err(Error::from)
            .take_until(cancelled)
            .boxed())
    }

    fn pod_query(key: &PodKey) -> [(&'static str, String); 2] {
        [
            ("namespace", key.namespace.clone()),
            ("name", key.name.clone()),
        ]
    }
}

async fn error_from_response(mut response: Response, creating: bool) -> Error {
    let status = response.status();
    let mut body = BytesMut::new();
    while body.len() < MAX_ERROR_BODY {
        match response.chunk().await {
            Ok(Some(chunk)) => body.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Failed to read provider error body");
                break;
            }
        }
    }
    body.truncate(MAX_ERROR_BODY);

    let message = match serde_json::from_slice::<ErrorBody>(&body) {
        Ok(ErrorBody {
            message,
            code: Some(code),
        }) => format!("{message} (code {code})"),
        Ok(ErrorBody { message, code: None }) => message,
        Err(_) => {
            let text = String::from_utf8_lossy(&body).trim().to_string();
            if text.is_empty() {
                status.to_string()
            } else {
                text
            }
        }
    };

    Error::from_status(status, format!("provider returned {status}: {message}"), creating)
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create_pod(&self, ctx: &OpContext, pod: &Pod) -> Result<()> {
        let request = self.request(Method::POST, "/createPod")?.json(pod);
        self.call(ctx, request, true).await?;
        Ok(())
    }

    async fn update_pod(&self, ctx: &OpContext, pod: &Pod) -> Result<()> {
        let request = self.request(Method::PUT, "/updatePod")?.json(pod);
        self.call(ctx, request, false).await?;
        Ok(())
    }

    async fn delete_pod(&self, ctx: &OpContext, pod: &Pod) -> Result<()> {
        let request = self.request(Method::DELETE, "/deletePod")?.json(pod);
        match self.call(ctx, request, false).await {
            Ok(_) => Ok(()),
            Err(Error::NotFound(message)) => {
                debug!(detail = %message, "Provider reported pod already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn get_pod(&self, ctx: &OpContext, key: &PodKey) -> Result<Pod> {
        let request = self
            .request(Method::GET, "/getPod")?
            .query(&Self::pod_query(key));
        self.get_json(ctx, request).await
    }

    async fn get_pod_status(&self, ctx: &OpContext, key: &PodKey) -> Result<PodStatus> {
        let request = self
            .request(Method::GET, "/getPodStatus")?
            .query(&Self::pod_query(key));
        self.get_json(ctx, request).await
    }

    async fn get_pods(&self, ctx: &OpContext) -> Result<Vec<Pod>> {
        let request = self.request(Method::GET, "/getPods")?;
        let pods: Option<Vec<Pod>> = self.get_json(ctx, request).await?;
        Ok(pods.unwrap_or_default())
    }

    async fn get_container_logs(
        &self,
        ctx: &OpContext,
        key: &PodKey,
        container: &str,
        options: &LogOptions,
    ) -> Result<ByteStream> {
        let request = self
            .request(Method::GET, "/getContainerLogs")?
            .query(&[
                ("namespace", key.namespace.as_str()),
                ("podName", key.name.as_str()),
                ("containerName", container),
            ])
            .query(&options.query());
        self.open_stream(ctx, request).await
    }

    async fn run_in_container(
        &self,
        ctx: &OpContext,
        request: &ExecRequest,
        stdin: ByteStream,
    ) -> Result<ByteStream> {
        let mut header = serde_json::to_vec(request)?;
        header.push(b'\n');

        // The request body must be Sync; relay stdin through a channel.
        let (tx, rx) = mpsc::channel::<Result<Bytes>>(STDIN_BUFFER);
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(chunk) = stdin.next().await {
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });
        let body = stream::iter([Ok::<_, Error>(Bytes::from(header))]).chain(ReceiverStream::new(rx));

        let http_request = self
            .request(Method::POST, "/runInContainer")?
            .body(reqwest::Body::wrap_stream(body));
        self.open_stream(ctx, http_request).await
    }

    async fn capacity(&self, ctx: &OpContext) -> Result<BTreeMap<String, Quantity>> {
        let request = self.request(Method::GET, "/capacity")?;
        self.get_json(ctx, request).await
    }

    async fn node_conditions(&self, ctx: &OpContext) -> Result<Vec<NodeCondition>> {
        let request = self.request(Method::GET, "/nodeConditions")?;
        let conditions: Option<Vec<NodeCondition>> = self.get_json(ctx, request).await?;
        Ok(conditions.unwrap_or_default())
    }

    async fn node_addresses(&self, ctx: &OpContext) -> Result<Vec<NodeAddress>> {
        let request = self.request(Method::GET, "/nodeAddresses")?;
        let addresses: Option<Vec<NodeAddress>> = self.get_json(ctx, request).await?;
        Ok(addresses.unwrap_or_default())
    }

    async fn node_daemon_endpoints(&self, ctx: &OpContext) -> Result<NodeDaemonEndpoints> {
        let request = self.request(Method::GET, "/nodeDaemonEndpoints")?;
        self.get_json(ctx, request).await
    }

    async fn get_stats_summary(&self, ctx: &OpContext) -> Result<StatsSummary> {
        let request = self.request(Method::GET, "/getStatsSummary")?;
        match self.get_json(ctx, request).await {
            Err(Error::NotFound(message)) => {
                warn!(detail = %message, "Provider does not report stats");
                Err(Error::NotFound(message))
            }
            other => other,
        }
    }
}
