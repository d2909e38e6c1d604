//! Orchestrator adapter for a Kubernetes-compatible API server.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Event, EventSource, Node, NodeStatus, ObjectReference, Pod, PodStatus, Secret,
    Taint,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta, Time};
use kube::api::{
    Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions, WatchEvent,
    WatchParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::ErrorResponse;
use kube::{Client, Config};
use reqwest::StatusCode;
use serde_json::json;
use tracing::{debug, info};

use super::{
    EventRecord, Orchestrator, PodEvent, PodEventStream, PodList, LEASE_NAMESPACE,
};
use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::pod::{self, PodKey};

/// Server-side watch timeout; the watcher reconnects afterwards.
const WATCH_TIMEOUT_SECS: u32 = 290;

const COMPONENT: &str = "virtual-node";

/// Orchestrator backed by a `kube` client.
#[derive(Clone)]
pub struct KubeOrchestrator {
    client: Client,
    node_name: String,
    timeout: Duration,
}

impl KubeOrchestrator {
    /// Build a client from `kubeconfig`, or from the in-cluster / default
    /// configuration when no path is given.
    pub async fn connect(
        kubeconfig: Option<&Path>,
        node_name: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let client = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::Config(format!("failed to read kubeconfig {}: {e}", path.display()))
                })?;
                let config =
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .map_err(|e| Error::Config(format!("invalid kubeconfig: {e}")))?;
                Client::try_from(config)
                    .map_err(|e| Error::Config(format!("failed to build client: {e}")))?
            }
            None => Client::try_default()
                .await
                .map_err(|e| Error::Config(format!("failed to infer cluster config: {e}")))?,
        };

        info!(node = node_name, "Connected to orchestrator");
        Ok(Self::new(client, node_name, timeout))
    }

    pub fn new(client: Client, node_name: &str, timeout: Duration) -> Self {
        Self {
            client,
            node_name: node_name.to_string(),
            timeout,
        }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    /// Run one API call under the orchestrator deadline.
    async fn call<T, F>(&self, ctx: &OpContext, fut: F) -> Result<T>
    where
        F: Future<Output = kube::Result<T>> + Send,
    {
        ctx.run(Some(self.timeout), async { fut.await.map_err(from_kube) })
            .await
    }
}

fn node_selector(node: &str) -> String {
    format!("spec.nodeName={node}")
}

fn from_response(response: ErrorResponse) -> Error {
    let message = format!("{} ({})", response.message, response.reason);
    match StatusCode::from_u16(response.code) {
        Ok(status) => Error::from_status(status, message, response.reason == "AlreadyExists"),
        Err(_) => Error::Internal(message),
    }
}

fn from_kube(err: kube::Error) -> Error {
    match err {
        kube::Error::Api(response) => from_response(response),
        kube::Error::SerdeError(e) => Error::Internal(format!("malformed API response: {e}")),
        other => Error::Retryable(other.to_string()),
    }
}

fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(Error::NotFound(_)) => Ok(()),
        other => other,
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn list_pods(&self, ctx: &OpContext, node: &str) -> Result<PodList> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&node_selector(node));
        let list = self.call(ctx, api.list(&params)).await?;
        Ok(PodList {
            resource_version: list.metadata.resource_version,
            pods: list.items,
        })
    }

    async fn watch_pods(
        &self,
        ctx: &OpContext,
        node: &str,
        resource_version: &str,
    ) -> Result<PodEventStream> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = WatchParams::default()
            .fields(&node_selector(node))
            .timeout(WATCH_TIMEOUT_SECS);
        let stream = self.call(ctx, api.watch(&params, resource_version)).await?;

        Ok(stream
            .map(|event| match event {
                Ok(WatchEvent::Added(pod)) => Ok(PodEvent::Added(pod)),
                Ok(WatchEvent::Modified(pod)) => Ok(PodEvent::Modified(pod)),
                Ok(WatchEvent::Deleted(pod)) => Ok(PodEvent::Deleted(pod)),
                Ok(WatchEvent::Bookmark(bookmark)) => {
                    Ok(PodEvent::Bookmark(bookmark.metadata.resource_version))
                }
                Ok(WatchEvent::Error(response)) => Err(from_response(response)),
                Err(e) => Err(from_kube(e)),
            })
            .boxed())
    }

    async fn get_pod(&self, ctx: &OpContext, key: &PodKey) -> Result<Pod> {
        self.call(ctx, self.pods(&key.namespace).get(&key.name)).await
    }

    async fn patch_pod_status(&self, ctx: &OpContext, pod: &Pod, status: &PodStatus) -> Result<Pod> {
        let key = PodKey::of(pod);
        let patch = json!({
            "metadata": { "resourceVersion": pod.metadata.resource_version },
            "status": status,
        });
        let api = self.pods(&key.namespace);
        self.call(
            ctx,
            api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
    }

    async fn remove_pod_finalizers_and_delete(&self, ctx: &OpContext, pod: &Pod) -> Result<()> {
        let key = PodKey::of(pod);
        let api = self.pods(&key.namespace);

        if pod.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
            let patch = json!({ "metadata": { "finalizers": null } });
            let result = self
                .call(ctx, api.patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch)))
                .await
                .map(|_| ());
            ignore_not_found(result)?;
            debug!(pod = %key, "Removed pod finalizers");
        }

        let params = DeleteParams {
            grace_period_seconds: Some(0),
            preconditions: pod::uid(pod).map(|uid| Preconditions {
                uid: Some(uid.to_string()),
                resource_version: None,
            }),
            ..Default::default()
        };
        let result = self
            .call(ctx, api.delete(&key.name, &params))
            .await
            .map(|_| ());
        ignore_not_found(result)
    }

    async fn create_event(&self, ctx: &OpContext, pod: &Pod, event: &EventRecord) -> Result<()> {
        let key = PodKey::of(pod);
        let now = Time(Utc::now());
        let object = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}.", key.name)),
                namespace: Some(key.namespace.clone()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Pod".to_string()),
                name: Some(key.name.clone()),
                namespace: Some(key.namespace.clone()),
                uid: pod.metadata.uid.clone(),
                resource_version: pod.metadata.resource_version.clone(),
                ..Default::default()
            },
            reason: Some(event.reason.clone()),
            message: Some(event.message.clone()),
            type_: Some(event.event_type.as_str().to_string()),
            count: Some(1),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            source: Some(EventSource {
                component: Some(COMPONENT.to_string()),
                host: Some(self.node_name.clone()),
            }),
            reporting_component: Some(COMPONENT.to_string()),
            reporting_instance: Some(self.node_name.clone()),
            ..Default::default()
        };

        let api: Api<Event> = Api::namespaced(self.client.clone(), &key.namespace);
        self.call(ctx, api.create(&PostParams::default(), &object))
            .await
            .map(|_| ())
    }

    async fn get_config_map(&self, ctx: &OpContext, namespace: &str, name: &str) -> Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        self.call(ctx, api.get(name)).await
    }

    async fn get_secret(&self, ctx: &OpContext, namespace: &str, name: &str) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        self.call(ctx, api.get(name)).await
    }

    async fn create_node(&self, ctx: &OpContext, node: &Node) -> Result<Node> {
        let api = self.nodes();
        self.call(ctx, api.create(&PostParams::default(), node)).await
    }

    async fn get_node(&self, ctx: &OpContext, name: &str) -> Result<Node> {
        let api = self.nodes();
        self.call(ctx, api.get(name)).await
    }

    async fn patch_node_status(&self, ctx: &OpContext, name: &str, status: &NodeStatus) -> Result<Node> {
        let api = self.nodes();
        let patch = json!({ "status": status });
        self.call(
            ctx,
            api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
    }

    async fn cordon_node(&self, ctx: &OpContext, name: &str, taint: &Taint) -> Result<()> {
        let api = self.nodes();
        let node = self.call(ctx, api.get(name)).await?;

        let mut taints = node.spec.and_then(|s| s.taints).unwrap_or_default();
        if !taints
            .iter()
            .any(|t| t.key == taint.key && t.effect == taint.effect)
        {
            taints.push(taint.clone());
        }

        let patch = json!({ "spec": { "unschedulable": true, "taints": taints } });
        self.call(ctx, api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)))
            .await
            .map(|_| ())
    }

    async fn delete_node(&self, ctx: &OpContext, name: &str) -> Result<()> {
        let api = self.nodes();
        let result = self
            .call(ctx, api.delete(name, &DeleteParams::default()))
            .await
            .map(|_| ());
        ignore_not_found(result)
    }

    async fn renew_lease(&self, ctx: &OpContext, name: &str, duration_secs: i32) -> Result<()> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), LEASE_NAMESPACE);
        let now = MicroTime(Utc::now());

        match self.call(ctx, api.get_opt(name)).await? {
            Some(mut lease) => {
                let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
                spec.holder_identity = Some(name.to_string());
                spec.lease_duration_seconds = Some(duration_secs);
                spec.renew_time = Some(now);
                self.call(ctx, api.replace(name, &PostParams::default(), &lease))
                    .await
                    .map(|_| ())
            }
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(LEASE_NAMESPACE.to_string()),
                        ..Default::default()
                    },
                    spec: Some(LeaseSpec {
                        holder_identity: Some(name.to_string()),
                        lease_duration_seconds: Some(duration_secs),
                        acquire_time: Some(now.clone()),
                        renew_time: Some(now),
                        ..Default::default()
                    }),
                };
                info!(node = name, "Creating node lease");
                self.call(ctx, api.create(&PostParams::default(), &lease))
                    .await
                    .map(|_| ())
            }
        }
    }

    async fn review_token(&self, ctx: &OpContext, token: &str) -> Result<Option<String>> {
        let api: Api<TokenReview> = Api::all(self.client.clone());
        let review = TokenReview {
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: None,
            },
            ..Default::default()
        };
        let result = self.call(ctx, api.create(&PostParams::default(), &review)).await?;

        let status = result.status.unwrap_or_default();
        if status.authenticated != Some(true) {
            debug!(error = ?status.error, "Token review rejected bearer token");
            return Ok(None);
        }
        Ok(Some(
            status.user.and_then(|u| u.username).unwrap_or_default(),
        ))
    }
}
