//! Container environment resolution.
//!
//! Providers receive literal environments: `envFrom` sources and
//! `valueFrom` references to config maps, secrets and pod fields are
//! expanded against the orchestrator before a pod is created or updated.
//! Explicit `env` entries win over names imported through `envFrom`.
//!
//! A missing mandatory reference is an `InvalidArgument`; a missing
//! optional one is skipped and reported as a warning event.

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::core::v1::{Container, EnvVar, Pod};
use tracing::{debug, warn};

use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::orchestrator::{EventRecord, Orchestrator};
use crate::pod::PodKey;

pub const REASON_OPTIONAL_CONFIG_MAP_NOT_FOUND: &str = "OptionalConfigMapNotFound";
pub const REASON_OPTIONAL_CONFIG_MAP_KEY_NOT_FOUND: &str = "OptionalConfigMapKeyNotFound";
pub const REASON_FAILED_TO_READ_OPTIONAL_CONFIG_MAP: &str = "FailedToReadOptionalConfigMap";
pub const REASON_OPTIONAL_SECRET_NOT_FOUND: &str = "OptionalSecretNotFound";
pub const REASON_OPTIONAL_SECRET_KEY_NOT_FOUND: &str = "OptionalSecretKeyNotFound";
pub const REASON_FAILED_TO_READ_OPTIONAL_SECRET: &str = "FailedToReadOptionalSecret";
pub const REASON_INVALID_ENV_NAMES: &str = "InvalidEnvironmentVariableNames";

/// A pod with literal container environments, plus the warnings raised
/// while expanding them.
#[derive(Debug, Clone)]
pub struct ResolvedEnv {
    pub pod: Pod,
    pub warnings: Vec<EventRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Source {
    ConfigMap,
    Secret,
}

impl Source {
    fn noun(self) -> &'static str {
        match self {
            Self::ConfigMap => "configmap",
            Self::Secret => "secret",
        }
    }

    fn not_found_reason(self) -> &'static str {
        match self {
            Self::ConfigMap => REASON_OPTIONAL_CONFIG_MAP_NOT_FOUND,
            Self::Secret => REASON_OPTIONAL_SECRET_NOT_FOUND,
        }
    }

    fn key_not_found_reason(self) -> &'static str {
        match self {
            Self::ConfigMap => REASON_OPTIONAL_CONFIG_MAP_KEY_NOT_FOUND,
            Self::Secret => REASON_OPTIONAL_SECRET_KEY_NOT_FOUND,
        }
    }

    fn unreadable_reason(self) -> &'static str {
        match self {
            Self::ConfigMap => REASON_FAILED_TO_READ_OPTIONAL_CONFIG_MAP,
            Self::Secret => REASON_FAILED_TO_READ_OPTIONAL_SECRET,
        }
    }
}

type Data = BTreeMap<String, String>;

/// Expand every container's environment in `pod`.
///
/// Containers without `envFrom` or `valueFrom` entries are left as they are.
pub async fn resolve_env(
    ctx: &OpContext,
    orchestrator: &dyn Orchestrator,
    pod: &Pod,
) -> Result<ResolvedEnv> {
    let mut resolver = Resolver {
        ctx,
        orchestrator,
        pod,
        namespace: PodKey::of(pod).namespace,
        fetched: HashMap::new(),
        warnings: Vec::new(),
    };

    let mut resolved = pod.clone();
    if let Some(spec) = resolved.spec.as_mut() {
        for container in spec.init_containers.iter_mut().flatten() {
            resolver.container(container).await?;
        }
        for container in spec.containers.iter_mut() {
            resolver.container(container).await?;
        }
    }

    Ok(ResolvedEnv {
        pod: resolved,
        warnings: resolver.warnings,
    })
}

struct Resolver<'a> {
    ctx: &'a OpContext,
    orchestrator: &'a dyn Orchestrator,
    pod: &'a Pod,
    namespace: String,
    /// `None` records a lookup that came back NotFound.
    fetched: HashMap<(Source, String), Option<Data>>,
    warnings: Vec<EventRecord>,
}

impl Resolver<'_> {
    async fn container(&mut self, container: &mut Container) -> Result<()> {
        let needs_expansion = container.env_from.as_ref().is_some_and(|e| !e.is_empty())
            || container
                .env
                .iter()
                .flatten()
                .any(|var| var.value_from.is_some());
        if !needs_expansion {
            return Ok(());
        }

        let imported = self.env_from(container).await?;
        let explicit = self.env(container).await?;

        let mut merged: Vec<EnvVar> = imported
            .into_iter()
            .filter(|(name, _)| !explicit.iter().any(|var| &var.name == name))
            .map(|(name, value)| literal(name, value))
            .collect();
        merged.extend(explicit);

        debug!(container = %container.name, vars = merged.len(), "Resolved container environment");
        container.env_from = None;
        container.env = Some(merged);
        Ok(())
    }

    /// Names imported through `envFrom`; later sources override earlier ones.
    async fn env_from(&mut self, container: &Container) -> Result<Data> {
        let mut env = Data::new();
        for source in container.env_from.iter().flatten() {
            let (kind, name, optional) = match (&source.config_map_ref, &source.secret_ref) {
                (Some(r), _) => (Source::ConfigMap, r.name.clone(), r.optional),
                (None, Some(r)) => (Source::Secret, r.name.clone(), r.optional),
                (None, None) => continue,
            };
            let name = name.unwrap_or_default();
            let optional = optional.unwrap_or(false);

            let Some(data) = self.lookup(kind, &name, optional, None).await? else {
                continue;
            };

            let prefix = source.prefix.as_deref().unwrap_or_default();
            let mut invalid = Vec::new();
            for (key, value) in data {
                let key = format!("{prefix}{key}");
                if is_env_var_name(&key) {
                    env.insert(key, value);
                } else {
                    invalid.push(key);
                }
            }
            if !invalid.is_empty() {
                self.warn(
                    REASON_INVALID_ENV_NAMES,
                    format!(
                        "keys [{}] from {} {}/{} were skipped since they are invalid as environment variable names",
                        invalid.join(", "),
                        kind.noun(),
                        self.namespace,
                        name
                    ),
                );
            }
        }
        Ok(env)
    }

    /// Explicit `env` entries with every `valueFrom` replaced by its value.
    async fn env(&mut self, container: &Container) -> Result<Vec<EnvVar>> {
        let mut env = Vec::new();
        for var in container.env.iter().flatten() {
            let Some(from) = &var.value_from else {
                env.push(var.clone());
                continue;
            };

            let (kind, selector) = match (&from.config_map_key_ref, &from.secret_key_ref) {
                (Some(s), _) => (Source::ConfigMap, (s.name.clone(), s.key.clone(), s.optional)),
                (None, Some(s)) => (Source::Secret, (s.name.clone(), s.key.clone(), s.optional)),
                (None, None) => {
                    if let Some(field) = &from.field_ref {
                        env.push(literal(var.name.clone(), field_value(self.pod, &field.field_path)?));
                    } else {
                        // Resource references are left for the provider.
                        env.push(var.clone());
                    }
                    continue;
                }
            };
            let (name, key, optional) = selector;
            let name = name.unwrap_or_default();
            let optional = optional.unwrap_or(false);

            let Some(data) = self.lookup(kind, &name, optional, Some(&var.name)).await? else {
                continue;
            };
            match data.get(&key) {
                Some(value) => env.push(literal(var.name.clone(), value.clone())),
                None if optional => self.warn(
                    kind.key_not_found_reason(),
                    format!(
                        "skipping optional envvar {:?}: key {key:?} does not exist in {} {name:?}",
                        var.name,
                        kind.noun()
                    ),
                ),
                None => {
                    return Err(Error::InvalidArgument(format!(
                        "{} {name:?} doesn't contain the {key:?} key required by pod {}",
                        kind.noun(),
                        PodKey::of(self.pod)
                    )))
                }
            }
        }
        Ok(env)
    }

    /// Fetch a config map or secret, applying the optional/mandatory rules.
    ///
    /// `Ok(None)` means the reference is optional and was skipped.
    async fn lookup(
        &mut self,
        kind: Source,
        name: &str,
        optional: bool,
        var: Option<&str>,
    ) -> Result<Option<Data>> {
        let skipping = var
            .map(|v| format!("skipping optional envvar {v:?}: "))
            .unwrap_or_default();

        match self.fetch(kind, name).await {
            Ok(Some(data)) => Ok(Some(data)),
            Ok(None) if optional => {
                self.warn(
                    kind.not_found_reason(),
                    format!("{skipping}{} {name:?} not found", kind.noun()),
                );
                Ok(None)
            }
            Ok(None) => Err(Error::InvalidArgument(format!(
                "{} {name:?} not found",
                kind.noun()
            ))),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) if optional => {
                warn!(kind = kind.noun(), name, error = %e, "Failed to read optional environment source");
                self.warn(
                    kind.unreadable_reason(),
                    format!("{skipping}failed to read {} {name:?}", kind.noun()),
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch(&mut self, kind: Source, name: &str) -> Result<Option<Data>> {
        let cache_key = (kind, name.to_string());
        if let Some(cached) = self.fetched.get(&cache_key) {
            return Ok(cached.clone());
        }

        let result = match kind {
            Source::ConfigMap => self
                .orchestrator
                .get_config_map(self.ctx, &self.namespace, name)
                .await
                .map(|cm| cm.data.unwrap_or_default()),
            Source::Secret => self
                .orchestrator
                .get_secret(self.ctx, &self.namespace, name)
                .await
                .map(|secret| {
                    secret
                        .data
                        .unwrap_or_default()
                        .into_iter()
                        .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
                        .collect()
                }),
        };

        let data = match result {
            Ok(data) => Some(data),
            Err(Error::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        self.fetched.insert(cache_key, data.clone());
        Ok(data)
    }

    fn warn(&mut self, reason: &str, message: String) {
        self.warnings.push(EventRecord::warning(reason, message));
    }
}

fn literal(name: String, value: String) -> EnvVar {
    EnvVar {
        name,
        value: Some(value),
        value_from: None,
    }
}

/// Downward API value for `path`.
fn field_value(pod: &Pod, path: &str) -> Result<String> {
    let meta = &pod.metadata;
    let spec = pod.spec.as_ref();
    let status = pod.status.as_ref();

    let bracketed = |prefix: &str| {
        path.strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix("['"))
            .and_then(|rest| rest.strip_suffix("']"))
    };

    let value = match path {
        "metadata.name" => meta.name.clone(),
        "metadata.namespace" => meta.namespace.clone(),
        "metadata.uid" => meta.uid.clone(),
        "spec.nodeName" => spec.and_then(|s| s.node_name.clone()),
        "spec.serviceAccountName" => spec.and_then(|s| s.service_account_name.clone()),
        "status.podIP" => status.and_then(|s| s.pod_ip.clone()),
        "status.hostIP" => status.and_then(|s| s.host_ip.clone()),
        _ => {
            if let Some(label) = bracketed("metadata.labels") {
                meta.labels.as_ref().and_then(|l| l.get(label).cloned())
            } else if let Some(annotation) = bracketed("metadata.annotations") {
                meta.annotations.as_ref().and_then(|a| a.get(annotation).cloned())
            } else {
                return Err(Error::InvalidArgument(format!(
                    "unsupported field path {path:?}"
                )));
            }
        }
    };
    Ok(value.unwrap_or_default())
}

/// `[-._a-zA-Z][-._a-zA-Z0-9]*`
fn is_env_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    let valid_rest = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_');
    match chars.next() {
        Some(first) if valid_rest(first) && !first.is_ascii_digit() => chars.all(valid_rest),
        _ => false,
    }
}
