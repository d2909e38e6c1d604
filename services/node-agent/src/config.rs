//! Configuration for the virtual node agent.
//!
//! Every flag can also be set through a `VNODE_*` environment variable.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::error::{Error, Result};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// Virtual node agent configuration.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "virtual-node",
    version,
    about = "Registers a virtual cluster node and delegates its pods to an HTTP provider"
)]
pub struct Config {
    /// Name used for node registration.
    #[arg(long, env = "VNODE_NODENAME")]
    pub nodename: String,

    /// Base URL of the provider HTTP API.
    #[arg(long, env = "VNODE_PROVIDER_ENDPOINT")]
    pub provider_endpoint: String,

    /// Address of the inbound logs/exec/metrics API.
    #[arg(long, env = "VNODE_LISTEN_ADDR", default_value = "0.0.0.0:10250")]
    pub listen_addr: SocketAddr,

    /// Server certificate (PEM). Generated when absent.
    #[arg(long, env = "VNODE_CERT_FILE")]
    pub cert_file: Option<PathBuf>,

    /// Server private key (PEM). Generated when absent.
    #[arg(long, env = "VNODE_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    /// CA bundle used to verify client certificates on the inbound API.
    #[arg(long, env = "VNODE_CLIENT_CA_FILE")]
    pub client_ca_file: Option<PathBuf>,

    /// Disable inbound authentication (development only).
    #[arg(long, env = "VNODE_ANONYMOUS_AUTH")]
    pub anonymous_auth: bool,

    /// Directory for generated TLS material.
    #[arg(long, env = "VNODE_DATA_DIR", default_value = "/var/lib/virtual-node")]
    pub data_dir: PathBuf,

    /// Orchestrator credentials. Without it the in-cluster or default
    /// kubeconfig is used, which still honours `KUBECONFIG`.
    #[arg(long, env = "VNODE_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Number of reconciler workers.
    #[arg(long, env = "VNODE_WORKER_COUNT", default_value_t = 8)]
    pub worker_count: usize,

    #[arg(long, env = "VNODE_HEARTBEAT_INTERVAL", default_value = "30s", value_parser = parse_duration)]
    pub heartbeat_interval: Duration,

    #[arg(long, env = "VNODE_RESYNC_INTERVAL", default_value = "60s", value_parser = parse_duration)]
    pub resync_interval: Duration,

    /// How long drain waits for provider pods to disappear.
    #[arg(long, env = "VNODE_GRACEFUL_TIMEOUT", default_value = "60s", value_parser = parse_duration)]
    pub graceful_timeout: Duration,

    /// Deadline for non-streaming provider calls.
    #[arg(long, env = "VNODE_PROVIDER_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub provider_timeout: Duration,

    #[arg(long, env = "VNODE_HEARTBEAT_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub heartbeat_timeout: Duration,

    #[arg(long, env = "VNODE_STATUS_PATCH_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub status_patch_timeout: Duration,

    /// Heartbeat through a node lease instead of status patches.
    #[arg(long, env = "VNODE_ENABLE_NODE_LEASE")]
    pub enable_node_lease: bool,

    #[arg(long, env = "VNODE_LEASE_DURATION", default_value = "40s", value_parser = parse_duration)]
    pub lease_duration: Duration,

    /// Status patch period when leases carry the heartbeat.
    #[arg(long, env = "VNODE_STATUS_UPDATE_INTERVAL", default_value = "60s", value_parser = parse_duration)]
    pub status_update_interval: Duration,

    #[arg(long, env = "VNODE_NODE_TAINT_KEY", default_value = "virtual-kubelet.io/provider")]
    pub node_taint_key: String,

    #[arg(long, env = "VNODE_NODE_TAINT_VALUE", default_value = "http")]
    pub node_taint_value: String,

    #[arg(long, env = "VNODE_OPERATING_SYSTEM", default_value = "linux")]
    pub operating_system: String,

    #[arg(long, env = "VNODE_ARCHITECTURE", default_value = "amd64")]
    pub architecture: String,

    /// Version reported in node info. Defaults to the agent version.
    #[arg(long, env = "VNODE_KUBELET_VERSION")]
    pub kubelet_version: Option<String>,

    /// Node address used when the provider reports none.
    #[arg(long, env = "VNODE_INTERNAL_IP")]
    pub internal_ip: Option<IpAddr>,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins when set.
    #[arg(long, env = "VNODE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "VNODE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

impl Config {
    /// Check cross-field constraints clap cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.nodename.trim().is_empty() {
            return Err(Error::Config("--nodename must not be empty".into()));
        }

        let endpoint = reqwest::Url::parse(&self.provider_endpoint).map_err(|e| {
            Error::Config(format!(
                "--provider-endpoint {:?} is not a valid URL: {e}",
                self.provider_endpoint
            ))
        })?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "--provider-endpoint must use http or https, got {}",
                endpoint.scheme()
            )));
        }

        if self.worker_count == 0 {
            return Err(Error::Config("--worker-count must be at least 1".into()));
        }

        for (flag, value) in [
            ("--heartbeat-interval", self.heartbeat_interval),
            ("--resync-interval", self.resync_interval),
            ("--provider-timeout", self.provider_timeout),
            ("--heartbeat-timeout", self.heartbeat_timeout),
            ("--status-patch-timeout", self.status_patch_timeout),
            ("--status-update-interval", self.status_update_interval),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{flag} must be greater than zero")));
            }
        }

        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(Error::Config(
                "--cert-file and --key-file must be given together".into(),
            ));
        }

        Ok(())
    }

    /// Certificate and key paths, falling back to the data directory.
    pub fn tls_paths(&self) -> (PathBuf, PathBuf) {
        match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => (cert.clone(), key.clone()),
            _ => (self.data_dir.join("cert.pem"), self.data_dir.join("key.pem")),
        }
    }

    pub fn kubelet_version(&self) -> String {
        self.kubelet_version
            .clone()
            .unwrap_or_else(|| format!("v{}-vnode", env!("CARGO_PKG_VERSION")))
    }
}

/// Parse `500ms`, `30s`, `5m`, `1h` or a bare number of seconds.
pub fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {input:?}"))?;

    match unit {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!("invalid duration unit {unit:?} in {input:?}")),
    }
}
