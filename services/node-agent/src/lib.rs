//! Virtual node agent library.
//!
//! The agent registers a virtual node with the orchestrator and delegates
//! every pod scheduled onto it to a remote provider over HTTP. It watches
//! the pods bound to the node, converges the provider towards them, copies
//! provider status back, and serves the kubelet API for logs, exec and
//! stats.
//!
//! ## Architecture
//!
//! ```text
//! Watcher ──> PodCache ──> WorkQueue ──> Reconciler workers ──> Provider
//!                                              │
//!                                              └──> Orchestrator (status, events)
//! NodeController ──> heartbeat / lease / drain
//! server ──> /containerLogs, /exec, /stats/summary, /metrics/resource
//! ```
//!
//! ## Modules
//!
//! - `cache`: desired pods keyed by namespace/name
//! - `reconciler`: transition function and worker pool
//! - `watcher`: list/watch loop feeding the cache and queue
//! - `node`: registration, heartbeat, drain
//! - `provider`: provider interface, HTTP client, in-memory mock
//! - `orchestrator`: orchestrator interface, Kubernetes adapter, mock
//! - `server`: TLS-terminated kubelet API
//! - `tls`: serving keypair provisioning

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod node;
pub mod orchestrator;
pub mod pod;
pub mod provider;
pub mod reconciler;
pub mod server;
pub mod tls;
pub mod watcher;

// Re-export commonly used types
pub use cache::{CachedPod, PodCache};
pub use context::OpContext;
pub use error::{Error, Result};
pub use node::{NodeConfig, NodeController, NodeState};
pub use orchestrator::{KubeOrchestrator, MockOrchestrator, Orchestrator};
pub use pod::PodKey;
pub use provider::{HttpProvider, MockProvider, Provider};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use watcher::{Watcher, WatcherConfig};
