//! Virtual node agent
//!
//! Registers a virtual node with the orchestrator and runs every pod bound
//! to it through an HTTP provider.
//!
//! ## Architecture
//!
//! - **Watcher**: lists and watches pods bound to the node into the cache
//! - **Reconciler**: worker pool converging the provider towards the cache
//! - **Node controller**: registration, heartbeat, drain
//! - **Inbound API**: kubelet endpoints for logs, exec and stats
//!
//! Exit codes: 0 normal, 1 configuration error, 2 registration failure,
//! 3 unrecoverable provider error.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use k8s_openapi::api::core::v1::Taint;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use vnode_agent::config::Config;
use vnode_agent::error::exit;
use vnode_agent::metrics::Metrics;
use vnode_agent::node::{DrainOutcome, NodeConfig, NodeController};
use vnode_agent::reconciler::{Reconciler, ReconcilerConfig};
use vnode_agent::server::{self, AppState};
use vnode_agent::watcher::{Watcher, WatcherConfig};
use vnode_agent::{logging, tls, HttpProvider, KubeOrchestrator, OpContext, PodCache};
use vnode_reconcile::WorkQueue;

/// Startup failure with the exit code it maps to.
struct Fatal {
    code: i32,
    error: anyhow::Error,
}

trait ExitWith<T> {
    fn exit_with(self, code: i32) -> Result<T, Fatal>;
}

impl<T, E: Into<anyhow::Error>> ExitWith<T> for Result<T, E> {
    fn exit_with(self, code: i32) -> Result<T, Fatal> {
        self.map_err(|e| Fatal {
            code,
            error: e.into(),
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::try_parse() {
        Ok(config) => config,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(exit::CONFIG as u8)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    if let Err(e) = logging::init(config.log_format, &config.log_level) {
        eprintln!("failed to initialise logging: {e:#}");
        return ExitCode::from(exit::CONFIG as u8);
    }

    match run(config).await {
        Ok(code) => ExitCode::from(code as u8),
        Err(Fatal { code, error }) => {
            error!(error = %format_args!("{error:#}"), exit_code = code, "Virtual node agent failed");
            ExitCode::from(code as u8)
        }
    }
}

async fn run(config: Config) -> Result<i32, Fatal> {
    config.validate().exit_with(exit::CONFIG)?;
    info!(
        node = %config.nodename,
        provider = %config.provider_endpoint,
        listen_addr = %config.listen_addr,
        "Starting virtual node agent"
    );

    // Serving certificate and listener
    let (cert_path, key_path) = config.tls_paths();
    let mut sans = vec![config.nodename.clone(), "localhost".to_string()];
    if let Some(ip) = config.internal_ip {
        sans.push(ip.to_string());
    }
    let pair = tls::ensure_key_pair(&cert_path, &key_path, &config.nodename, &sans)
        .exit_with(exit::CONFIG)?;
    let client_ca = config
        .client_ca_file
        .as_ref()
        .map(|path| {
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
        })
        .transpose()
        .exit_with(exit::CONFIG)?;
    let acceptor = Arc::new(
        server::tls::build_acceptor(&pair, client_ca.as_deref()).exit_with(exit::CONFIG)?,
    );
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))
        .exit_with(exit::CONFIG)?;

    // Collaborators
    let orchestrator = Arc::new(
        KubeOrchestrator::connect(
            config.kubeconfig.as_deref(),
            &config.nodename,
            config.status_patch_timeout,
        )
        .await
        .exit_with(exit::CONFIG)?,
    );
    let provider = Arc::new(
        HttpProvider::new(&config.provider_endpoint, config.provider_timeout)
            .exit_with(exit::CONFIG)?,
    );
    let metrics = Metrics::new().exit_with(exit::CONFIG)?;

    let root = OpContext::background();

    // Node registration
    let (escalation_tx, mut escalation_rx) = mpsc::channel(1);
    let node = Arc::new(NodeController::new(
        node_config(&config),
        provider.clone(),
        orchestrator.clone(),
        metrics.clone(),
        escalation_tx,
    ));
    node.register(&root.operation())
        .await
        .context("node registration failed")
        .exit_with(exit::REGISTRATION)?;

    let cache = Arc::new(PodCache::new());
    let queue = Arc::new(WorkQueue::default());

    // Watcher
    let watcher_ctx = root.child();
    let watcher = Watcher::new(
        orchestrator.clone(),
        cache.clone(),
        queue.clone(),
        WatcherConfig::new(&config.nodename),
    );
    let watcher_handle = tokio::spawn({
        let ctx = watcher_ctx.clone();
        async move { watcher.run(ctx).await }
    });

    // Reconciler
    let reconciler_ctx = root.child();
    let reconciler = Arc::new(Reconciler::new(
        provider.clone(),
        orchestrator.clone(),
        cache.clone(),
        queue.clone(),
        metrics.clone(),
        ReconcilerConfig {
            workers: config.worker_count,
            resync_interval: config.resync_interval,
            ..Default::default()
        },
    ));
    let reconciler_handle = tokio::spawn(Arc::clone(&reconciler).run(reconciler_ctx.clone()));

    // Heartbeat
    let heartbeat_ctx = root.child();
    let heartbeat_handle = tokio::spawn({
        let node = Arc::clone(&node);
        let ctx = heartbeat_ctx.clone();
        async move { node.run(ctx).await }
    });

    // Inbound API
    let server_ctx = root.child();
    let app = server::router(AppState {
        provider: provider.clone(),
        orchestrator: orchestrator.clone(),
        cache: cache.clone(),
        metrics: metrics.clone(),
        node_name: config.nodename.clone(),
        anonymous_auth: config.anonymous_auth,
        ctx: server_ctx.clone(),
    });
    let server_handle = tokio::spawn(server::serve(server_ctx.clone(), listener, acceptor, app));

    let exit_code = tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            exit::OK
        }
        Some(escalation) = escalation_rx.recv() => {
            error!(
                error = %escalation.error,
                consecutive_failures = escalation.consecutive_failures,
                "Provider unreachable, shutting down"
            );
            exit::PROVIDER
        }
    };

    // Drain while the watcher and workers still process deletions.
    reconciler.set_draining(true);
    if node.drain(&root.operation(), &cache).await != DrainOutcome::Completed {
        warn!(exit_code, "Shutting down before the provider emptied");
    }

    watcher_ctx.cancel();
    if let Err(e) = watcher_handle.await {
        error!(error = %e, "Watcher task panicked");
    }

    reconciler_ctx.cancel();
    if let Err(e) = reconciler_handle.await {
        error!(error = %e, "Reconciler task panicked");
    }

    heartbeat_ctx.cancel();
    if let Err(e) = heartbeat_handle.await {
        error!(error = %e, "Heartbeat task panicked");
    }

    server_ctx.cancel();
    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Inbound API failed"),
        Err(e) => error!(error = %e, "Inbound API task panicked"),
    }

    if let Err(e) = node.terminate(&OpContext::background()).await {
        warn!(error = %e, "Node object left behind");
    }

    info!(exit_code, "Virtual node agent stopped");
    Ok(exit_code)
}

fn node_config(config: &Config) -> NodeConfig {
    NodeConfig {
        operating_system: config.operating_system.clone(),
        architecture: config.architecture.clone(),
        kubelet_version: config.kubelet_version(),
        internal_ip: config.internal_ip.map(|ip| ip.to_string()),
        daemon_port: i32::from(config.listen_addr.port()),
        taint: Taint {
            key: config.node_taint_key.clone(),
            value: Some(config.node_taint_value.clone()),
            effect: "NoSchedule".to_string(),
            time_added: None,
        },
        heartbeat_interval: config.heartbeat_interval,
        heartbeat_timeout: config.heartbeat_timeout,
        status_update_interval: config.status_update_interval,
        enable_lease: config.enable_node_lease,
        lease_duration: config.lease_duration,
        graceful_timeout: config.graceful_timeout,
        ..NodeConfig::new(&config.nodename)
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
