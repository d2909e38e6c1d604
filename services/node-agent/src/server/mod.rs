//! Inbound API server.
//!
//! The kubelet-facing HTTPS endpoint the orchestrator uses for logs, exec
//! and stats. Each TLS connection is served by the `hyper-util` auto
//! builder with upgrades enabled; the identity established during the
//! handshake is attached to every request on that connection and checked
//! by the [`auth`] middleware.

mod auth;
pub mod error;
mod handlers;
pub mod tls;

use std::sync::Arc;

use axum::{extract::Request, middleware, routing::get, Router};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use openssl::ssl::SslAcceptor;
use tokio::net::TcpListener;
use tower::ServiceExt;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::cache::PodCache;
use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::orchestrator::Orchestrator;
use crate::provider::Provider;

pub use error::{ApiError, ProblemDetails};

/// Client identity from the TLS handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerIdentity {
    /// No client certificate was presented.
    Anonymous,
    /// Certificate chained to the client CA; carries the subject CN.
    Verified(String),
    /// Certificate presented but failed verification.
    Rejected(String),
}

/// Shared state for the handlers.
#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<dyn Provider>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub cache: Arc<PodCache>,
    pub metrics: Metrics,
    pub node_name: String,
    pub anonymous_auth: bool,
    /// Parent of every request context; cancelled on shutdown.
    pub ctx: OpContext,
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/pods", get(handlers::pods))
        .route("/runningpods/", get(handlers::running_pods))
        .route(
            "/containerLogs/{namespace}/{pod}/{container}",
            get(handlers::container_logs),
        )
        .route(
            "/exec/{namespace}/{pod}/{container}",
            get(handlers::exec).post(handlers::exec),
        )
        .route("/stats/summary", get(handlers::stats_summary))
        .route("/metrics/resource", get(handlers::metrics_resource))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::authenticate,
        ));

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .merge(authenticated)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

/// Accept TLS connections on `listener` until `ctx` is cancelled.
///
/// In-flight connections are asked to finish gracefully on cancellation.
pub async fn serve(
    ctx: OpContext,
    listener: TcpListener,
    acceptor: Arc<SslAcceptor>,
    app: Router,
) -> Result<()> {
    let local_addr = listener
        .local_addr()
        .map_err(|e| Error::Internal(format!("listener has no address: {e}")))?;
    info!(addr = %local_addr, "Inbound API listening");

    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = ctx.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        let app = app.clone();
        let acceptor = Arc::clone(&acceptor);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let tls_stream = match tls::accept(&acceptor, stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    debug!(remote_addr = %remote_addr, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let identity = tls::peer_identity(&tls_stream);
            let service = app.map_request(move |mut request: Request<Incoming>| {
                request.extensions_mut().insert(identity.clone());
                request
            });

            let builder = Builder::new(TokioExecutor::new());
            let conn = builder.serve_connection_with_upgrades(
                TokioIo::new(tls_stream),
                TowerToHyperService::new(service),
            );
            tokio::pin!(conn);

            let mut closing = false;
            let result = loop {
                tokio::select! {
                    result = conn.as_mut() => break result,
                    _ = ctx.cancelled(), if !closing => {
                        closing = true;
                        conn.as_mut().graceful_shutdown();
                    }
                }
            };

            if let Err(err) = result {
                let expected = err
                    .downcast_ref::<hyper::Error>()
                    .is_some_and(|e| e.is_closed() || e.is_incomplete_message());
                if !expected {
                    warn!(remote_addr = %remote_addr, error = %err, "HTTP serving error");
                }
            }
        });
    }

    info!("Inbound API stopped");
    Ok(())
}
