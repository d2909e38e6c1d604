//! Request authentication.
//!
//! A request is admitted when any of these hold:
//! - anonymous access is enabled
//! - the connection presented a client certificate that chained to the CA
//! - the bearer token passes the orchestrator's TokenReview

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use tracing::{debug, warn};

use super::error::ApiError;
use super::{AppState, PeerIdentity};

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn request_id(request: &Request) -> Option<String> {
    request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

pub async fn authenticate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.anonymous_auth {
        return Ok(next.run(request).await);
    }

    let request_id = request_id(&request);
    match request.extensions().get::<PeerIdentity>() {
        Some(PeerIdentity::Verified(subject)) => {
            debug!(subject = %subject, path = %request.uri().path(), "Client certificate accepted");
            return Ok(next.run(request).await);
        }
        Some(PeerIdentity::Rejected(reason)) => {
            warn!(reason = %reason, "Client certificate rejected");
        }
        Some(PeerIdentity::Anonymous) | None => {}
    }

    let Some(token) = bearer_token(&request) else {
        return Err(ApiError::unauthorized("Unauthorized", "no client certificate or bearer token")
            .with_request_id(request_id.as_deref()));
    };

    let ctx = state.ctx.operation();
    match state.orchestrator.review_token(&ctx, token).await {
        Ok(Some(user)) => {
            debug!(user = %user, path = %request.uri().path(), "Bearer token accepted");
            Ok(next.run(request).await)
        }
        Ok(None) => Err(ApiError::unauthorized("Unauthorized", "bearer token rejected")
            .with_request_id(request_id.as_deref())),
        Err(e) => {
            warn!(error = %e, "Token review failed");
            Err(ApiError::unauthorized("Unauthorized", "bearer token could not be verified")
                .with_request_id(request_id.as_deref()))
        }
    }
}
