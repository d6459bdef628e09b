//! Agent authentication.
//!
//! The agent endpoints accept the pre-shared secret either as
//! `Authorization: Bearer <secret>` or as `X-Agent-Secret: <secret>`.
//! Without a configured secret every agent request is refused.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, header};
use axum::middleware::Next;
use axum::response::Response;
use tagwriter_core::constants::AGENT_SECRET_HEADER;
use tracing::warn;

use super::AppState;
use super::error::ApiError;

/// Middleware guarding `/api/agent/*`.
pub async fn require_agent_secret(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let secret = state
        .agent_secret
        .as_ref()
        .ok_or_else(|| ApiError::Forbidden("Agent access is not configured".to_string()))?;

    let presented = presented_secret(req.headers())
        .ok_or_else(|| ApiError::Unauthorized("Missing agent secret".to_string()))?;

    if !secret.verify(presented) {
        warn!(path = %req.uri().path(), "Rejected agent request with wrong secret");
        return Err(ApiError::Unauthorized("Invalid agent secret".to_string()));
    }

    Ok(next.run(req).await)
}

/// Secret presented by the caller, bearer token first.
fn presented_secret(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    bearer.or_else(|| {
        headers
            .get(AGENT_SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
    })
}
