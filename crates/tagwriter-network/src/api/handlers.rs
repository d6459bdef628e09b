use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tagwriter_core::constants::{MAX_WRITE_TIMEOUT_MS, MIN_WRITE_TIMEOUT_MS};
use tagwriter_core::{CommandId, CommandStatus, SubjectRef, TagPayload};
use tagwriter_hardware::Reader;
use tagwriter_session::{SessionEvent, WriteErrorKind, WriteResult, WriteSession};
use tagwriter_storage::{Command, CommandQueue, CommandResult};
use tracing::debug;

use super::AppState;
use super::error::ApiError;

/// Default and upper bound of `GET /api/nfc/commands?limit=`.
const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 500;

// ============================================================================
// Local writes
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    pub payload: String,

    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Requested timeout clamped into the accepted range.
pub fn clamp_timeout(requested: Option<u64>, default: Duration) -> Duration {
    match requested {
        Some(ms) => Duration::from_millis(ms.clamp(MIN_WRITE_TIMEOUT_MS, MAX_WRITE_TIMEOUT_MS)),
        None => default,
    }
}

/// `POST /api/nfc/write`
///
/// Blocks until the session resolves. A busy writer answers 409 with the
/// `session_busy` result; every other outcome is 200 with the result body.
pub async fn write_tag(
    State(state): State<AppState>,
    Json(req): Json<WriteRequest>,
) -> Result<(StatusCode, Json<WriteResult>), ApiError> {
    let coordinator = state.coordinator()?;
    let payload = TagPayload::new(&req.payload)?;
    let timeout = clamp_timeout(req.timeout_ms, coordinator.config().default_timeout);

    let result = coordinator.write(&payload, timeout).await;

    let status = if result.error_kind == Some(WriteErrorKind::SessionBusy) {
        StatusCode::CONFLICT
    } else {
        StatusCode::OK
    };
    Ok((status, Json(result)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// `POST /api/nfc/cancel`
pub async fn cancel_write(State(state): State<AppState>) -> Result<Json<CancelResponse>, ApiError> {
    let cancelled = state.coordinator()?.cancel();
    Ok(Json(CancelResponse { cancelled }))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Hardware attached and the driver listening.
    pub ready: bool,
    pub busy: bool,
    pub readers: Vec<Reader>,
    pub session: Option<WriteSession>,
    pub clients: usize,
}

/// `GET /api/nfc/status`
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.fanout.snapshot();
    let (ready, busy) = match &state.coordinator {
        Some(coordinator) => (coordinator.hub().is_ready(), coordinator.is_busy()),
        None => (false, false),
    };

    Json(StatusResponse {
        ready,
        busy,
        readers: snapshot.readers,
        session: snapshot.session,
        clients: state.fanout.client_count(),
    })
}

// ============================================================================
// Remote commands
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub payload: String,
    pub subject_ref: String,
}

/// `POST /api/nfc/commands`
pub async fn enqueue_command(
    State(state): State<AppState>,
    Json(req): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<Command>), ApiError> {
    let payload = TagPayload::new(&req.payload)?;
    let subject_ref = SubjectRef::new(&req.subject_ref)?;

    let command = state.queue.enqueue(&payload, &subject_ref).await?;
    state.fanout.publish_command(&command);

    Ok((StatusCode::ACCEPTED, Json(command)))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<u32>,
}

/// `GET /api/nfc/commands`
pub async fn list_commands(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Command>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    Ok(Json(state.queue.list_recent(limit).await?))
}

/// `GET /api/nfc/commands/{id}`
pub async fn get_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Command>, ApiError> {
    let id: CommandId = id.parse()?;
    state
        .queue
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Command {} not found", id)))
}

// ============================================================================
// Agent callbacks
// ============================================================================

/// `POST /api/agent/commands/claim`
///
/// 200 with the claimed command, or 204 when nothing is pending.
pub async fn claim_command(State(state): State<AppState>) -> Result<Response, ApiError> {
    match state.queue.claim_next().await? {
        Some(command) => {
            debug!(id = %command.id, "Command claimed by agent");
            state.fanout.publish_command(&command);
            Ok(Json(command).into_response())
        }
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// `POST /api/agent/commands/{id}/result`
pub async fn report_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(result): Json<CommandResult>,
) -> Result<Json<Command>, ApiError> {
    let id: CommandId = id.parse()?;

    let command = state.queue.report_result(id, &result).await?;
    debug!(
        id = %command.id,
        status = %command.status,
        uid = ?result.uid,
        "Command result reported by agent"
    );
    state.fanout.publish_command(&command);

    Ok(Json(command))
}

/// `POST /api/agent/commands/{id}/stage`
///
/// Stage of the write session an agent runs for a claimed command. It is
/// republished to realtime clients as a `write-stage` frame; the command
/// itself is not changed.
pub async fn report_stage(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(event): Json<SessionEvent>,
) -> Result<StatusCode, ApiError> {
    let id: CommandId = id.parse()?;

    let command = state
        .queue
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Command {} not found", id)))?;
    if command.status != CommandStatus::InProgress {
        return Err(ApiError::Conflict(format!(
            "Command {} is {}, not in progress",
            id, command.status
        )));
    }

    debug!(id = %id, stage = %event.stage, "Remote write stage");
    state.fanout.publish_stage(&event);

    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: String,
    pub hardware: bool,
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (code, status, database) = match state.database.health_check().await {
        Ok(()) => (StatusCode::OK, "ok", "ok".to_string()),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, "degraded", e.to_string()),
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: tagwriter_core::VERSION.to_string(),
            database,
            hardware: state.coordinator.is_some(),
        }),
    )
}
