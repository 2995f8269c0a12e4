//! HTTP handlers.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use labterm_foundation::Error;
use labterm_session::{ExecRequest, JobId, JobRecord, SessionSummary};
use serde::Serialize;
use tracing::info;

use super::error::ApiResult;
use super::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub engine: &'static str,
    pub engine_available: bool,
    pub sessions: usize,
    pub events_published: u64,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let manager = state.engine.manager();
    let engine = manager.provisioner().engine();
    Json(HealthResponse {
        status: "ok",
        engine: engine.name(),
        engine_available: engine.ping().await.is_ok(),
        sessions: manager.registry().len().await,
        events_published: state.engine.bus().event_count(),
    })
}

fn require_owner(state: &AppState, headers: &HeaderMap) -> ApiResult<String> {
    state.owner_from(headers).ok_or_else(|| Error::OwnerMissing.into())
}

/// GET /api/sessions - the caller's live sessions
pub async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<SessionSummary>>> {
    let owner_id = require_owner(&state, &headers)?;
    Ok(Json(state.engine.manager().list(Some(&owner_id)).await))
}

#[derive(Debug, Serialize)]
pub struct ExecAccepted {
    pub job_id: String,
}

/// POST /api/exec
///
/// 202 with the job id; a rejected command is 422 and nothing is queued.
pub async fn execute(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ExecRequest>,
) -> ApiResult<impl IntoResponse> {
    let owner_id = require_owner(&state, &headers)?;
    let job_id = state.engine.executor().execute(&owner_id, request).await?;
    info!(owner_id = %owner_id, job_id = %job_id, "Accepted out-of-band command");
    Ok((
        StatusCode::ACCEPTED,
        Json(ExecAccepted {
            job_id: job_id.to_string(),
        }),
    ))
}

/// GET /api/jobs/{job_id}
pub async fn job_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobRecord>> {
    let owner_id = require_owner(&state, &headers)?;
    let id = JobId::parse(&job_id)?;
    match state.engine.executor().status(id).await {
        // other owners' jobs look the same as unknown ones
        Some(record) if record.owner_id == owner_id => Ok(Json(record)),
        _ => Err(Error::NotFound(format!("job {}", job_id)).into()),
    }
}
