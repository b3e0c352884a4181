use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use gcpt_core::DomainError;
use gcpt_sync::{JobSnapshot, SyncDefaults, SyncPlan, SyncReport, SyncRequest};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::extract::{CurrentActor, ValidJson, ValidPath};
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStarted {
    pub job_id: Uuid,
}

async fn plan(state: &AppState, request: SyncRequest) -> ApiResult<SyncPlan> {
    let config = state.sync_config();
    let defaults = SyncDefaults::load(&config.defaults_path)
        .await
        .map_err(|e| DomainError::Internal(format!("{e:#}")))?;
    let request = match defaults {
        Some(defaults) => request.with_defaults(&defaults),
        None => request,
    };
    Ok(request.validate(config, Utc::now().date_naive())?)
}

/// Starts a tracked job and holds the request open until its report is final.
pub async fn run(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidJson(request): ValidJson<SyncRequest>,
) -> ApiResult<Json<SyncReport>> {
    let plan = plan(&state, request).await?;
    let handle = state.sync.start(plan).await;
    info!(user_id = %actor.user_id, job_id = %handle.job_id(), "sync requested");
    Ok(Json(handle.wait().await))
}

pub async fn start_job(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidJson(request): ValidJson<SyncRequest>,
) -> ApiResult<(StatusCode, Json<JobStarted>)> {
    let plan = plan(&state, request).await?;
    let handle = state.sync.start(plan).await;
    info!(user_id = %actor.user_id, job_id = %handle.job_id(), "sync job started");
    Ok((
        StatusCode::ACCEPTED,
        Json(JobStarted {
            job_id: handle.job_id(),
        }),
    ))
}

pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobSnapshot>> {
    Json(state.sync.list().await)
}

pub async fn get_job(
    State(state): State<AppState>,
    ValidPath(id): ValidPath<Uuid>,
) -> ApiResult<Json<JobSnapshot>> {
    let handle = state
        .sync
        .get(id)
        .await
        .ok_or_else(|| DomainError::not_found("sync job", id))?;
    Ok(Json(handle.status()))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    CurrentActor(_actor): CurrentActor,
    ValidPath(id): ValidPath<Uuid>,
) -> ApiResult<Json<JobSnapshot>> {
    let snapshot = state
        .sync
        .cancel(id)
        .await
        .ok_or_else(|| DomainError::not_found("sync job", id))?;
    Ok(Json(snapshot))
}
