use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use gcpt_core::command::CreateActivity;
use gcpt_core::Activity;
use gcpt_lifecycle::{FlushReport, OutboxStatus};
use gcpt_storage::{ActivityFilter, DEFAULT_ACTIVITY_LIMIT};
use serde::Deserialize;
use uuid::Uuid;

use super::{parse_param, Deleted};
use crate::error::ApiResult;
use crate::extract::{CurrentActor, ValidJson, ValidPath, ValidQuery};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub entity_type: Option<String>,
    pub entity_id: Option<Uuid>,
    pub activity_type: Option<String>,
    pub opportunity_id: Option<Uuid>,
    pub contract_id: Option<Uuid>,
    pub subcontractor_id: Option<Uuid>,
    pub limit: Option<usize>,
}

/// Newest first; `limit` is clamped by the service.
pub async fn list(
    State(state): State<AppState>,
    ValidQuery(query): ValidQuery<ListQuery>,
) -> ApiResult<Json<Vec<Activity>>> {
    let filter = ActivityFilter {
        entity_type: parse_param(query.entity_type)?,
        entity_id: query.entity_id,
        activity_type: parse_param(query.activity_type)?,
        opportunity_id: query.opportunity_id,
        contract_id: query.contract_id,
        subcontractor_id: query.subcontractor_id,
        limit: query.limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT),
    };
    Ok(Json(state.service.list_activities(&filter).await?))
}

pub async fn create(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidJson(cmd): ValidJson<CreateActivity>,
) -> ApiResult<(StatusCode, Json<Activity>)> {
    let activity = state.service.create_activity(&actor, cmd).await?;
    Ok((StatusCode::CREATED, Json(activity)))
}

pub async fn delete(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidPath(id): ValidPath<Uuid>,
) -> ApiResult<Json<Deleted>> {
    let activity = state.service.delete_activity(&actor, id).await?;
    Ok(Json(Deleted::new(activity.id)))
}

pub async fn outbox_status(State(state): State<AppState>) -> Json<OutboxStatus> {
    Json(state.service.outbox_status().await)
}

pub async fn flush_outbox(
    State(state): State<AppState>,
    CurrentActor(_actor): CurrentActor,
) -> Json<FlushReport> {
    Json(state.service.flush_outbox().await)
}
