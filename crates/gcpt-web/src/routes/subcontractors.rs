use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use gcpt_core::command::{CreateContactLog, SubcontractorFields};
use gcpt_core::{ContactLog, Subcontractor};
use gcpt_storage::SubcontractorFilter;
use serde::Deserialize;
use uuid::Uuid;

use super::{non_blank, Deleted};
use crate::error::ApiResult;
use crate::extract::{CurrentActor, ValidJson, ValidPath, ValidQuery};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub search: Option<String>,
    pub sam_registered: Option<bool>,
}

pub async fn list(
    State(state): State<AppState>,
    ValidQuery(query): ValidQuery<ListQuery>,
) -> ApiResult<Json<Vec<Subcontractor>>> {
    let filter = SubcontractorFilter {
        search: non_blank(query.search),
        sam_registered: query.sam_registered,
    };
    Ok(Json(state.service.list_subcontractors(&filter).await?))
}

pub async fn create(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidJson(cmd): ValidJson<SubcontractorFields>,
) -> ApiResult<(StatusCode, Json<Subcontractor>)> {
    let sub = state.service.create_subcontractor(&actor, cmd).await?;
    Ok((StatusCode::CREATED, Json(sub)))
}

pub async fn get(
    State(state): State<AppState>,
    ValidPath(id): ValidPath<Uuid>,
) -> ApiResult<Json<Subcontractor>> {
    Ok(Json(state.service.get_subcontractor(id).await?))
}

pub async fn update(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidPath(id): ValidPath<Uuid>,
    ValidJson(cmd): ValidJson<SubcontractorFields>,
) -> ApiResult<Json<Subcontractor>> {
    Ok(Json(state.service.update_subcontractor(&actor, id, cmd).await?))
}

pub async fn delete(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidPath(id): ValidPath<Uuid>,
) -> ApiResult<Json<Deleted>> {
    let sub = state.service.delete_subcontractor(&actor, id).await?;
    Ok(Json(Deleted::new(sub.id)))
}

pub async fn list_contacts(
    State(state): State<AppState>,
    ValidPath(id): ValidPath<Uuid>,
) -> ApiResult<Json<Vec<ContactLog>>> {
    Ok(Json(state.service.list_contact_logs(id).await?))
}

pub async fn create_contact(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidPath(id): ValidPath<Uuid>,
    ValidJson(cmd): ValidJson<CreateContactLog>,
) -> ApiResult<(StatusCode, Json<ContactLog>)> {
    let log = state.service.create_contact_log(&actor, id, cmd).await?;
    Ok((StatusCode::CREATED, Json(log)))
}

pub async fn delete_contact(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidPath(id): ValidPath<Uuid>,
) -> ApiResult<Json<Deleted>> {
    let log = state.service.delete_contact_log(&actor, id).await?;
    Ok(Json(Deleted::new(log.id)))
}
