use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use gcpt_core::command::{CreateContract, UpdateContract};
use gcpt_core::Contract;
use gcpt_lifecycle::RevertOutcome;
use gcpt_storage::ContractFilter;
use serde::Deserialize;
use uuid::Uuid;

use super::{non_blank, parse_param, Deleted};
use crate::error::ApiResult;
use crate::extract::{CurrentActor, ValidJson, ValidPath, ValidQuery};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub search: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    ValidQuery(query): ValidQuery<ListQuery>,
) -> ApiResult<Json<Vec<Contract>>> {
    let filter = ContractFilter {
        status: parse_param(query.status)?,
        search: non_blank(query.search),
    };
    Ok(Json(state.service.list_contracts(&filter).await?))
}

pub async fn create(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidJson(cmd): ValidJson<CreateContract>,
) -> ApiResult<(StatusCode, Json<Contract>)> {
    let contract = state.service.create_contract(&actor, cmd).await?;
    Ok((StatusCode::CREATED, Json(contract)))
}

pub async fn get(
    State(state): State<AppState>,
    ValidPath(id): ValidPath<Uuid>,
) -> ApiResult<Json<Contract>> {
    Ok(Json(state.service.get_contract(id).await?))
}

pub async fn update(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidPath(id): ValidPath<Uuid>,
    ValidJson(cmd): ValidJson<UpdateContract>,
) -> ApiResult<Json<Contract>> {
    Ok(Json(state.service.update_contract(&actor, id, cmd).await?))
}

pub async fn delete(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidPath(id): ValidPath<Uuid>,
) -> ApiResult<Json<Deleted>> {
    let contract = state.service.delete_contract(&actor, id).await?;
    Ok(Json(Deleted::new(contract.id)))
}

/// Admin only.
pub async fn revert(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidPath(id): ValidPath<Uuid>,
) -> ApiResult<Json<RevertOutcome>> {
    Ok(Json(state.service.revert_contract(&actor, id).await?))
}
