use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use gcpt_core::command::PromoteExternal;
use gcpt_core::{ExternalOpportunity, ExternalStats, OpportunityView};
use gcpt_storage::{ExternalFilter, DEFAULT_EXTERNAL_LIMIT};
use serde::Deserialize;
use uuid::Uuid;

use super::non_blank;
use crate::error::ApiResult;
use crate::extract::{CurrentActor, ValidJson, ValidPath, ValidQuery};
use crate::state::AppState;

const MAX_EXTERNAL_LIMIT: usize = 1000;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub search: Option<String>,
    pub naics: Option<String>,
    pub set_aside: Option<String>,
    pub in_pipeline: Option<bool>,
    pub limit: Option<usize>,
}

pub async fn list(
    State(state): State<AppState>,
    ValidQuery(query): ValidQuery<ListQuery>,
) -> ApiResult<Json<Vec<ExternalOpportunity>>> {
    let filter = ExternalFilter {
        search: non_blank(query.search),
        naics_code: non_blank(query.naics),
        set_aside: non_blank(query.set_aside),
        in_pipeline: query.in_pipeline,
        limit: query
            .limit
            .unwrap_or(DEFAULT_EXTERNAL_LIMIT)
            .clamp(1, MAX_EXTERNAL_LIMIT),
    };
    Ok(Json(state.service.list_external(&filter).await?))
}

pub async fn stats(State(state): State<AppState>) -> ApiResult<Json<ExternalStats>> {
    Ok(Json(state.service.external_stats().await?))
}

pub async fn get(
    State(state): State<AppState>,
    ValidPath(id): ValidPath<Uuid>,
) -> ApiResult<Json<ExternalOpportunity>> {
    Ok(Json(state.service.get_external(id).await?))
}

pub async fn add_to_pipeline(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidPath(id): ValidPath<Uuid>,
    ValidJson(cmd): ValidJson<PromoteExternal>,
) -> ApiResult<(StatusCode, Json<OpportunityView>)> {
    let view = state.service.promote_external(&actor, id, cmd).await?;
    Ok((StatusCode::CREATED, Json(view)))
}
