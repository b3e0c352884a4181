use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use gcpt_core::command::{CreateQuote, UpdateQuote};
use gcpt_core::Quote;
use gcpt_storage::QuoteFilter;
use serde::Deserialize;
use uuid::Uuid;

use super::{parse_param, Deleted};
use crate::error::ApiResult;
use crate::extract::{CurrentActor, ValidJson, ValidPath, ValidQuery};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub opportunity_id: Option<Uuid>,
    pub subcontractor_id: Option<Uuid>,
    pub status: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    ValidQuery(query): ValidQuery<ListQuery>,
) -> ApiResult<Json<Vec<Quote>>> {
    let filter = QuoteFilter {
        opportunity_id: query.opportunity_id,
        subcontractor_id: query.subcontractor_id,
        status: parse_param(query.status)?,
    };
    Ok(Json(state.service.list_quotes(&filter).await?))
}

pub async fn create(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidJson(cmd): ValidJson<CreateQuote>,
) -> ApiResult<(StatusCode, Json<Quote>)> {
    let quote = state.service.create_quote(&actor, cmd).await?;
    Ok((StatusCode::CREATED, Json(quote)))
}

pub async fn get(
    State(state): State<AppState>,
    ValidPath(id): ValidPath<Uuid>,
) -> ApiResult<Json<Quote>> {
    Ok(Json(state.service.get_quote(id).await?))
}

pub async fn update(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidPath(id): ValidPath<Uuid>,
    ValidJson(cmd): ValidJson<UpdateQuote>,
) -> ApiResult<Json<Quote>> {
    Ok(Json(state.service.update_quote(&actor, id, cmd).await?))
}

pub async fn delete(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidPath(id): ValidPath<Uuid>,
) -> ApiResult<Json<Deleted>> {
    let quote = state.service.delete_quote(&actor, id).await?;
    Ok(Json(Deleted::new(quote.id)))
}
