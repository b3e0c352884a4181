use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use gcpt_core::command::{
    AssignTeamMember, CreateOpportunity, MarkLost, MarkWon, SetStage, UpdateOpportunity,
};
use gcpt_core::{Activity, OpportunityStatus, OpportunityView, TeamMember};
use gcpt_lifecycle::WonOutcome;
use gcpt_storage::{OpportunityFilter, DEFAULT_ACTIVITY_LIMIT};
use serde::Deserialize;
use uuid::Uuid;

use super::{non_blank, parse_param, Deleted};
use crate::error::ApiResult;
use crate::extract::{CurrentActor, ValidJson, ValidPath, ValidQuery};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub stage: Option<String>,
    pub status: Option<String>,
    pub search: Option<String>,
    pub agency: Option<String>,
}

impl ListQuery {
    /// Active only unless `status` says otherwise; `status=all` lifts the filter.
    fn into_filter(self) -> ApiResult<OpportunityFilter> {
        let status = match non_blank(self.status) {
            None => Some(OpportunityStatus::Active),
            Some(s) if s.eq_ignore_ascii_case("all") => None,
            Some(s) => parse_param(Some(s))?,
        };
        Ok(OpportunityFilter {
            stage: parse_param(self.stage)?,
            status,
            search: non_blank(self.search),
            agency: non_blank(self.agency),
        })
    }
}

pub async fn list(
    State(state): State<AppState>,
    ValidQuery(query): ValidQuery<ListQuery>,
) -> ApiResult<Json<Vec<OpportunityView>>> {
    let filter = query.into_filter()?;
    Ok(Json(state.service.list_opportunities(&filter).await?))
}

pub async fn create(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidJson(cmd): ValidJson<CreateOpportunity>,
) -> ApiResult<(StatusCode, Json<OpportunityView>)> {
    let view = state.service.create_opportunity(&actor, cmd).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn get(
    State(state): State<AppState>,
    ValidPath(id): ValidPath<Uuid>,
) -> ApiResult<Json<OpportunityView>> {
    Ok(Json(state.service.get_opportunity(id).await?))
}

pub async fn update(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidPath(id): ValidPath<Uuid>,
    ValidJson(cmd): ValidJson<UpdateOpportunity>,
) -> ApiResult<Json<OpportunityView>> {
    Ok(Json(state.service.update_opportunity(&actor, id, cmd).await?))
}

/// Serves both `DELETE /opportunities/{id}` and `POST /opportunities/{id}/remove`.
pub async fn remove(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidPath(id): ValidPath<Uuid>,
) -> ApiResult<Json<Deleted>> {
    let removed = state.service.remove_from_pipeline(&actor, id).await?;
    Ok(Json(Deleted::new(removed.id)))
}

pub async fn set_stage(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidPath(id): ValidPath<Uuid>,
    ValidJson(cmd): ValidJson<SetStage>,
) -> ApiResult<Json<OpportunityView>> {
    Ok(Json(state.service.set_stage(&actor, id, cmd).await?))
}

pub async fn mark_won(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidPath(id): ValidPath<Uuid>,
    ValidJson(cmd): ValidJson<MarkWon>,
) -> ApiResult<Json<WonOutcome>> {
    Ok(Json(state.service.mark_won(&actor, id, cmd).await?))
}

pub async fn mark_lost(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidPath(id): ValidPath<Uuid>,
    ValidJson(cmd): ValidJson<MarkLost>,
) -> ApiResult<Json<OpportunityView>> {
    Ok(Json(state.service.mark_lost(&actor, id, cmd).await?))
}

pub async fn list_team(
    State(state): State<AppState>,
    ValidPath(id): ValidPath<Uuid>,
) -> ApiResult<Json<Vec<TeamMember>>> {
    Ok(Json(state.service.list_team(id).await?))
}

pub async fn assign_team_member(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidPath(id): ValidPath<Uuid>,
    ValidJson(cmd): ValidJson<AssignTeamMember>,
) -> ApiResult<(StatusCode, Json<TeamMember>)> {
    let member = state.service.assign_team_member(&actor, id, cmd).await?;
    Ok((StatusCode::CREATED, Json(member)))
}

pub async fn remove_team_member(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    ValidPath((id, user_id)): ValidPath<(Uuid, String)>,
) -> ApiResult<Json<TeamMember>> {
    Ok(Json(state.service.remove_team_member(&actor, id, &user_id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct FeedQuery {
    pub limit: Option<usize>,
}

pub async fn activities(
    State(state): State<AppState>,
    ValidPath(id): ValidPath<Uuid>,
    ValidQuery(query): ValidQuery<FeedQuery>,
) -> ApiResult<Json<Vec<Activity>>> {
    let limit = query.limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT);
    Ok(Json(state.service.opportunity_activities(id, limit).await?))
}
