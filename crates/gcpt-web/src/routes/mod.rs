pub mod activities;
pub mod contracts;
pub mod external;
pub mod health;
pub mod opportunities;
pub mod quotes;
pub mod subcontractors;
pub mod sync;

use std::str::FromStr;

use axum::routing::{delete, get, post};
use axum::Router;
use gcpt_core::{DomainError, UnknownVariant};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        // Pipeline opportunities
        .route("/opportunities", get(opportunities::list).post(opportunities::create))
        .route(
            "/opportunities/{id}",
            get(opportunities::get)
                .put(opportunities::update)
                .delete(opportunities::remove),
        )
        .route("/opportunities/{id}/stage", post(opportunities::set_stage))
        .route("/opportunities/{id}/mark-won", post(opportunities::mark_won))
        .route("/opportunities/{id}/mark-lost", post(opportunities::mark_lost))
        .route("/opportunities/{id}/remove", post(opportunities::remove))
        .route(
            "/opportunities/{id}/team",
            get(opportunities::list_team).post(opportunities::assign_team_member),
        )
        .route(
            "/opportunities/{id}/team/{user_id}",
            delete(opportunities::remove_team_member),
        )
        .route("/opportunities/{id}/activities", get(opportunities::activities))
        // External mirror
        .route("/external-opportunities", get(external::list))
        .route("/external-opportunities/stats", get(external::stats))
        .route("/external-opportunities/{id}", get(external::get))
        .route(
            "/external-opportunities/{id}/add-to-pipeline",
            post(external::add_to_pipeline),
        )
        // Sync
        .route("/sync", post(sync::run))
        .route("/sync/jobs", get(sync::list_jobs).post(sync::start_job))
        .route("/sync/jobs/{id}", get(sync::get_job))
        .route("/sync/jobs/{id}/cancel", post(sync::cancel_job))
        // Contracts
        .route("/contracts", get(contracts::list).post(contracts::create))
        .route(
            "/contracts/{id}",
            get(contracts::get).put(contracts::update).delete(contracts::delete),
        )
        .route("/contracts/{id}/revert", post(contracts::revert))
        // Quotes
        .route("/quotes", get(quotes::list).post(quotes::create))
        .route(
            "/quotes/{id}",
            get(quotes::get).put(quotes::update).delete(quotes::delete),
        )
        // Subcontractors and contact logs
        .route(
            "/subcontractors",
            get(subcontractors::list).post(subcontractors::create),
        )
        .route(
            "/subcontractors/{id}",
            get(subcontractors::get)
                .put(subcontractors::update)
                .delete(subcontractors::delete),
        )
        .route(
            "/subcontractors/{id}/contacts",
            get(subcontractors::list_contacts).post(subcontractors::create_contact),
        )
        .route("/contact-logs/{id}", delete(subcontractors::delete_contact))
        // Activities
        .route("/activities", get(activities::list).post(activities::create))
        .route("/activities/outbox", get(activities::outbox_status))
        .route("/activities/outbox/flush", post(activities::flush_outbox))
        .route("/activities/{id}", delete(activities::delete))
}

#[derive(Debug, Serialize)]
pub struct Deleted {
    pub success: bool,
    pub id: Uuid,
}

impl Deleted {
    pub fn new(id: Uuid) -> Self {
        Self { success: true, id }
    }
}

/// Parse an optional enum-valued query parameter.
pub(crate) fn parse_param<T>(value: Option<String>) -> ApiResult<Option<T>>
where
    T: FromStr<Err = UnknownVariant>,
{
    let parsed = value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(|v| v.parse::<T>())
        .transpose()
        .map_err(|e| DomainError::validation(e.to_string()))?;
    Ok(parsed)
}

pub(crate) fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
