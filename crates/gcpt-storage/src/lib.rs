//! Persistence for the pipeline tracker plus the shared HTTP fetch utilities.
//!
//! `PipelineStore` is the seam the lifecycle service works against. Every
//! multi-step transition (promotion, won/lost, removal, contract revert) is a
//! single store call so each backend can make it atomic: Postgres through a
//! transaction that starts with a conditional update, the in-memory store by
//! holding its write lock for the whole operation.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gcpt_core::command::{ContractPatch, LossDetails, OpportunityPatch, QuotePatch, SubcontractorPatch};
use gcpt_core::{
    Activity, ActivityType, ConflictKind, ContactLog, Contract, ContractStatus, DomainError,
    EntityType, ExternalListing, ExternalOpportunity, ExternalStats, OpportunityStatus,
    PipelineOpportunity, Quote, QuoteStatus, Stage, Subcontractor, TeamMember, UpsertOutcome,
};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub mod http;
pub mod memory;
pub mod postgres;

pub use http::{FetchError, FetchedResponse, HttpClientConfig, HttpFetcher};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "gcpt-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error(transparent)]
    Conflict(#[from] ConflictKind),
    #[error("corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<StoreError> for DomainError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => DomainError::NotFound { entity, id },
            StoreError::Conflict(kind) => DomainError::Conflict(kind),
            other => DomainError::Internal(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

fn contains_ci(haystack: Option<&str>, needle_lower: &str) -> bool {
    haystack
        .map(|h| h.to_lowercase().contains(needle_lower))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpportunityFilter {
    pub stage: Option<Stage>,
    pub status: Option<OpportunityStatus>,
    pub search: Option<String>,
    pub agency: Option<String>,
}

impl OpportunityFilter {
    /// The default listing shows only active opportunities.
    pub fn active() -> Self {
        Self {
            status: Some(OpportunityStatus::Active),
            ..Default::default()
        }
    }

    pub fn matches(&self, opp: &PipelineOpportunity) -> bool {
        if self.stage.is_some_and(|s| s != opp.stage) {
            return false;
        }
        if self.status.is_some_and(|s| s != opp.status) {
            return false;
        }
        if let Some(agency) = &self.agency {
            if !contains_ci(opp.agency.as_deref(), &agency.to_lowercase()) {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            let hit = contains_ci(Some(&opp.title), &needle)
                || contains_ci(opp.agency.as_deref(), &needle)
                || contains_ci(opp.solicitation_number.as_deref(), &needle)
                || contains_ci(opp.notice_id.as_deref(), &needle);
            if !hit {
                return false;
            }
        }
        true
    }
}

pub const DEFAULT_EXTERNAL_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct ExternalFilter {
    pub search: Option<String>,
    pub naics_code: Option<String>,
    pub set_aside: Option<String>,
    pub in_pipeline: Option<bool>,
    pub limit: usize,
}

impl Default for ExternalFilter {
    fn default() -> Self {
        Self {
            search: None,
            naics_code: None,
            set_aside: None,
            in_pipeline: None,
            limit: DEFAULT_EXTERNAL_LIMIT,
        }
    }
}

impl ExternalFilter {
    pub fn matches(&self, ext: &ExternalOpportunity) -> bool {
        let listing = &ext.listing;
        if let Some(code) = &self.naics_code {
            if listing.naics_code.as_deref() != Some(code.as_str()) {
                return false;
            }
        }
        if let Some(set_aside) = &self.set_aside {
            if !listing
                .set_aside_type
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case(set_aside))
            {
                return false;
            }
        }
        if self.in_pipeline.is_some_and(|flag| flag != ext.added_to_pipeline) {
            return false;
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            let hit = contains_ci(Some(&listing.title), &needle)
                || contains_ci(listing.agency.as_deref(), &needle)
                || contains_ci(listing.solicitation_number.as_deref(), &needle)
                || contains_ci(Some(&listing.notice_id), &needle);
            if !hit {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContractFilter {
    pub status: Option<ContractStatus>,
    pub search: Option<String>,
}

impl ContractFilter {
    pub fn matches(&self, contract: &Contract) -> bool {
        if self.status.is_some_and(|s| s != contract.status) {
            return false;
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            return contains_ci(Some(&contract.title), &needle)
                || contains_ci(Some(&contract.contract_number), &needle)
                || contains_ci(contract.agency.as_deref(), &needle);
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuoteFilter {
    pub opportunity_id: Option<Uuid>,
    pub subcontractor_id: Option<Uuid>,
    pub status: Option<QuoteStatus>,
}

impl QuoteFilter {
    pub fn matches(&self, quote: &Quote) -> bool {
        (self.opportunity_id.is_none() || self.opportunity_id == quote.opportunity_id)
            && (self.subcontractor_id.is_none() || self.subcontractor_id == quote.subcontractor_id)
            && self.status.map_or(true, |s| s == quote.status)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubcontractorFilter {
    pub search: Option<String>,
    pub sam_registered: Option<bool>,
}

impl SubcontractorFilter {
    pub fn matches(&self, sub: &Subcontractor) -> bool {
        if self.sam_registered.is_some_and(|flag| flag != sub.sam_registered) {
            return false;
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            return contains_ci(Some(&sub.company_name), &needle)
                || sub
                    .capabilities
                    .iter()
                    .chain(sub.naics_codes.iter())
                    .any(|v| v.to_lowercase().contains(&needle));
        }
        true
    }
}

pub const DEFAULT_ACTIVITY_LIMIT: usize = 50;
pub const MAX_ACTIVITY_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityFilter {
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<Uuid>,
    pub activity_type: Option<ActivityType>,
    pub opportunity_id: Option<Uuid>,
    pub contract_id: Option<Uuid>,
    pub subcontractor_id: Option<Uuid>,
    pub limit: usize,
}

impl Default for ActivityFilter {
    fn default() -> Self {
        Self {
            entity_type: None,
            entity_id: None,
            activity_type: None,
            opportunity_id: None,
            contract_id: None,
            subcontractor_id: None,
            limit: DEFAULT_ACTIVITY_LIMIT,
        }
    }
}

impl ActivityFilter {
    pub fn matches(&self, activity: &Activity) -> bool {
        self.entity_type.map_or(true, |t| t == activity.entity_type)
            && self.entity_id.map_or(true, |id| id == activity.entity_id)
            && self.activity_type.map_or(true, |t| t == activity.activity_type)
            && (self.opportunity_id.is_none() || self.opportunity_id == activity.opportunity_id)
            && (self.contract_id.is_none() || self.contract_id == activity.contract_id)
            && (self.subcontractor_id.is_none() || self.subcontractor_id == activity.subcontractor_id)
    }
}

/// Destination for audit entries; kept apart from `PipelineStore` so the
/// audit outbox can be driven (and faulted) independently of the main store.
#[async_trait]
pub trait ActivitySink: Send + Sync {
    async fn append_activity(&self, activity: Activity) -> StoreResult<Activity>;
}

/// Durable queue of audit entries the sink has not accepted yet. Entries are
/// handed back oldest first and stay queued until marked delivered.
#[async_trait]
pub trait ActivityOutbox: Send + Sync {
    async fn queue_activity(&self, activity: &Activity) -> StoreResult<()>;
    async fn next_queued(&self, limit: usize) -> StoreResult<Vec<Activity>>;
    async fn mark_delivered(&self, id: Uuid) -> StoreResult<()>;
    async fn queued_count(&self) -> StoreResult<usize>;
}

#[async_trait]
pub trait PipelineStore: ActivitySink + Send + Sync {
    async fn upsert_external(
        &self,
        listing: ExternalListing,
        synced_at: DateTime<Utc>,
    ) -> StoreResult<UpsertOutcome>;
    async fn get_external(&self, id: Uuid) -> StoreResult<Option<ExternalOpportunity>>;
    async fn list_external(&self, filter: &ExternalFilter) -> StoreResult<Vec<ExternalOpportunity>>;
    async fn external_stats(&self) -> StoreResult<ExternalStats>;
    /// Flip the source's pipeline flag (only if still unset) and insert the
    /// promoted opportunity, as one unit.
    async fn promote_external(
        &self,
        external_id: Uuid,
        opportunity: PipelineOpportunity,
        at: DateTime<Utc>,
    ) -> StoreResult<PipelineOpportunity>;

    async fn insert_opportunity(&self, opp: PipelineOpportunity) -> StoreResult<PipelineOpportunity>;
    async fn get_opportunity(&self, id: Uuid) -> StoreResult<Option<PipelineOpportunity>>;
    async fn list_opportunities(&self, filter: &OpportunityFilter) -> StoreResult<Vec<PipelineOpportunity>>;
    async fn update_opportunity(
        &self,
        id: Uuid,
        patch: &OpportunityPatch,
        at: DateTime<Utc>,
    ) -> StoreResult<PipelineOpportunity>;
    /// Returns the previous stage alongside the updated row. Refused once the
    /// opportunity is won or lost.
    async fn set_stage(
        &self,
        id: Uuid,
        stage: Stage,
        at: DateTime<Utc>,
    ) -> StoreResult<(Stage, PipelineOpportunity)>;
    async fn mark_won(
        &self,
        id: Uuid,
        contract: Contract,
        at: DateTime<Utc>,
    ) -> StoreResult<(PipelineOpportunity, Contract)>;
    async fn mark_lost(
        &self,
        id: Uuid,
        loss: &LossDetails,
        at: DateTime<Utc>,
    ) -> StoreResult<PipelineOpportunity>;
    /// Clears the originating listing's pipeline flag, then deletes.
    async fn remove_opportunity(&self, id: Uuid) -> StoreResult<PipelineOpportunity>;

    async fn insert_contract(&self, contract: Contract) -> StoreResult<Contract>;
    async fn get_contract(&self, id: Uuid) -> StoreResult<Option<Contract>>;
    async fn list_contracts(&self, filter: &ContractFilter) -> StoreResult<Vec<Contract>>;
    async fn update_contract(
        &self,
        id: Uuid,
        patch: &ContractPatch,
        at: DateTime<Utc>,
    ) -> StoreResult<Contract>;
    async fn delete_contract(&self, id: Uuid) -> StoreResult<Contract>;
    /// Delete the contract and insert `reopened` in its place.
    async fn revert_contract(
        &self,
        id: Uuid,
        reopened: PipelineOpportunity,
    ) -> StoreResult<(Contract, PipelineOpportunity)>;

    async fn insert_quote(&self, quote: Quote) -> StoreResult<Quote>;
    async fn get_quote(&self, id: Uuid) -> StoreResult<Option<Quote>>;
    async fn list_quotes(&self, filter: &QuoteFilter) -> StoreResult<Vec<Quote>>;
    async fn update_quote(&self, id: Uuid, patch: &QuotePatch, at: DateTime<Utc>) -> StoreResult<Quote>;
    async fn delete_quote(&self, id: Uuid) -> StoreResult<Quote>;

    async fn insert_subcontractor(&self, sub: Subcontractor) -> StoreResult<Subcontractor>;
    async fn get_subcontractor(&self, id: Uuid) -> StoreResult<Option<Subcontractor>>;
    async fn list_subcontractors(&self, filter: &SubcontractorFilter) -> StoreResult<Vec<Subcontractor>>;
    async fn update_subcontractor(
        &self,
        id: Uuid,
        patch: &SubcontractorPatch,
        at: DateTime<Utc>,
    ) -> StoreResult<Subcontractor>;
    async fn delete_subcontractor(&self, id: Uuid) -> StoreResult<Subcontractor>;

    async fn add_team_member(&self, member: TeamMember) -> StoreResult<TeamMember>;
    async fn list_team_members(&self, opportunity_id: Uuid) -> StoreResult<Vec<TeamMember>>;
    async fn remove_team_member(&self, opportunity_id: Uuid, user_id: &str) -> StoreResult<TeamMember>;

    async fn list_activities(&self, filter: &ActivityFilter) -> StoreResult<Vec<Activity>>;
    async fn delete_activity(&self, id: Uuid) -> StoreResult<Activity>;

    async fn insert_contact_log(&self, log: ContactLog) -> StoreResult<ContactLog>;
    async fn list_contact_logs(&self, subcontractor_id: Uuid) -> StoreResult<Vec<ContactLog>>;
    async fn delete_contact_log(&self, id: Uuid) -> StoreResult<ContactLog>;
}

/// Three views of one backing store: the full pipeline interface, the audit
/// sink and the outbox holding entries the sink refused.
#[derive(Clone)]
pub struct StoreHandles {
    pub pipeline: Arc<dyn PipelineStore>,
    pub activities: Arc<dyn ActivitySink>,
    pub outbox: Arc<dyn ActivityOutbox>,
}

impl StoreHandles {
    pub fn new<S: PipelineStore + ActivityOutbox + 'static>(store: Arc<S>) -> Self {
        Self {
            pipeline: store.clone(),
            activities: store.clone(),
            outbox: store,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Postgres (migrated) when `DATABASE_URL` is set, otherwise the
    /// in-memory store.
    pub async fn from_env() -> anyhow::Result<Self> {
        match std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()) {
            Some(url) => {
                let store = PgStore::connect(&url).await.context("connecting to DATABASE_URL")?;
                store.migrate().await.context("applying migrations")?;
                info!("using postgres store");
                Ok(Self::new(Arc::new(store)))
            }
            None => {
                warn!("DATABASE_URL is not set; using the in-memory store (data is lost on exit)");
                Ok(Self::in_memory())
            }
        }
    }
}

/// Map a status read back after a refused won-transition to its conflict.
pub fn won_conflict(status: OpportunityStatus) -> ConflictKind {
    match status {
        OpportunityStatus::Lost => ConflictKind::CannotWinLost,
        _ => ConflictKind::AlreadyWon,
    }
}

/// Map a status read back after a refused lost-transition to its conflict.
pub fn lost_conflict(status: OpportunityStatus) -> ConflictKind {
    match status {
        OpportunityStatus::Won => ConflictKind::CannotLoseWon,
        _ => ConflictKind::AlreadyLost,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcpt_core::{Actor, Role};

    #[test]
    fn opportunity_filter_matches_search_across_fields() {
        let actor = Actor::new("u", "o", Role::User);
        let mut opp = PipelineOpportunity::new(&actor, "Cloud Migration", Utc::now());
        opp.solicitation_number = Some("W91-24-R-0001".into());
        opp.agency = Some("Department of the Army".into());

        let by_sol = OpportunityFilter {
            search: Some("w91-24".into()),
            ..OpportunityFilter::active()
        };
        assert!(by_sol.matches(&opp));

        let by_agency = OpportunityFilter {
            agency: Some("army".into()),
            ..Default::default()
        };
        assert!(by_agency.matches(&opp));

        opp.status = OpportunityStatus::Won;
        assert!(!OpportunityFilter::active().matches(&opp));
        assert!(OpportunityFilter::default().matches(&opp));
    }

    #[test]
    fn conflict_mapping_distinguishes_terminal_states() {
        assert_eq!(won_conflict(OpportunityStatus::Won), ConflictKind::AlreadyWon);
        assert_eq!(won_conflict(OpportunityStatus::Lost), ConflictKind::CannotWinLost);
        assert_eq!(lost_conflict(OpportunityStatus::Lost), ConflictKind::AlreadyLost);
        assert_eq!(lost_conflict(OpportunityStatus::Won), ConflictKind::CannotLoseWon);
    }

    #[test]
    fn store_errors_map_onto_domain_taxonomy() {
        let nf: DomainError = StoreError::not_found("opportunity", "abc").into();
        assert_eq!(nf, DomainError::not_found("opportunity", "abc"));
        let conflict: DomainError = StoreError::Conflict(ConflictKind::AlreadyWon).into();
        assert!(conflict.is_conflict(ConflictKind::AlreadyWon));
        let corrupt: DomainError = StoreError::Corrupt {
            table: "contracts",
            message: "bad".into(),
        }
        .into();
        assert!(matches!(corrupt, DomainError::Internal(_)));
    }
}
