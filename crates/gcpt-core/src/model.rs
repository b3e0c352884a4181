use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Lowercases and folds `-`/space separators so `Proposal-Development`,
/// `proposal development` and `proposal_development` parse alike.
fn normalize_token(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c == '-' || c == ' ' { '_' } else { c })
        .collect()
}

macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $($variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let token = normalize_token(s);
                match token.as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(UnknownVariant {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

text_enum! {
    /// Capture phase, in pipeline order.
    Stage, "stage" {
        Identified => "identified",
        Pursuit => "pursuit",
        Capture => "capture",
        ProposalDevelopment => "proposal_development",
        Submitted => "submitted",
    }
}

text_enum! {
    OpportunityStatus, "status" {
        Active => "active",
        Won => "won",
        Lost => "lost",
    }
}

text_enum! {
    ContractType, "contract type" {
        FirmFixedPrice => "firm_fixed_price",
        TimeAndMaterials => "time_and_materials",
        CostPlus => "cost_plus",
        Idiq => "idiq",
        Bpa => "bpa",
        Other => "other",
    }
}

text_enum! {
    ContractStatus, "contract status" {
        Active => "active",
        Completed => "completed",
        OnHold => "on_hold",
        Terminated => "terminated",
    }
}

text_enum! {
    QuoteStatus, "quote status" {
        Pending => "pending",
        Received => "received",
        Accepted => "accepted",
        Rejected => "rejected",
        Expired => "expired",
    }
}

text_enum! {
    EntityType, "entity type" {
        Opportunity => "opportunity",
        ExternalOpportunity => "external_opportunity",
        Contract => "contract",
        Quote => "quote",
        Subcontractor => "subcontractor",
        TeamMember => "team_member",
        ContactLog => "contact_log",
    }
}

text_enum! {
    ActivityType, "activity type" {
        Created => "created",
        Updated => "updated",
        Deleted => "deleted",
        Assigned => "assigned",
        Removed => "removed",
        Contact => "contact",
        StatusChange => "status_change",
        StageChange => "stage_change",
        Promoted => "promoted",
        Note => "note",
    }
}

text_enum! {
    ContactType, "contact type" {
        Email => "email",
        Phone => "phone",
        Meeting => "meeting",
        Other => "other",
    }
}

text_enum! {
    Role, "role" {
        Admin => "admin",
        User => "user",
    }
}

impl Stage {
    pub fn index(&self) -> usize {
        Self::ALL
            .iter()
            .position(|s| s == self)
            .unwrap_or_default()
    }

    /// Position of the stage along the pipeline as a 0-100 percentage.
    pub fn progress_percent(&self) -> u8 {
        let last = Self::ALL.len() - 1;
        ((self.index() * 100) as f64 / last as f64).round() as u8
    }
}

impl OpportunityStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Won | Self::Lost)
    }
}

/// The authenticated user on whose behalf a mutation runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub user_id: String,
    pub organization_id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, organization_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            organization_id: organization_id.into(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Descriptive fields of a procurement notice as published by the listing source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalListing {
    pub notice_id: String,
    pub solicitation_number: Option<String>,
    pub title: String,
    pub agency: Option<String>,
    pub office: Option<String>,
    pub notice_type: Option<String>,
    pub naics_code: Option<String>,
    pub classification_code: Option<String>,
    pub set_aside_type: Option<String>,
    pub set_aside_description: Option<String>,
    pub posted_date: Option<DateTime<Utc>>,
    pub response_deadline: Option<DateTime<Utc>>,
    pub archive_date: Option<DateTime<Utc>>,
    pub estimated_value: Option<f64>,
    pub place_of_performance_state: Option<String>,
    pub point_of_contact: Option<String>,
    pub description_url: Option<String>,
    pub ui_link: Option<String>,
    pub active: bool,
}

impl ExternalListing {
    pub fn new(notice_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            notice_id: notice_id.into(),
            solicitation_number: None,
            title: title.into(),
            agency: None,
            office: None,
            notice_type: None,
            naics_code: None,
            classification_code: None,
            set_aside_type: None,
            set_aside_description: None,
            posted_date: None,
            response_deadline: None,
            archive_date: None,
            estimated_value: None,
            place_of_performance_state: None,
            point_of_contact: None,
            description_url: None,
            ui_link: None,
            active: true,
        }
    }
}

/// Mirrored listing plus the local pipeline-membership flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalOpportunity {
    pub id: Uuid,
    #[serde(flatten)]
    pub listing: ExternalListing,
    pub added_to_pipeline: bool,
    pub added_to_pipeline_at: Option<DateTime<Utc>>,
    pub first_synced_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,
}

impl ExternalOpportunity {
    pub fn from_listing(listing: ExternalListing, synced_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            listing,
            added_to_pipeline: false,
            added_to_pipeline_at: None,
            first_synced_at: synced_at,
            last_synced_at: synced_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalStats {
    pub total: u64,
    pub in_pipeline: u64,
    pub last_synced_at: Option<DateTime<Utc>>,
}

pub const DEFAULT_WIN_PROBABILITY: u8 = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOpportunity {
    pub id: Uuid,
    pub organization_id: String,
    pub external_opportunity_id: Option<Uuid>,
    pub notice_id: Option<String>,
    pub solicitation_number: Option<String>,
    pub title: String,
    pub agency: Option<String>,
    pub description: Option<String>,
    pub naics_code: Option<String>,
    pub set_aside_type: Option<String>,
    pub stage: Stage,
    pub status: OpportunityStatus,
    pub probability: u8,
    pub estimated_value: Option<f64>,
    pub posted_date: Option<DateTime<Utc>>,
    pub response_deadline: Option<DateTime<Utc>>,
    pub source_url: Option<String>,
    pub contract_number: Option<String>,
    pub won_date: Option<DateTime<Utc>>,
    pub lost_date: Option<DateTime<Utc>>,
    pub lost_reason: Option<String>,
    pub lost_feedback: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineOpportunity {
    /// Blank active opportunity at the first stage.
    pub fn new(actor: &Actor, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id: actor.organization_id.clone(),
            external_opportunity_id: None,
            notice_id: None,
            solicitation_number: None,
            title: title.into(),
            agency: None,
            description: None,
            naics_code: None,
            set_aside_type: None,
            stage: Stage::Identified,
            status: OpportunityStatus::Active,
            probability: DEFAULT_WIN_PROBABILITY,
            estimated_value: None,
            posted_date: None,
            response_deadline: None,
            source_url: None,
            contract_number: None,
            won_date: None,
            lost_date: None,
            lost_reason: None,
            lost_feedback: None,
            created_by: actor.user_id.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// One-time copy of a mirrored listing into the pipeline.
    pub fn promoted_from(
        source: &ExternalOpportunity,
        organization_id: &str,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Self {
        let listing = &source.listing;
        let mut opp = Self::new(actor, listing.title.clone(), now);
        opp.organization_id = organization_id.to_string();
        opp.external_opportunity_id = Some(source.id);
        opp.notice_id = Some(listing.notice_id.clone());
        opp.solicitation_number = listing.solicitation_number.clone();
        opp.agency = listing.agency.clone();
        opp.naics_code = listing.naics_code.clone();
        opp.set_aside_type = listing.set_aside_type.clone();
        opp.estimated_value = listing.estimated_value;
        opp.posted_date = listing.posted_date;
        opp.response_deadline = listing.response_deadline;
        opp.source_url = listing
            .ui_link
            .clone()
            .or_else(|| listing.description_url.clone());
        opp
    }

    pub fn is_closed(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Read model returned to clients: the opportunity plus its derived progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityView {
    #[serde(flatten)]
    pub opportunity: PipelineOpportunity,
    pub stage_progress: u8,
}

impl From<PipelineOpportunity> for OpportunityView {
    fn from(opportunity: PipelineOpportunity) -> Self {
        let stage_progress = opportunity.stage.progress_percent();
        Self {
            opportunity,
            stage_progress,
        }
    }
}

/// Deadline ascending (missing deadlines last), then newest first.
pub fn pipeline_order(a: &PipelineOpportunity, b: &PipelineOpportunity) -> Ordering {
    let by_deadline = match (a.response_deadline, b.response_deadline) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_deadline.then_with(|| b.created_at.cmp(&a.created_at))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub id: Uuid,
    pub organization_id: String,
    pub contract_number: String,
    pub title: String,
    pub agency: Option<String>,
    pub contract_type: ContractType,
    pub status: ContractStatus,
    pub base_value: f64,
    pub total_value: f64,
    pub current_value: f64,
    pub award_date: DateTime<Utc>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub opportunity_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Default period of performance when an award does not state an end date.
pub fn one_year_after(start: DateTime<Utc>) -> DateTime<Utc> {
    start
        .checked_add_months(Months::new(12))
        .unwrap_or(start + chrono::Duration::days(365))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub id: Uuid,
    pub organization_id: String,
    pub opportunity_id: Option<Uuid>,
    pub subcontractor_id: Option<Uuid>,
    pub amount: f64,
    pub quote_date: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub status: QuoteStatus,
    pub description: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subcontractor {
    pub id: Uuid,
    pub organization_id: String,
    pub company_name: String,
    pub duns: Option<String>,
    pub cage_code: Option<String>,
    pub uei: Option<String>,
    pub contact_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub address: Option<String>,
    pub capabilities: Vec<String>,
    pub certifications: Vec<String>,
    pub naics_codes: Vec<String>,
    pub sam_registered: bool,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMember {
    pub id: Uuid,
    pub opportunity_id: Uuid,
    pub user_id: String,
    pub role: String,
    pub assigned_by: String,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactLog {
    pub id: Uuid,
    pub organization_id: String,
    pub subcontractor_id: Uuid,
    pub opportunity_id: Option<Uuid>,
    pub contact_type: ContactType,
    pub summary: String,
    pub contacted_by: String,
    pub contact_date: DateTime<Utc>,
    pub follow_up_date: Option<DateTime<Utc>>,
}

/// Append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: Uuid,
    pub organization_id: String,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub activity_type: ActivityType,
    pub description: String,
    pub actor_id: String,
    pub opportunity_id: Option<Uuid>,
    pub contract_id: Option<Uuid>,
    pub subcontractor_id: Option<Uuid>,
    pub metadata: serde_json::Value,
    pub activity_date: DateTime<Utc>,
}

impl Activity {
    pub fn new(
        actor: &Actor,
        entity_type: EntityType,
        entity_id: Uuid,
        activity_type: ActivityType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id: actor.organization_id.clone(),
            entity_type,
            entity_id,
            activity_type,
            description: description.into(),
            actor_id: actor.user_id.clone(),
            opportunity_id: None,
            contract_id: None,
            subcontractor_id: None,
            metadata: serde_json::Value::Null,
            activity_date: Utc::now(),
        }
    }

    pub fn for_opportunity(mut self, id: Uuid) -> Self {
        self.opportunity_id = Some(id);
        self
    }

    pub fn for_contract(mut self, id: Uuid) -> Self {
        self.contract_id = Some(id);
        self
    }

    pub fn for_subcontractor(mut self, id: Uuid) -> Self {
        self.subcontractor_id = Some(id);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}
