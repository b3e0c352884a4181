use std::sync::Arc;

use chrono::{DateTime, Utc};
use gcpt_core::command::{
    AssignTeamMember, CreateActivity, CreateContactLog, CreateContract, CreateOpportunity,
    CreateQuote, MarkLost, MarkWon, OpportunityPatch, PromoteExternal, SetStage,
    SubcontractorFields, UpdateContract, UpdateOpportunity, UpdateQuote,
};
use gcpt_core::{
    one_year_after, Activity, ActivityType, Actor, ContactLog, Contract, ContractStatus,
    ContractType, DomainError, DomainResult, EntityType, ExternalOpportunity, ExternalStats,
    OpportunityView, PipelineOpportunity, Quote, QuoteStatus, Stage, Subcontractor, TeamMember,
};
use gcpt_storage::{
    ActivityFilter, ActivityOutbox, ContractFilter, ExternalFilter, OpportunityFilter,
    PipelineStore, QuoteFilter, StoreHandles, SubcontractorFilter, MAX_ACTIVITY_LIMIT,
};
use serde::Serialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::activity::{ActivityRecorder, FlushReport, OutboxStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WonOutcome {
    pub opportunity: OpportunityView,
    pub contract: Contract,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RevertOutcome {
    pub contract: Contract,
    pub opportunity: OpportunityView,
}

fn require_admin(actor: &Actor, operation: &str) -> DomainResult<()> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(DomainError::Forbidden(format!("{operation} requires the admin role")))
    }
}

/// A supplied end must not precede the start, even when the start defaulted
/// to now. Without one the term runs a year.
fn contract_end(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> DomainResult<DateTime<Utc>> {
    match end {
        Some(end) if end < start => Err(DomainError::validation(
            "endDate must not be before startDate",
        )),
        Some(end) => Ok(end),
        None => Ok(one_year_after(start)),
    }
}

fn changed_fields(patch: &OpportunityPatch) -> Vec<&'static str> {
    [
        ("title", patch.title.is_some()),
        ("agency", patch.agency.is_some()),
        ("description", patch.description.is_some()),
        ("solicitationNumber", patch.solicitation_number.is_some()),
        ("naicsCode", patch.naics_code.is_some()),
        ("setAsideType", patch.set_aside_type.is_some()),
        ("probability", patch.probability.is_some()),
        ("estimatedValue", patch.estimated_value.is_some()),
        ("responseDeadline", patch.response_deadline.is_some()),
        ("sourceUrl", patch.source_url.is_some()),
    ]
    .into_iter()
    .filter_map(|(name, set)| set.then_some(name))
    .collect()
}

/// Opportunity lifecycle plus the satellite records hanging off it.
///
/// Every mutation follows the same shape: validate the command, run one store
/// call (atomic for multi-step transitions), then hand an `Activity` to the
/// recorder. Audit failures never reach the caller.
#[derive(Clone)]
pub struct PipelineService {
    store: Arc<dyn PipelineStore>,
    recorder: Arc<ActivityRecorder>,
}

impl PipelineService {
    pub fn new(store: Arc<dyn PipelineStore>, recorder: Arc<ActivityRecorder>) -> Self {
        Self { store, recorder }
    }

    /// Recorder writing back into the same store.
    pub fn with_store<S: PipelineStore + ActivityOutbox + 'static>(store: Arc<S>) -> Self {
        Self::from_handles(StoreHandles::new(store))
    }

    pub fn from_handles(handles: StoreHandles) -> Self {
        let recorder = Arc::new(ActivityRecorder::new(handles.activities, handles.outbox));
        Self::new(handles.pipeline, recorder)
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.store
    }

    pub fn recorder(&self) -> &Arc<ActivityRecorder> {
        &self.recorder
    }

    async fn opportunity(&self, id: Uuid) -> DomainResult<PipelineOpportunity> {
        self.store
            .get_opportunity(id)
            .await?
            .ok_or_else(|| DomainError::not_found("opportunity", id))
    }

    async fn contract(&self, id: Uuid) -> DomainResult<Contract> {
        self.store
            .get_contract(id)
            .await?
            .ok_or_else(|| DomainError::not_found("contract", id))
    }

    async fn subcontractor(&self, id: Uuid) -> DomainResult<Subcontractor> {
        self.store
            .get_subcontractor(id)
            .await?
            .ok_or_else(|| DomainError::not_found("subcontractor", id))
    }

    // External mirror

    pub async fn list_external(&self, filter: &ExternalFilter) -> DomainResult<Vec<ExternalOpportunity>> {
        Ok(self.store.list_external(filter).await?)
    }

    pub async fn get_external(&self, id: Uuid) -> DomainResult<ExternalOpportunity> {
        self.store
            .get_external(id)
            .await?
            .ok_or_else(|| DomainError::not_found("external opportunity", id))
    }

    pub async fn external_stats(&self) -> DomainResult<ExternalStats> {
        Ok(self.store.external_stats().await?)
    }

    pub async fn promote_external(
        &self,
        actor: &Actor,
        external_id: Uuid,
        cmd: PromoteExternal,
    ) -> DomainResult<OpportunityView> {
        let organization_id = cmd.validate()?;
        let source = self.get_external(external_id).await?;
        let now = Utc::now();
        let draft = PipelineOpportunity::promoted_from(&source, &organization_id, actor, now);
        let opp = self.store.promote_external(external_id, draft, now).await?;

        info!(
            opportunity_id = %opp.id,
            external_id = %external_id,
            notice_id = %source.listing.notice_id,
            "external opportunity promoted"
        );
        let mut activity = Activity::new(
            actor,
            EntityType::Opportunity,
            opp.id,
            ActivityType::Created,
            format!("Added \"{}\" to the pipeline from SAM.gov", opp.title),
        )
        .for_opportunity(opp.id)
        .with_metadata(json!({
            "externalOpportunityId": external_id,
            "noticeId": source.listing.notice_id,
        }));
        activity.organization_id = opp.organization_id.clone();
        self.recorder.record(activity).await;
        Ok(opp.into())
    }

    // Opportunities

    pub async fn create_opportunity(
        &self,
        actor: &Actor,
        cmd: CreateOpportunity,
    ) -> DomainResult<OpportunityView> {
        let new = cmd.validate()?;
        let mut opp = PipelineOpportunity::new(actor, new.title, Utc::now());
        opp.stage = new.stage;
        new.fields.apply(&mut opp);
        let opp = self.store.insert_opportunity(opp).await?;

        info!(opportunity_id = %opp.id, "opportunity created");
        self.recorder
            .record(
                Activity::new(
                    actor,
                    EntityType::Opportunity,
                    opp.id,
                    ActivityType::Created,
                    format!("Created opportunity \"{}\"", opp.title),
                )
                .for_opportunity(opp.id),
            )
            .await;
        Ok(opp.into())
    }

    pub async fn get_opportunity(&self, id: Uuid) -> DomainResult<OpportunityView> {
        Ok(self.opportunity(id).await?.into())
    }

    pub async fn list_opportunities(&self, filter: &OpportunityFilter) -> DomainResult<Vec<OpportunityView>> {
        let rows = self.store.list_opportunities(filter).await?;
        Ok(rows.into_iter().map(OpportunityView::from).collect())
    }

    pub async fn update_opportunity(
        &self,
        actor: &Actor,
        id: Uuid,
        cmd: UpdateOpportunity,
    ) -> DomainResult<OpportunityView> {
        let patch = cmd.validate()?;
        let opp = self.store.update_opportunity(id, &patch, Utc::now()).await?;
        self.recorder
            .record(
                Activity::new(
                    actor,
                    EntityType::Opportunity,
                    opp.id,
                    ActivityType::Updated,
                    format!("Updated opportunity \"{}\"", opp.title),
                )
                .for_opportunity(opp.id)
                .with_metadata(json!({ "fields": changed_fields(&patch) })),
            )
            .await;
        Ok(opp.into())
    }

    pub async fn set_stage(&self, actor: &Actor, id: Uuid, cmd: SetStage) -> DomainResult<OpportunityView> {
        let stage = cmd.validate()?;
        let (previous, opp) = self.store.set_stage(id, stage, Utc::now()).await?;

        info!(opportunity_id = %id, from = %previous, to = %stage, "stage changed");
        self.recorder
            .record(
                Activity::new(
                    actor,
                    EntityType::Opportunity,
                    id,
                    ActivityType::StageChange,
                    format!("Stage changed from {previous} to {stage}"),
                )
                .for_opportunity(id)
                .with_metadata(json!({ "from": previous, "to": stage })),
            )
            .await;
        Ok(opp.into())
    }

    pub async fn mark_won(&self, actor: &Actor, id: Uuid, cmd: MarkWon) -> DomainResult<WonOutcome> {
        let award = cmd.validate()?;
        let current = self.opportunity(id).await?;

        let now = Utc::now();
        let value = award
            .award_amount
            .or(current.estimated_value)
            .unwrap_or(0.0);
        let start_date = award.start_date.unwrap_or(now);
        let end_date = contract_end(start_date, award.end_date)?;
        let contract = Contract {
            id: Uuid::new_v4(),
            organization_id: current.organization_id.clone(),
            contract_number: award.contract_number,
            title: current.title.clone(),
            agency: current.agency.clone(),
            contract_type: award.contract_type,
            status: ContractStatus::Active,
            base_value: value,
            total_value: value,
            current_value: value,
            award_date: now,
            start_date,
            end_date,
            opportunity_id: Some(id),
            created_at: now,
            updated_at: now,
        };

        let (opp, contract) = self.store.mark_won(id, contract, now).await?;
        info!(
            opportunity_id = %id,
            contract_id = %contract.id,
            contract_number = %contract.contract_number,
            "opportunity won"
        );
        self.recorder
            .record(
                Activity::new(
                    actor,
                    EntityType::Opportunity,
                    id,
                    ActivityType::StatusChange,
                    format!("Marked as won; contract {} created", contract.contract_number),
                )
                .for_opportunity(id)
                .for_contract(contract.id)
                .with_metadata(json!({
                    "status": "won",
                    "contractNumber": contract.contract_number,
                    "value": value,
                })),
            )
            .await;
        Ok(WonOutcome {
            opportunity: opp.into(),
            contract,
        })
    }

    pub async fn mark_lost(&self, actor: &Actor, id: Uuid, cmd: MarkLost) -> DomainResult<OpportunityView> {
        let loss = cmd.validate()?;
        let opp = self.store.mark_lost(id, &loss, Utc::now()).await?;

        info!(opportunity_id = %id, reason = %loss.reason, "opportunity lost");
        self.recorder
            .record(
                Activity::new(
                    actor,
                    EntityType::Opportunity,
                    id,
                    ActivityType::StatusChange,
                    format!("Marked as lost: {}", loss.reason),
                )
                .for_opportunity(id)
                .with_metadata(json!({
                    "status": "lost",
                    "lostReason": loss.reason,
                    "lostFeedback": loss.feedback,
                })),
            )
            .await;
        Ok(opp.into())
    }

    /// Deletes the opportunity and, for promoted ones, releases the source
    /// listing so it can be promoted again.
    pub async fn remove_from_pipeline(&self, actor: &Actor, id: Uuid) -> DomainResult<PipelineOpportunity> {
        let removed = self.store.remove_opportunity(id).await?;

        info!(
            opportunity_id = %id,
            external_id = ?removed.external_opportunity_id,
            "opportunity removed from pipeline"
        );
        self.recorder
            .record(
                Activity::new(
                    actor,
                    EntityType::Opportunity,
                    id,
                    ActivityType::Removed,
                    format!("Removed \"{}\" from the pipeline", removed.title),
                )
                .with_metadata(json!({
                    "externalOpportunityId": removed.external_opportunity_id,
                    "noticeId": removed.notice_id,
                })),
            )
            .await;
        Ok(removed)
    }

    // Team

    pub async fn assign_team_member(
        &self,
        actor: &Actor,
        opportunity_id: Uuid,
        cmd: AssignTeamMember,
    ) -> DomainResult<TeamMember> {
        let (user_id, role) = cmd.validate()?;
        let member = TeamMember {
            id: Uuid::new_v4(),
            opportunity_id,
            user_id,
            role,
            assigned_by: actor.user_id.clone(),
            assigned_at: Utc::now(),
        };
        let member = self.store.add_team_member(member).await?;
        self.recorder
            .record(
                Activity::new(
                    actor,
                    EntityType::TeamMember,
                    member.id,
                    ActivityType::Assigned,
                    format!("Assigned {} as {}", member.user_id, member.role),
                )
                .for_opportunity(opportunity_id)
                .with_metadata(json!({ "userId": member.user_id, "role": member.role })),
            )
            .await;
        Ok(member)
    }

    pub async fn list_team(&self, opportunity_id: Uuid) -> DomainResult<Vec<TeamMember>> {
        self.opportunity(opportunity_id).await?;
        Ok(self.store.list_team_members(opportunity_id).await?)
    }

    pub async fn remove_team_member(
        &self,
        actor: &Actor,
        opportunity_id: Uuid,
        user_id: &str,
    ) -> DomainResult<TeamMember> {
        let member = self.store.remove_team_member(opportunity_id, user_id).await?;
        self.recorder
            .record(
                Activity::new(
                    actor,
                    EntityType::TeamMember,
                    member.id,
                    ActivityType::Removed,
                    format!("Removed {} from the team", member.user_id),
                )
                .for_opportunity(opportunity_id)
                .with_metadata(json!({ "userId": member.user_id })),
            )
            .await;
        Ok(member)
    }

    // Contracts

    pub async fn create_contract(&self, actor: &Actor, cmd: CreateContract) -> DomainResult<Contract> {
        let new = cmd.validate()?;
        if let Some(opp_id) = new.opportunity_id {
            self.opportunity(opp_id).await?;
        }
        let now = Utc::now();
        let fields = &new.fields;
        let base_value = fields.base_value.unwrap_or(0.0);
        let total_value = fields.total_value.unwrap_or(base_value);
        let start_date = fields.start_date.unwrap_or(now);
        let end_date = contract_end(start_date, fields.end_date)?;
        let contract = Contract {
            id: Uuid::new_v4(),
            organization_id: actor.organization_id.clone(),
            contract_number: new.contract_number,
            title: new.title,
            agency: fields.agency.clone(),
            contract_type: fields.contract_type.unwrap_or(ContractType::FirmFixedPrice),
            status: fields.status.unwrap_or(ContractStatus::Active),
            base_value,
            total_value,
            current_value: fields.current_value.unwrap_or(total_value),
            award_date: fields.award_date.unwrap_or(now),
            start_date,
            end_date,
            opportunity_id: new.opportunity_id,
            created_at: now,
            updated_at: now,
        };
        let contract = self.store.insert_contract(contract).await?;

        info!(contract_id = %contract.id, contract_number = %contract.contract_number, "contract created");
        let mut activity = Activity::new(
            actor,
            EntityType::Contract,
            contract.id,
            ActivityType::Created,
            format!("Created contract {}", contract.contract_number),
        )
        .for_contract(contract.id);
        activity.opportunity_id = contract.opportunity_id;
        self.recorder.record(activity).await;
        Ok(contract)
    }

    pub async fn get_contract(&self, id: Uuid) -> DomainResult<Contract> {
        self.contract(id).await
    }

    pub async fn list_contracts(&self, filter: &ContractFilter) -> DomainResult<Vec<Contract>> {
        Ok(self.store.list_contracts(filter).await?)
    }

    pub async fn update_contract(&self, actor: &Actor, id: Uuid, cmd: UpdateContract) -> DomainResult<Contract> {
        let patch = cmd.validate()?;
        let contract = self.store.update_contract(id, &patch, Utc::now()).await?;
        if contract.end_date < contract.start_date {
            tracing::warn!(contract_id = %id, "contract end date precedes start date after update");
        }
        let mut activity = Activity::new(
            actor,
            EntityType::Contract,
            id,
            ActivityType::Updated,
            format!("Updated contract {}", contract.contract_number),
        )
        .for_contract(id);
        activity.opportunity_id = contract.opportunity_id;
        self.recorder.record(activity).await;
        Ok(contract)
    }

    /// Removes the contract only; an originating opportunity keeps its status.
    pub async fn delete_contract(&self, actor: &Actor, id: Uuid) -> DomainResult<Contract> {
        let contract = self.store.delete_contract(id).await?;
        info!(contract_id = %id, "contract deleted");
        let mut activity = Activity::new(
            actor,
            EntityType::Contract,
            id,
            ActivityType::Deleted,
            format!("Deleted contract {}", contract.contract_number),
        )
        .with_metadata(json!({ "contractNumber": contract.contract_number }));
        activity.opportunity_id = contract.opportunity_id;
        self.recorder.record(activity).await;
        Ok(contract)
    }

    /// Admin-only: swap a contract for a fresh active opportunity at the
    /// submitted stage. The won opportunity it came from stays won.
    pub async fn revert_contract(&self, actor: &Actor, id: Uuid) -> DomainResult<RevertOutcome> {
        require_admin(actor, "reverting a contract")?;
        let contract = self.contract(id).await?;

        let mut reopened = PipelineOpportunity::new(actor, contract.title.clone(), Utc::now());
        reopened.organization_id = contract.organization_id.clone();
        reopened.agency = contract.agency.clone();
        reopened.estimated_value = Some(contract.total_value);
        reopened.stage = Stage::Submitted;

        let (contract, opp) = self.store.revert_contract(id, reopened).await?;
        info!(contract_id = %id, opportunity_id = %opp.id, "contract reverted to opportunity");
        self.recorder
            .record(
                Activity::new(
                    actor,
                    EntityType::Opportunity,
                    opp.id,
                    ActivityType::Created,
                    format!("Reverted contract {} to an opportunity", contract.contract_number),
                )
                .for_opportunity(opp.id)
                .with_metadata(json!({
                    "revertedContractId": contract.id,
                    "contractNumber": contract.contract_number,
                    "originatingOpportunityId": contract.opportunity_id,
                })),
            )
            .await;
        Ok(RevertOutcome {
            contract,
            opportunity: opp.into(),
        })
    }

    // Quotes

    fn quote_activity(actor: &Actor, quote: &Quote, kind: ActivityType, verb: &str) -> Option<Activity> {
        let opportunity_id = quote.opportunity_id?;
        let mut activity = Activity::new(
            actor,
            EntityType::Quote,
            quote.id,
            kind,
            format!("{verb} quote for {:.2}", quote.amount),
        )
        .for_opportunity(opportunity_id)
        .with_metadata(json!({ "amount": quote.amount, "status": quote.status }));
        activity.subcontractor_id = quote.subcontractor_id;
        Some(activity)
    }

    pub async fn create_quote(&self, actor: &Actor, cmd: CreateQuote) -> DomainResult<Quote> {
        let new = cmd.validate()?;
        if let Some(opp_id) = new.opportunity_id {
            self.opportunity(opp_id).await?;
        }
        if let Some(sub_id) = new.subcontractor_id {
            self.subcontractor(sub_id).await?;
        }
        let now = Utc::now();
        let mut quote = Quote {
            id: Uuid::new_v4(),
            organization_id: actor.organization_id.clone(),
            opportunity_id: new.opportunity_id,
            subcontractor_id: new.subcontractor_id,
            amount: new.amount,
            quote_date: new.quote_date,
            valid_until: None,
            status: QuoteStatus::Pending,
            description: None,
            notes: None,
            created_at: now,
            updated_at: now,
        };
        new.fields.apply(&mut quote);
        let quote = self.store.insert_quote(quote).await?;
        if let Some(activity) = Self::quote_activity(actor, &quote, ActivityType::Created, "Added") {
            self.recorder.record(activity).await;
        }
        Ok(quote)
    }

    pub async fn get_quote(&self, id: Uuid) -> DomainResult<Quote> {
        self.store
            .get_quote(id)
            .await?
            .ok_or_else(|| DomainError::not_found("quote", id))
    }

    pub async fn list_quotes(&self, filter: &QuoteFilter) -> DomainResult<Vec<Quote>> {
        Ok(self.store.list_quotes(filter).await?)
    }

    pub async fn update_quote(&self, actor: &Actor, id: Uuid, cmd: UpdateQuote) -> DomainResult<Quote> {
        let patch = cmd.validate()?;
        let quote = self.store.update_quote(id, &patch, Utc::now()).await?;
        if let Some(activity) = Self::quote_activity(actor, &quote, ActivityType::Updated, "Updated") {
            self.recorder.record(activity).await;
        }
        Ok(quote)
    }

    pub async fn delete_quote(&self, actor: &Actor, id: Uuid) -> DomainResult<Quote> {
        let quote = self.store.delete_quote(id).await?;
        if let Some(activity) = Self::quote_activity(actor, &quote, ActivityType::Deleted, "Deleted") {
            self.recorder.record(activity).await;
        }
        Ok(quote)
    }

    // Subcontractors

    pub async fn create_subcontractor(&self, actor: &Actor, cmd: SubcontractorFields) -> DomainResult<Subcontractor> {
        let (company_name, patch) = cmd.validate_new()?;
        let now = Utc::now();
        let mut sub = Subcontractor {
            id: Uuid::new_v4(),
            organization_id: actor.organization_id.clone(),
            company_name,
            duns: None,
            cage_code: None,
            uei: None,
            contact_name: None,
            email: None,
            phone: None,
            website: None,
            address: None,
            capabilities: Vec::new(),
            certifications: Vec::new(),
            naics_codes: Vec::new(),
            sam_registered: false,
            notes: None,
            created_at: now,
            updated_at: now,
        };
        patch.apply(&mut sub);
        let sub = self.store.insert_subcontractor(sub).await?;
        info!(subcontractor_id = %sub.id, "subcontractor created");
        self.recorder
            .record(
                Activity::new(
                    actor,
                    EntityType::Subcontractor,
                    sub.id,
                    ActivityType::Created,
                    format!("Added subcontractor {}", sub.company_name),
                )
                .for_subcontractor(sub.id),
            )
            .await;
        Ok(sub)
    }

    pub async fn get_subcontractor(&self, id: Uuid) -> DomainResult<Subcontractor> {
        self.subcontractor(id).await
    }

    pub async fn list_subcontractors(&self, filter: &SubcontractorFilter) -> DomainResult<Vec<Subcontractor>> {
        Ok(self.store.list_subcontractors(filter).await?)
    }

    pub async fn update_subcontractor(
        &self,
        actor: &Actor,
        id: Uuid,
        cmd: SubcontractorFields,
    ) -> DomainResult<Subcontractor> {
        let patch = cmd.validate_update()?;
        let sub = self.store.update_subcontractor(id, &patch, Utc::now()).await?;
        self.recorder
            .record(
                Activity::new(
                    actor,
                    EntityType::Subcontractor,
                    id,
                    ActivityType::Updated,
                    format!("Updated subcontractor {}", sub.company_name),
                )
                .for_subcontractor(id),
            )
            .await;
        Ok(sub)
    }

    /// The deletion entry keeps only `entity_id`; the subcontractor link
    /// would dangle.
    pub async fn delete_subcontractor(&self, actor: &Actor, id: Uuid) -> DomainResult<Subcontractor> {
        let sub = self.store.delete_subcontractor(id).await?;
        info!(subcontractor_id = %id, "subcontractor deleted");
        self.recorder
            .record(Activity::new(
                actor,
                EntityType::Subcontractor,
                id,
                ActivityType::Deleted,
                format!("Deleted subcontractor {}", sub.company_name),
            ))
            .await;
        Ok(sub)
    }

    // Contact logs

    pub async fn create_contact_log(
        &self,
        actor: &Actor,
        subcontractor_id: Uuid,
        cmd: CreateContactLog,
    ) -> DomainResult<ContactLog> {
        let new = cmd.validate()?;
        let sub = self.subcontractor(subcontractor_id).await?;
        if let Some(opp_id) = new.opportunity_id {
            self.opportunity(opp_id).await?;
        }
        let log = ContactLog {
            id: Uuid::new_v4(),
            organization_id: actor.organization_id.clone(),
            subcontractor_id,
            opportunity_id: new.opportunity_id,
            contact_type: new.contact_type,
            summary: new.summary,
            contacted_by: actor.user_id.clone(),
            contact_date: new.contact_date.unwrap_or_else(Utc::now),
            follow_up_date: new.follow_up_date,
        };
        let log = self.store.insert_contact_log(log).await?;

        let mut activity = Activity::new(
            actor,
            EntityType::ContactLog,
            log.id,
            ActivityType::Contact,
            format!("Logged {} with {}", log.contact_type, sub.company_name),
        )
        .for_subcontractor(subcontractor_id)
        .with_metadata(json!({ "contactType": log.contact_type, "summary": log.summary }));
        activity.opportunity_id = log.opportunity_id;
        self.recorder.record(activity).await;
        Ok(log)
    }

    pub async fn list_contact_logs(&self, subcontractor_id: Uuid) -> DomainResult<Vec<ContactLog>> {
        self.subcontractor(subcontractor_id).await?;
        Ok(self.store.list_contact_logs(subcontractor_id).await?)
    }

    pub async fn delete_contact_log(&self, actor: &Actor, id: Uuid) -> DomainResult<ContactLog> {
        let log = self.store.delete_contact_log(id).await?;
        let mut activity = Activity::new(
            actor,
            EntityType::ContactLog,
            id,
            ActivityType::Deleted,
            "Deleted contact log",
        )
        .for_subcontractor(log.subcontractor_id);
        activity.opportunity_id = log.opportunity_id;
        self.recorder.record(activity).await;
        Ok(log)
    }

    // Activities

    /// Direct note entry; this is the primary write, so failures propagate.
    pub async fn create_activity(&self, actor: &Actor, cmd: CreateActivity) -> DomainResult<Activity> {
        let new = cmd.validate()?;
        let mut activity = Activity::new(
            actor,
            new.entity_type,
            new.entity_id,
            new.activity_type,
            new.description,
        )
        .with_metadata(new.metadata);
        activity.opportunity_id = new.opportunity_id;
        activity.contract_id = new.contract_id;
        activity.subcontractor_id = new.subcontractor_id;
        if let Some(opp_id) = activity.opportunity_id {
            self.opportunity(opp_id).await?;
        }
        if let Some(contract_id) = activity.contract_id {
            self.contract(contract_id).await?;
        }
        if let Some(sub_id) = activity.subcontractor_id {
            self.subcontractor(sub_id).await?;
        }
        Ok(self.store.append_activity(activity).await?)
    }

    pub async fn list_activities(&self, filter: &ActivityFilter) -> DomainResult<Vec<Activity>> {
        let mut filter = filter.clone();
        filter.limit = filter.limit.clamp(1, MAX_ACTIVITY_LIMIT);
        Ok(self.store.list_activities(&filter).await?)
    }

    pub async fn opportunity_activities(&self, opportunity_id: Uuid, limit: usize) -> DomainResult<Vec<Activity>> {
        self.opportunity(opportunity_id).await?;
        self.list_activities(&ActivityFilter {
            opportunity_id: Some(opportunity_id),
            limit,
            ..Default::default()
        })
        .await
    }

    pub async fn delete_activity(&self, actor: &Actor, id: Uuid) -> DomainResult<Activity> {
        require_admin(actor, "deleting an activity")?;
        Ok(self.store.delete_activity(id).await?)
    }

    pub async fn outbox_status(&self) -> OutboxStatus {
        self.recorder.status().await
    }

    pub async fn flush_outbox(&self) -> FlushReport {
        self.recorder.flush().await
    }
}
