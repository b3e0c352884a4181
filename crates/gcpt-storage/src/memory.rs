//! In-process store used by tests and database-less runs.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gcpt_core::command::{ContractPatch, LossDetails, OpportunityPatch, QuotePatch, SubcontractorPatch};
use gcpt_core::{
    pipeline_order, Activity, ConflictKind, ContactLog, Contract, ExternalListing,
    ExternalOpportunity, ExternalStats, OpportunityStatus, PipelineOpportunity, Quote, Stage,
    Subcontractor, TeamMember, UpsertOutcome,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    lost_conflict, won_conflict, ActivityFilter, ActivityOutbox, ActivitySink, ContractFilter,
    ExternalFilter, OpportunityFilter, PipelineStore, QuoteFilter, StoreError, StoreResult, SubcontractorFilter,
};

#[derive(Debug, Default)]
struct Tables {
    external: HashMap<Uuid, ExternalOpportunity>,
    external_by_notice: HashMap<String, Uuid>,
    opportunities: HashMap<Uuid, PipelineOpportunity>,
    contracts: HashMap<Uuid, Contract>,
    quotes: HashMap<Uuid, Quote>,
    subcontractors: HashMap<Uuid, Subcontractor>,
    team: HashMap<Uuid, TeamMember>,
    activities: HashMap<Uuid, Activity>,
    outbox: VecDeque<Activity>,
    contact_logs: HashMap<Uuid, ContactLog>,
}

impl Tables {
    fn contract_number_taken(&self, number: &str, except: Option<Uuid>) -> bool {
        self.contracts
            .values()
            .any(|c| c.contract_number == number && Some(c.id) != except)
    }

    fn opportunity_mut(&mut self, id: Uuid) -> StoreResult<&mut PipelineOpportunity> {
        self.opportunities
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("opportunity", id))
    }

    /// Cascades matching the relational schema's foreign keys.
    fn drop_opportunity_dependents(&mut self, id: Uuid) {
        self.quotes.retain(|_, q| q.opportunity_id != Some(id));
        self.team.retain(|_, m| m.opportunity_id != id);
        self.activities.retain(|_, a| a.opportunity_id != Some(id));
        self.outbox.retain(|a| a.opportunity_id != Some(id));
        for contract in self.contracts.values_mut() {
            if contract.opportunity_id == Some(id) {
                contract.opportunity_id = None;
            }
        }
        for log in self.contact_logs.values_mut() {
            if log.opportunity_id == Some(id) {
                log.opportunity_id = None;
            }
        }
    }

    fn detach_contract(&mut self, id: Uuid) {
        for activity in self.activities.values_mut() {
            if activity.contract_id == Some(id) {
                activity.contract_id = None;
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first<T, F>(rows: &mut [T], key: F)
where
    F: Fn(&T) -> DateTime<Utc>,
{
    rows.sort_by_key(|r| std::cmp::Reverse(key(r)));
}

#[async_trait]
impl ActivitySink for MemoryStore {
    async fn append_activity(&self, activity: Activity) -> StoreResult<Activity> {
        let mut t = self.tables.write().await;
        t.activities.insert(activity.id, activity.clone());
        Ok(activity)
    }
}

#[async_trait]
impl ActivityOutbox for MemoryStore {
    async fn queue_activity(&self, activity: &Activity) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        if !t.outbox.iter().any(|a| a.id == activity.id) {
            t.outbox.push_back(activity.clone());
        }
        Ok(())
    }

    async fn next_queued(&self, limit: usize) -> StoreResult<Vec<Activity>> {
        let t = self.tables.read().await;
        Ok(t.outbox.iter().take(limit).cloned().collect())
    }

    async fn mark_delivered(&self, id: Uuid) -> StoreResult<()> {
        self.tables.write().await.outbox.retain(|a| a.id != id);
        Ok(())
    }

    async fn queued_count(&self) -> StoreResult<usize> {
        Ok(self.tables.read().await.outbox.len())
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn upsert_external(
        &self,
        listing: ExternalListing,
        synced_at: DateTime<Utc>,
    ) -> StoreResult<UpsertOutcome> {
        let mut t = self.tables.write().await;
        if let Some(id) = t.external_by_notice.get(&listing.notice_id).copied() {
            if let Some(existing) = t.external.get_mut(&id) {
                existing.listing = listing;
                existing.last_synced_at = synced_at;
                return Ok(UpsertOutcome::Updated);
            }
        }
        let ext = ExternalOpportunity::from_listing(listing, synced_at);
        t.external_by_notice
            .insert(ext.listing.notice_id.clone(), ext.id);
        t.external.insert(ext.id, ext);
        Ok(UpsertOutcome::Inserted)
    }

    async fn get_external(&self, id: Uuid) -> StoreResult<Option<ExternalOpportunity>> {
        Ok(self.tables.read().await.external.get(&id).cloned())
    }

    async fn list_external(&self, filter: &ExternalFilter) -> StoreResult<Vec<ExternalOpportunity>> {
        let t = self.tables.read().await;
        let mut rows = t
            .external
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| {
            b.listing
                .posted_date
                .cmp(&a.listing.posted_date)
                .then_with(|| a.listing.notice_id.cmp(&b.listing.notice_id))
        });
        rows.truncate(filter.limit);
        Ok(rows)
    }

    async fn external_stats(&self) -> StoreResult<ExternalStats> {
        let t = self.tables.read().await;
        Ok(ExternalStats {
            total: t.external.len() as u64,
            in_pipeline: t.external.values().filter(|e| e.added_to_pipeline).count() as u64,
            last_synced_at: t.external.values().map(|e| e.last_synced_at).max(),
        })
    }

    async fn promote_external(
        &self,
        external_id: Uuid,
        opportunity: PipelineOpportunity,
        at: DateTime<Utc>,
    ) -> StoreResult<PipelineOpportunity> {
        let mut t = self.tables.write().await;
        let source = t
            .external
            .get_mut(&external_id)
            .ok_or_else(|| StoreError::not_found("external opportunity", external_id))?;
        if source.added_to_pipeline {
            return Err(ConflictKind::AlreadyInPipeline.into());
        }
        source.added_to_pipeline = true;
        source.added_to_pipeline_at = Some(at);
        t.opportunities.insert(opportunity.id, opportunity.clone());
        Ok(opportunity)
    }

    async fn insert_opportunity(&self, opp: PipelineOpportunity) -> StoreResult<PipelineOpportunity> {
        let mut t = self.tables.write().await;
        t.opportunities.insert(opp.id, opp.clone());
        Ok(opp)
    }

    async fn get_opportunity(&self, id: Uuid) -> StoreResult<Option<PipelineOpportunity>> {
        Ok(self.tables.read().await.opportunities.get(&id).cloned())
    }

    async fn list_opportunities(&self, filter: &OpportunityFilter) -> StoreResult<Vec<PipelineOpportunity>> {
        let t = self.tables.read().await;
        let mut rows = t
            .opportunities
            .values()
            .filter(|o| filter.matches(o))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(pipeline_order);
        Ok(rows)
    }

    async fn update_opportunity(
        &self,
        id: Uuid,
        patch: &OpportunityPatch,
        at: DateTime<Utc>,
    ) -> StoreResult<PipelineOpportunity> {
        let mut t = self.tables.write().await;
        let opp = t.opportunity_mut(id)?;
        patch.apply(opp);
        opp.updated_at = at;
        Ok(opp.clone())
    }

    async fn set_stage(
        &self,
        id: Uuid,
        stage: Stage,
        at: DateTime<Utc>,
    ) -> StoreResult<(Stage, PipelineOpportunity)> {
        let mut t = self.tables.write().await;
        let opp = t.opportunity_mut(id)?;
        if opp.is_closed() {
            return Err(ConflictKind::OpportunityClosed.into());
        }
        let previous = opp.stage;
        opp.stage = stage;
        opp.updated_at = at;
        Ok((previous, opp.clone()))
    }

    async fn mark_won(
        &self,
        id: Uuid,
        contract: Contract,
        at: DateTime<Utc>,
    ) -> StoreResult<(PipelineOpportunity, Contract)> {
        let mut t = self.tables.write().await;
        let status = t.opportunity_mut(id)?.status;
        if status != OpportunityStatus::Active {
            return Err(won_conflict(status).into());
        }
        if t.contract_number_taken(&contract.contract_number, None) {
            return Err(ConflictKind::DuplicateContractNumber.into());
        }
        let opp = t.opportunity_mut(id)?;
        opp.status = OpportunityStatus::Won;
        opp.stage = Stage::Submitted;
        opp.won_date = Some(at);
        opp.contract_number = Some(contract.contract_number.clone());
        opp.updated_at = at;
        let opp = opp.clone();
        t.contracts.insert(contract.id, contract.clone());
        Ok((opp, contract))
    }

    async fn mark_lost(
        &self,
        id: Uuid,
        loss: &LossDetails,
        at: DateTime<Utc>,
    ) -> StoreResult<PipelineOpportunity> {
        let mut t = self.tables.write().await;
        let opp = t.opportunity_mut(id)?;
        if opp.status != OpportunityStatus::Active {
            return Err(lost_conflict(opp.status).into());
        }
        opp.status = OpportunityStatus::Lost;
        opp.lost_date = Some(at);
        opp.lost_reason = Some(loss.reason.clone());
        opp.lost_feedback = loss.feedback.clone();
        opp.updated_at = at;
        Ok(opp.clone())
    }

    async fn remove_opportunity(&self, id: Uuid) -> StoreResult<PipelineOpportunity> {
        let mut t = self.tables.write().await;
        let source_id = t.opportunity_mut(id)?.external_opportunity_id;
        if let Some(source) = source_id.and_then(|sid| t.external.get_mut(&sid)) {
            source.added_to_pipeline = false;
            source.added_to_pipeline_at = None;
        }
        let removed = t
            .opportunities
            .remove(&id)
            .ok_or_else(|| StoreError::not_found("opportunity", id))?;
        t.drop_opportunity_dependents(id);
        Ok(removed)
    }

    async fn insert_contract(&self, contract: Contract) -> StoreResult<Contract> {
        let mut t = self.tables.write().await;
        if t.contract_number_taken(&contract.contract_number, None) {
            return Err(ConflictKind::DuplicateContractNumber.into());
        }
        t.contracts.insert(contract.id, contract.clone());
        Ok(contract)
    }

    async fn get_contract(&self, id: Uuid) -> StoreResult<Option<Contract>> {
        Ok(self.tables.read().await.contracts.get(&id).cloned())
    }

    async fn list_contracts(&self, filter: &ContractFilter) -> StoreResult<Vec<Contract>> {
        let t = self.tables.read().await;
        let mut rows = t
            .contracts
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect::<Vec<_>>();
        newest_first(&mut rows, |c| c.award_date);
        Ok(rows)
    }

    async fn update_contract(
        &self,
        id: Uuid,
        patch: &ContractPatch,
        at: DateTime<Utc>,
    ) -> StoreResult<Contract> {
        let mut t = self.tables.write().await;
        if let Some(number) = &patch.contract_number {
            if t.contract_number_taken(number, Some(id)) {
                return Err(ConflictKind::DuplicateContractNumber.into());
            }
        }
        let contract = t
            .contracts
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("contract", id))?;
        patch.apply(contract);
        contract.updated_at = at;
        Ok(contract.clone())
    }

    async fn delete_contract(&self, id: Uuid) -> StoreResult<Contract> {
        let mut t = self.tables.write().await;
        let removed = t
            .contracts
            .remove(&id)
            .ok_or_else(|| StoreError::not_found("contract", id))?;
        t.detach_contract(id);
        Ok(removed)
    }

    async fn revert_contract(
        &self,
        id: Uuid,
        reopened: PipelineOpportunity,
    ) -> StoreResult<(Contract, PipelineOpportunity)> {
        let mut t = self.tables.write().await;
        let removed = t
            .contracts
            .remove(&id)
            .ok_or_else(|| StoreError::not_found("contract", id))?;
        t.detach_contract(id);
        t.opportunities.insert(reopened.id, reopened.clone());
        Ok((removed, reopened))
    }

    async fn insert_quote(&self, quote: Quote) -> StoreResult<Quote> {
        let mut t = self.tables.write().await;
        t.quotes.insert(quote.id, quote.clone());
        Ok(quote)
    }

    async fn get_quote(&self, id: Uuid) -> StoreResult<Option<Quote>> {
        Ok(self.tables.read().await.quotes.get(&id).cloned())
    }

    async fn list_quotes(&self, filter: &QuoteFilter) -> StoreResult<Vec<Quote>> {
        let t = self.tables.read().await;
        let mut rows = t
            .quotes
            .values()
            .filter(|q| filter.matches(q))
            .cloned()
            .collect::<Vec<_>>();
        newest_first(&mut rows, |q| q.quote_date);
        Ok(rows)
    }

    async fn update_quote(&self, id: Uuid, patch: &QuotePatch, at: DateTime<Utc>) -> StoreResult<Quote> {
        let mut t = self.tables.write().await;
        let quote = t
            .quotes
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("quote", id))?;
        patch.apply(quote);
        quote.updated_at = at;
        Ok(quote.clone())
    }

    async fn delete_quote(&self, id: Uuid) -> StoreResult<Quote> {
        let mut t = self.tables.write().await;
        t.quotes
            .remove(&id)
            .ok_or_else(|| StoreError::not_found("quote", id))
    }

    async fn insert_subcontractor(&self, sub: Subcontractor) -> StoreResult<Subcontractor> {
        let mut t = self.tables.write().await;
        t.subcontractors.insert(sub.id, sub.clone());
        Ok(sub)
    }

    async fn get_subcontractor(&self, id: Uuid) -> StoreResult<Option<Subcontractor>> {
        Ok(self.tables.read().await.subcontractors.get(&id).cloned())
    }

    async fn list_subcontractors(&self, filter: &SubcontractorFilter) -> StoreResult<Vec<Subcontractor>> {
        let t = self.tables.read().await;
        let mut rows = t
            .subcontractors
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| a.company_name.to_lowercase().cmp(&b.company_name.to_lowercase()));
        Ok(rows)
    }

    async fn update_subcontractor(
        &self,
        id: Uuid,
        patch: &SubcontractorPatch,
        at: DateTime<Utc>,
    ) -> StoreResult<Subcontractor> {
        let mut t = self.tables.write().await;
        let sub = t
            .subcontractors
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("subcontractor", id))?;
        patch.apply(sub);
        sub.updated_at = at;
        Ok(sub.clone())
    }

    async fn delete_subcontractor(&self, id: Uuid) -> StoreResult<Subcontractor> {
        let mut t = self.tables.write().await;
        let removed = t
            .subcontractors
            .remove(&id)
            .ok_or_else(|| StoreError::not_found("subcontractor", id))?;
        t.contact_logs.retain(|_, l| l.subcontractor_id != id);
        for quote in t.quotes.values_mut() {
            if quote.subcontractor_id == Some(id) {
                quote.subcontractor_id = None;
            }
        }
        for activity in t.activities.values_mut() {
            if activity.subcontractor_id == Some(id) {
                activity.subcontractor_id = None;
            }
        }
        Ok(removed)
    }

    async fn add_team_member(&self, member: TeamMember) -> StoreResult<TeamMember> {
        let mut t = self.tables.write().await;
        if !t.opportunities.contains_key(&member.opportunity_id) {
            return Err(StoreError::not_found("opportunity", member.opportunity_id));
        }
        let duplicate = t
            .team
            .values()
            .any(|m| m.opportunity_id == member.opportunity_id && m.user_id == member.user_id);
        if duplicate {
            return Err(ConflictKind::DuplicateTeamAssignment.into());
        }
        t.team.insert(member.id, member.clone());
        Ok(member)
    }

    async fn list_team_members(&self, opportunity_id: Uuid) -> StoreResult<Vec<TeamMember>> {
        let t = self.tables.read().await;
        let mut rows = t
            .team
            .values()
            .filter(|m| m.opportunity_id == opportunity_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by_key(|m| m.assigned_at);
        Ok(rows)
    }

    async fn remove_team_member(&self, opportunity_id: Uuid, user_id: &str) -> StoreResult<TeamMember> {
        let mut t = self.tables.write().await;
        let id = t
            .team
            .values()
            .find(|m| m.opportunity_id == opportunity_id && m.user_id == user_id)
            .map(|m| m.id)
            .ok_or_else(|| StoreError::not_found("team member", user_id))?;
        t.team
            .remove(&id)
            .ok_or_else(|| StoreError::not_found("team member", user_id))
    }

    async fn list_activities(&self, filter: &ActivityFilter) -> StoreResult<Vec<Activity>> {
        let t = self.tables.read().await;
        let mut rows = t
            .activities
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect::<Vec<_>>();
        newest_first(&mut rows, |a| a.activity_date);
        rows.truncate(filter.limit);
        Ok(rows)
    }

    async fn delete_activity(&self, id: Uuid) -> StoreResult<Activity> {
        let mut t = self.tables.write().await;
        t.activities
            .remove(&id)
            .ok_or_else(|| StoreError::not_found("activity", id))
    }

    async fn insert_contact_log(&self, log: ContactLog) -> StoreResult<ContactLog> {
        let mut t = self.tables.write().await;
        if !t.subcontractors.contains_key(&log.subcontractor_id) {
            return Err(StoreError::not_found("subcontractor", log.subcontractor_id));
        }
        t.contact_logs.insert(log.id, log.clone());
        Ok(log)
    }

    async fn list_contact_logs(&self, subcontractor_id: Uuid) -> StoreResult<Vec<ContactLog>> {
        let t = self.tables.read().await;
        let mut rows = t
            .contact_logs
            .values()
            .filter(|l| l.subcontractor_id == subcontractor_id)
            .cloned()
            .collect::<Vec<_>>();
        newest_first(&mut rows, |l| l.contact_date);
        Ok(rows)
    }

    async fn delete_contact_log(&self, id: Uuid) -> StoreResult<ContactLog> {
        let mut t = self.tables.write().await;
        t.contact_logs
            .remove(&id)
            .ok_or_else(|| StoreError::not_found("contact log", id))
    }
}
