use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use gcpt_core::command::{
    CreateContract, CreateOpportunity, CreateQuote, MarkLost, MarkWon, PromoteExternal, SetStage,
    SubcontractorFields, UpdateOpportunity,
};
use gcpt_core::{
    Activity, ActivityType, Actor, ConflictKind, DomainError, ExternalListing, OpportunityStatus,
    Role, Stage,
};
use gcpt_lifecycle::{ActivityRecorder, PipelineService};
use gcpt_storage::{
    ActivityFilter, ActivitySink, ContractFilter, ExternalFilter, MemoryStore, PipelineStore,
    StoreError, StoreResult,
};
use uuid::Uuid;

fn user() -> Actor {
    Actor::new("u-1", "org-1", Role::User)
}

fn admin() -> Actor {
    Actor::new("admin-1", "org-1", Role::Admin)
}

fn service() -> (Arc<MemoryStore>, PipelineService) {
    let store = Arc::new(MemoryStore::new());
    (store.clone(), PipelineService::with_store(store))
}

async fn seed_external(store: &MemoryStore, notice_id: &str, title: &str) -> Uuid {
    store
        .upsert_external(ExternalListing::new(notice_id, title), Utc::now())
        .await
        .unwrap();
    store
        .list_external(&ExternalFilter::default())
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.listing.notice_id == notice_id)
        .unwrap()
        .id
}

async fn opportunity(service: &PipelineService, title: &str, value: Option<f64>) -> Uuid {
    service
        .create_opportunity(
            &user(),
            CreateOpportunity {
                title: Some(title.into()),
                estimated_value: value,
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .opportunity
        .id
}

fn won(number: &str) -> MarkWon {
    MarkWon {
        contract_number: Some(number.into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn promotion_copies_listing_once_and_flags_source() {
    let (store, service) = service();
    let ext_id = seed_external(&store, "EXT-1", "Widget RFP").await;

    let promote = || PromoteExternal {
        organization_id: Some("org-1".into()),
    };
    let view = service
        .promote_external(&user(), ext_id, promote())
        .await
        .unwrap();
    let opp = &view.opportunity;
    assert_eq!(opp.title, "Widget RFP");
    assert_eq!(opp.stage, Stage::Identified);
    assert_eq!(opp.status, OpportunityStatus::Active);
    assert_eq!(opp.probability, 50);
    assert_eq!(opp.external_opportunity_id, Some(ext_id));
    assert_eq!(opp.notice_id.as_deref(), Some("EXT-1"));

    let source = service.get_external(ext_id).await.unwrap();
    assert!(source.added_to_pipeline);
    assert!(source.added_to_pipeline_at.is_some());

    let err = service
        .promote_external(&user(), ext_id, promote())
        .await
        .unwrap_err();
    assert!(err.is_conflict(ConflictKind::AlreadyInPipeline));
    let all = service
        .list_opportunities(&Default::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 1);

    let feed = service.opportunity_activities(opp.id, 10).await.unwrap();
    assert_eq!(feed[0].activity_type, ActivityType::Created);
    assert_eq!(feed[0].metadata["noticeId"], "EXT-1");
}

#[tokio::test]
async fn promotion_requires_organization_and_existing_listing() {
    let (store, service) = service();
    let ext_id = seed_external(&store, "EXT-2", "Radar").await;

    let err = service
        .promote_external(&user(), ext_id, PromoteExternal { organization_id: None })
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::Validation { .. }));

    let err = service
        .promote_external(
            &user(),
            Uuid::new_v4(),
            PromoteExternal {
                organization_id: Some("org-1".into()),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::NotFound { .. }));
    assert!(!service.get_external(ext_id).await.unwrap().added_to_pipeline);
}

#[tokio::test]
async fn removal_resets_the_source_flag_and_allows_repromotion() {
    let (store, service) = service();
    let ext_id = seed_external(&store, "EXT-3", "Bridge repair").await;
    let org = || PromoteExternal {
        organization_id: Some("org-1".into()),
    };

    let opp = service.promote_external(&user(), ext_id, org()).await.unwrap();
    service
        .remove_from_pipeline(&user(), opp.opportunity.id)
        .await
        .unwrap();

    let source = service.get_external(ext_id).await.unwrap();
    assert!(!source.added_to_pipeline);
    assert!(source.added_to_pipeline_at.is_none());
    assert!(matches!(
        service.get_opportunity(opp.opportunity.id).await,
        Err(DomainError::NotFound { .. })
    ));

    service.promote_external(&user(), ext_id, org()).await.unwrap();
}

#[tokio::test]
async fn mark_won_creates_contract_from_estimated_value() {
    let (_, service) = service();
    let id = opportunity(&service, "Cloud migration", Some(50_000.0)).await;

    let outcome = service.mark_won(&user(), id, won("C-100")).await.unwrap();
    assert_eq!(outcome.opportunity.opportunity.status, OpportunityStatus::Won);
    assert_eq!(
        outcome.opportunity.opportunity.contract_number.as_deref(),
        Some("C-100")
    );
    assert!(outcome.opportunity.opportunity.won_date.is_some());

    let contract = &outcome.contract;
    assert_eq!(contract.contract_number, "C-100");
    assert_eq!(contract.title, "Cloud migration");
    assert_eq!(contract.base_value, 50_000.0);
    assert_eq!(contract.total_value, 50_000.0);
    assert_eq!(contract.current_value, 50_000.0);
    assert_eq!(contract.opportunity_id, Some(id));
    let term = contract.end_date - contract.start_date;
    assert!(term >= Duration::days(365) && term <= Duration::days(366));

    let feed = service.opportunity_activities(id, 10).await.unwrap();
    let status_change = feed
        .iter()
        .find(|a| a.activity_type == ActivityType::StatusChange)
        .unwrap();
    assert_eq!(status_change.contract_id, Some(contract.id));
}

#[tokio::test]
async fn award_amount_overrides_estimate() {
    let (_, service) = service();
    let id = opportunity(&service, "Helpdesk", Some(10.0)).await;
    let outcome = service
        .mark_won(
            &user(),
            id,
            MarkWon {
                contract_number: Some("C-7".into()),
                award_amount: Some(75_000.0),
                contract_type: Some("idiq".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.contract.total_value, 75_000.0);
    assert_eq!(outcome.contract.contract_type.as_str(), "idiq");
}

#[tokio::test]
async fn second_win_conflicts_without_a_second_contract() {
    let (_, service) = service();
    let id = opportunity(&service, "Data center", None).await;
    service.mark_won(&user(), id, won("C-1")).await.unwrap();

    let err = service.mark_won(&user(), id, won("C-2")).await.unwrap_err();
    assert!(err.is_conflict(ConflictKind::AlreadyWon));

    let contracts = service
        .list_contracts(&ContractFilter::default())
        .await
        .unwrap();
    assert_eq!(contracts.len(), 1);
    assert_eq!(contracts[0].contract_number, "C-1");
}

#[tokio::test]
async fn duplicate_contract_number_leaves_opportunity_active() {
    let (_, service) = service();
    let first = opportunity(&service, "First", None).await;
    let second = opportunity(&service, "Second", None).await;
    service.mark_won(&user(), first, won("C-9")).await.unwrap();

    let err = service.mark_won(&user(), second, won("C-9")).await.unwrap_err();
    assert!(err.is_conflict(ConflictKind::DuplicateContractNumber));
    let opp = service.get_opportunity(second).await.unwrap();
    assert_eq!(opp.opportunity.status, OpportunityStatus::Active);
}

#[tokio::test]
async fn mark_lost_requires_reason_and_locks_status() {
    let (_, service) = service();
    let id = opportunity(&service, "Fleet services", None).await;

    let err = service
        .mark_lost(&user(), id, MarkLost::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::Validation { .. }));
    assert_eq!(
        service.get_opportunity(id).await.unwrap().opportunity.status,
        OpportunityStatus::Active
    );

    let lost = service
        .mark_lost(
            &user(),
            id,
            MarkLost {
                lost_reason: Some("Price".into()),
                lost_feedback: Some("Too high".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(lost.opportunity.status, OpportunityStatus::Lost);
    assert_eq!(lost.opportunity.lost_reason.as_deref(), Some("Price"));

    let err = service.mark_won(&user(), id, won("C-3")).await.unwrap_err();
    assert!(err.is_conflict(ConflictKind::CannotWinLost));
}

#[tokio::test]
async fn invalid_stage_is_rejected_and_closed_opportunities_are_frozen() {
    let (_, service) = service();
    let id = opportunity(&service, "Training", None).await;

    let err = service
        .set_stage(
            &user(),
            id,
            SetStage {
                stage: Some("NotAStage".into()),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::Validation { .. }));
    assert_eq!(
        service.get_opportunity(id).await.unwrap().opportunity.stage,
        Stage::Identified
    );

    let view = service
        .set_stage(
            &user(),
            id,
            SetStage {
                stage: Some("capture".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(view.opportunity.stage, Stage::Capture);
    assert_eq!(view.stage_progress, Stage::Capture.progress_percent());

    service.mark_won(&user(), id, won("C-4")).await.unwrap();
    let err = service
        .set_stage(
            &user(),
            id,
            SetStage {
                stage: Some("submitted".into()),
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict(ConflictKind::OpportunityClosed));

    let renamed = service
        .update_opportunity(
            &user(),
            id,
            UpdateOpportunity {
                title: Some("Renamed".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(renamed.opportunity.title, "Renamed");
    assert_eq!(renamed.opportunity.status, OpportunityStatus::Won);
}

#[tokio::test]
async fn stage_change_records_from_and_to() {
    let (_, service) = service();
    let id = opportunity(&service, "Survey", None).await;
    service
        .set_stage(
            &user(),
            id,
            SetStage {
                stage: Some("pursuit".into()),
            },
        )
        .await
        .unwrap();

    let feed = service
        .list_activities(&ActivityFilter {
            opportunity_id: Some(id),
            activity_type: Some(ActivityType::StageChange),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].metadata["from"], "identified");
    assert_eq!(feed[0].metadata["to"], "pursuit");
}

#[tokio::test]
async fn revert_is_admin_only_and_reopens_at_submitted() {
    let (_, service) = service();
    let contract = service
        .create_contract(
            &user(),
            CreateContract {
                contract_number: Some("C-55".into()),
                title: Some("Janitorial".into()),
                total_value: Some(12_000.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = service.revert_contract(&user(), contract.id).await.unwrap_err();
    assert!(matches!(err, DomainError::Forbidden(_)));

    let outcome = service.revert_contract(&admin(), contract.id).await.unwrap();
    let opp = &outcome.opportunity.opportunity;
    assert_eq!(opp.stage, Stage::Submitted);
    assert_eq!(opp.status, OpportunityStatus::Active);
    assert_eq!(opp.title, "Janitorial");
    assert_eq!(opp.estimated_value, Some(12_000.0));
    assert!(matches!(
        service.get_contract(contract.id).await,
        Err(DomainError::NotFound { .. })
    ));
}

#[tokio::test]
async fn quote_creation_checks_links() {
    let (_, service) = service();
    let err = service
        .create_quote(
            &user(),
            CreateQuote {
                opportunity_id: Some(Uuid::new_v4()),
                amount: Some(100.0),
                quote_date: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::NotFound { entity: "opportunity", .. }));

    let opp = opportunity(&service, "Paving", None).await;
    let sub = service
        .create_subcontractor(
            &user(),
            SubcontractorFields {
                company_name: Some("Acme Paving".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let quote = service
        .create_quote(
            &user(),
            CreateQuote {
                opportunity_id: Some(opp),
                subcontractor_id: Some(sub.id),
                amount: Some(2_500.0),
                quote_date: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(quote.subcontractor_id, Some(sub.id));

    let feed = service.opportunity_activities(opp, 10).await.unwrap();
    assert!(feed
        .iter()
        .any(|a| a.entity_id == quote.id && a.subcontractor_id == Some(sub.id)));
}

#[derive(Default)]
struct SwitchableSink {
    down: AtomicBool,
    inner: MemoryStore,
}

#[async_trait]
impl ActivitySink for SwitchableSink {
    async fn append_activity(&self, activity: Activity) -> StoreResult<Activity> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupt {
                table: "activities",
                message: "audit store unavailable".into(),
            });
        }
        self.inner.append_activity(activity).await
    }
}

#[tokio::test]
async fn audit_failure_does_not_fail_the_mutation() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(SwitchableSink::default());
    let recorder = Arc::new(ActivityRecorder::new(sink.clone(), store.clone()));
    let service = PipelineService::new(store.clone(), recorder);

    sink.down.store(true, Ordering::SeqCst);
    let id = opportunity(&service, "Audit outage", Some(1_000.0)).await;
    let outcome = service.mark_won(&user(), id, won("C-77")).await.unwrap();
    assert_eq!(outcome.opportunity.opportunity.status, OpportunityStatus::Won);
    assert_eq!(service.outbox_status().await.pending, 2);

    sink.down.store(false, Ordering::SeqCst);
    let report = service.flush_outbox().await;
    assert_eq!(report.delivered, 2);
    assert_eq!(report.pending, 0);

    let replayed = sink
        .inner
        .list_activities(&ActivityFilter {
            opportunity_id: Some(id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(replayed.len(), 2);
}

#[tokio::test]
async fn parked_activities_outlive_the_service() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(SwitchableSink::default());
    sink.down.store(true, Ordering::SeqCst);
    let first = PipelineService::new(
        store.clone(),
        Arc::new(ActivityRecorder::new(sink.clone(), store.clone())),
    );
    let id = opportunity(&first, "Before restart", None).await;
    assert_eq!(first.outbox_status().await.pending, 1);
    drop(first);

    sink.down.store(false, Ordering::SeqCst);
    let second = PipelineService::new(
        store.clone(),
        Arc::new(ActivityRecorder::new(sink.clone(), store.clone())),
    );
    assert_eq!(second.outbox_status().await.pending, 1);
    second
        .set_stage(
            &user(),
            id,
            SetStage {
                stage: Some("capture".into()),
            },
        )
        .await
        .unwrap();

    let delivered = sink
        .inner
        .list_activities(&ActivityFilter {
            opportunity_id: Some(id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(delivered.len(), 2);
    assert!(delivered.iter().any(|a| a.activity_type == ActivityType::Created));
    assert!(delivered.iter().any(|a| a.activity_type == ActivityType::StageChange));
    assert_eq!(second.outbox_status().await.pending, 0);
}

#[tokio::test]
async fn deleting_activities_requires_admin() {
    let (_, service) = service();
    let id = opportunity(&service, "Notes", None).await;
    let entry = service.opportunity_activities(id, 1).await.unwrap().remove(0);

    let err = service.delete_activity(&user(), entry.id).await.unwrap_err();
    assert!(matches!(err, DomainError::Forbidden(_)));
    service.delete_activity(&admin(), entry.id).await.unwrap();
    assert!(service.opportunity_activities(id, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn past_end_date_is_rejected_against_the_defaulted_start() {
    let (store, service) = service();
    let id = opportunity(&service, "Backdated", Some(5_000.0)).await;
    let yesterday = Utc::now() - Duration::days(1);

    let err = service
        .mark_won(
            &user(),
            id,
            MarkWon {
                end_date: Some(yesterday),
                ..won("C-90")
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::Validation { .. }));
    let untouched = service.get_opportunity(id).await.unwrap();
    assert_eq!(untouched.opportunity.status, OpportunityStatus::Active);

    let err = service
        .create_contract(
            &user(),
            CreateContract {
                contract_number: Some("C-91".into()),
                title: Some("Backdated".into()),
                end_date: Some(yesterday),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::Validation { .. }));
    assert!(store
        .list_contracts(&ContractFilter::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn subcontractor_changes_are_audited() {
    let (_, service) = service();
    let sub = service
        .create_subcontractor(
            &user(),
            SubcontractorFields {
                company_name: Some("Acme Paving".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    service
        .update_subcontractor(
            &admin(),
            sub.id,
            SubcontractorFields {
                notes: Some("prefers email".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    service.delete_subcontractor(&admin(), sub.id).await.unwrap();

    let trail = service
        .list_activities(&ActivityFilter {
            entity_type: Some(gcpt_core::EntityType::Subcontractor),
            entity_id: Some(sub.id),
            ..Default::default()
        })
        .await
        .unwrap();
    let mut kinds: Vec<ActivityType> = trail.iter().map(|a| a.activity_type).collect();
    kinds.sort_by_key(|k| k.as_str());
    assert_eq!(
        kinds,
        vec![ActivityType::Created, ActivityType::Deleted, ActivityType::Updated]
    );
    let deleted = trail
        .iter()
        .find(|a| a.activity_type == ActivityType::Deleted)
        .unwrap();
    assert_eq!(deleted.actor_id, "admin-1");
    assert_eq!(deleted.subcontractor_id, None);
}
