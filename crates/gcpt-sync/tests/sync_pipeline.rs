use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use gcpt_adapters::{
    parse_search_response, AdapterError, FixtureSource, OpportunitySource, SamSearchResponse,
    SearchPage, SearchQuery,
};
use gcpt_core::DomainError;
use gcpt_storage::{ExternalFilter, MemoryStore, PipelineStore};
use gcpt_sync::{
    plan_request, report_path, run_sync_once, JobState, SyncConfig, SyncManager, SyncPipeline,
    SyncPlan, SyncReport, SyncRequest, UNFILTERED_KEY,
};
use serde_json::{json, Value};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fixtures_dir() -> PathBuf {
    workspace_root().join("fixtures").join("sam-gov")
}

fn quiet_config() -> SyncConfig {
    SyncConfig {
        request_delay: Duration::ZERO,
        defaults_path: PathBuf::from("/nonexistent/sync.yaml"),
        ..Default::default()
    }
}

fn plan(codes: &[&str], page_size: u32) -> SyncPlan {
    SyncPlan {
        naics_codes: codes.iter().map(|c| c.to_string()).collect(),
        keyword: None,
        state: None,
        set_aside: None,
        posted_from: NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
        posted_to: NaiveDate::from_ymd_opt(2026, 10, 31).unwrap(),
        page_size,
    }
}

/// Fixture-backed source that counts requests and fails one NAICS code.
struct Flaky {
    inner: FixtureSource,
    failing_code: Option<&'static str>,
    requests: AtomicUsize,
}

impl Flaky {
    fn new(failing_code: Option<&'static str>) -> Self {
        Self {
            inner: FixtureSource::from_dir(fixtures_dir()).unwrap(),
            failing_code,
            requests: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl OpportunitySource for Flaky {
    fn source_id(&self) -> &'static str {
        "flaky"
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, AdapterError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if query.naics_code.as_deref().is_some_and(|c| Some(c) == self.failing_code) {
            return Err(AdapterError::Parse("upstream returned garbage".into()));
        }
        self.inner.search(query).await
    }
}

fn pipeline(source: Arc<Flaky>, store: Arc<MemoryStore>, config: SyncConfig) -> SyncPipeline {
    SyncPipeline::new(source, store, config)
}

#[tokio::test]
async fn imports_then_updates_on_repeat_run() {
    let store = Arc::new(MemoryStore::new());
    let sync = pipeline(Arc::new(Flaky::new(None)), store.clone(), quiet_config());
    let plan = plan(&["541511", "236220"], 100);

    let first = sync.run(&plan).await;
    assert_eq!(first.imported, 5);
    assert_eq!(first.updated, 0);
    assert_eq!(first.errors, 0);
    assert_eq!(first.total_fetched, 5);
    assert_eq!(first.breakdown["541511"].imported, 3);
    assert_eq!(first.breakdown["236220"].imported, 2);
    assert!(first.finished_at.is_some());
    assert!(!first.cancelled);

    let second = sync.run(&plan).await;
    assert_eq!(second.imported, 0);
    assert_eq!(second.updated, 5);
    assert_eq!(
        store.list_external(&ExternalFilter::default()).await.unwrap().len(),
        5
    );
}

#[tokio::test]
async fn upsert_keeps_the_pipeline_flag() {
    let store = Arc::new(MemoryStore::new());
    let sync = pipeline(Arc::new(Flaky::new(None)), store.clone(), quiet_config());
    sync.run(&plan(&["236220"], 100)).await;

    let listing = store
        .list_external(&ExternalFilter::default())
        .await
        .unwrap()
        .remove(0);
    let opp = gcpt_core::PipelineOpportunity::promoted_from(
        &listing,
        "org-1",
        &gcpt_core::Actor::new("u-1", "org-1", gcpt_core::Role::User),
        chrono::Utc::now(),
    );
    store
        .promote_external(listing.id, opp, chrono::Utc::now())
        .await
        .unwrap();

    sync.run(&plan(&["236220"], 100)).await;
    let after = store.get_external(listing.id).await.unwrap().unwrap();
    assert!(after.added_to_pipeline);
}

#[tokio::test]
async fn failing_code_does_not_stop_the_others() {
    let store = Arc::new(MemoryStore::new());
    let sync = pipeline(Arc::new(Flaky::new(Some("999999"))), store, quiet_config());

    let report = sync.run(&plan(&["999999", "541511"], 100)).await;
    let failed = &report.breakdown["999999"];
    assert_eq!(failed.errors, 1);
    assert_eq!(failed.imported, 0);
    assert!(failed.error.as_deref().unwrap().contains("garbage"));
    assert_eq!(report.breakdown["541511"].imported, 3);
    assert_eq!(report.errors, 1);
}

#[tokio::test]
async fn unfiltered_run_uses_the_all_key() {
    let store = Arc::new(MemoryStore::new());
    let sync = pipeline(Arc::new(Flaky::new(None)), store, quiet_config());

    let report = sync.run(&plan(&[], 100)).await;
    assert_eq!(report.breakdown.len(), 1);
    assert_eq!(report.breakdown[UNFILTERED_KEY].imported, 5);
}

#[tokio::test]
async fn pages_until_short_page_and_respects_page_cap() {
    let source = Arc::new(Flaky::new(None));
    let sync = pipeline(source.clone(), Arc::new(MemoryStore::new()), quiet_config());
    let report = sync.run(&plan(&["541511"], 2)).await;
    assert_eq!(report.total_fetched, 3);
    assert_eq!(source.requests.load(Ordering::SeqCst), 2);

    let capped = SyncConfig {
        max_pages_per_code: 1,
        ..quiet_config()
    };
    let source = Arc::new(Flaky::new(None));
    let sync = pipeline(source.clone(), Arc::new(MemoryStore::new()), capped);
    let report = sync.run(&plan(&["541511"], 2)).await;
    assert_eq!(report.total_fetched, 2);
    assert_eq!(source.requests.load(Ordering::SeqCst), 1);
}

/// Serves raw SAM.gov search payloads in order, keyed by request offset.
struct Scripted {
    total_records: u64,
    pages: Vec<(u32, Vec<Value>)>,
    requests: AtomicUsize,
}

impl Scripted {
    fn new(total_records: u64, pages: Vec<(u32, Vec<Value>)>) -> Self {
        Self {
            total_records,
            pages,
            requests: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl OpportunitySource for Scripted {
    fn source_id(&self) -> &'static str {
        "scripted"
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, AdapterError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let notices = self
            .pages
            .iter()
            .find(|(offset, _)| *offset == query.offset)
            .map(|(_, notices)| notices.clone())
            .unwrap_or_default();
        let response: SamSearchResponse = serde_json::from_value(json!({
            "totalRecords": self.total_records,
            "opportunitiesData": notices,
        }))
        .map_err(|e| AdapterError::Parse(e.to_string()))?;
        Ok(parse_search_response(response))
    }
}

#[tokio::test]
async fn notice_without_id_counts_as_error_and_paging_continues() {
    let source = Arc::new(Scripted::new(
        4,
        vec![
            (0, vec![json!({ "noticeId": "A" }), json!({ "title": "no id" })]),
            (2, vec![json!({ "noticeId": "C" }), json!({ "noticeId": "D" })]),
        ],
    ));
    let store = Arc::new(MemoryStore::new());
    let sync = SyncPipeline::new(source.clone(), store.clone(), quiet_config());

    let report = sync.run(&plan(&["541511"], 2)).await;
    assert_eq!(source.requests.load(Ordering::SeqCst), 2);
    assert_eq!(report.imported, 3);
    assert_eq!(report.errors, 1);
    assert_eq!(report.total_fetched, 4);
    assert_eq!(report.breakdown["541511"].errors, 1);
    assert!(report.breakdown["541511"].error.is_none());
    assert_eq!(
        store.list_external(&ExternalFilter::default()).await.unwrap().len(),
        3
    );
}

#[tokio::test]
async fn stops_when_total_is_reached_on_a_full_page() {
    let source = Arc::new(Scripted::new(
        4,
        vec![
            (0, vec![json!({ "noticeId": "A" }), json!({ "noticeId": "B" })]),
            (2, vec![json!({ "noticeId": "C" }), json!({ "noticeId": "D" })]),
        ],
    ));
    let sync = SyncPipeline::new(source.clone(), Arc::new(MemoryStore::new()), quiet_config());

    let report = sync.run(&plan(&["541511"], 2)).await;
    assert_eq!(source.requests.load(Ordering::SeqCst), 2);
    assert_eq!(report.imported, 4);
    assert_eq!(report.errors, 0);
}

#[tokio::test]
async fn cancelled_job_reports_cancelled() {
    let slow = SyncConfig {
        request_delay: Duration::from_secs(60),
        ..quiet_config()
    };
    let manager = SyncManager::new(pipeline(
        Arc::new(Flaky::new(None)),
        Arc::new(MemoryStore::new()),
        slow,
    ));

    let handle = manager.start(plan(&["541511", "236220"], 100)).await;
    manager.cancel(handle.job_id()).await.unwrap();

    let report: SyncReport = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("cancellation interrupts the pacing delay");
    assert!(report.cancelled);
    assert!(!report.breakdown.contains_key("236220") || report.breakdown["236220"].total_fetched == 0);
    assert_eq!(handle.status().state, JobState::Cancelled);

    let jobs = manager.list().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_id, handle.job_id());
}

#[tokio::test]
async fn completed_job_is_pollable() {
    let manager = SyncManager::new(pipeline(
        Arc::new(Flaky::new(None)),
        Arc::new(MemoryStore::new()),
        quiet_config(),
    ));
    let handle = manager.start(plan(&["236220"], 100)).await;
    let report = handle.wait().await;
    assert_eq!(report.imported, 2);

    let polled = manager.get(handle.job_id()).await.unwrap().status();
    assert_eq!(polled.state, JobState::Completed);
    assert_eq!(polled.report.imported, 2);
}

#[tokio::test]
async fn cli_run_writes_report_file() {
    let reports = tempfile::tempdir().unwrap();
    let config = SyncConfig {
        reports_dir: Some(reports.path().to_path_buf()),
        ..quiet_config()
    };
    let request = SyncRequest {
        naics_codes: Some(vec!["541511".into()]),
        posted_from: NaiveDate::from_ymd_opt(2026, 9, 1),
        posted_to: NaiveDate::from_ymd_opt(2026, 10, 31),
        ..Default::default()
    };

    let report = run_sync_once(
        Arc::new(MemoryStore::new()),
        config,
        request,
        Some(fixtures_dir().as_path()),
    )
    .await
    .unwrap();
    assert_eq!(report.imported, 3);

    let path = report_path(reports.path(), report.job_id);
    let written: SyncReport = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
    assert_eq!(written, report);
}

#[tokio::test]
async fn yaml_defaults_fill_missing_fields() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = dir.path().join("sync.yaml");
    std::fs::write(&yaml, "naics_codes:\n  - \"236220\"\nstate: VA\nlimit: 25\n").unwrap();
    let config = SyncConfig {
        defaults_path: yaml,
        ..quiet_config()
    };

    let plan = plan_request(&config, SyncRequest::default()).await.unwrap();
    assert_eq!(plan.naics_codes, vec!["236220".to_string()]);
    assert_eq!(plan.state.as_deref(), Some("VA"));
    assert_eq!(plan.page_size, 25);

    let explicit = plan_request(
        &config,
        SyncRequest {
            naics_codes: Some(vec!["541511".into()]),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(explicit.naics_codes, vec!["541511".to_string()]);
}

#[test]
fn request_validation() {
    let config = quiet_config();
    let today = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();

    let plan = SyncRequest::default().validate(&config, today).unwrap();
    assert_eq!(plan.posted_to, today);
    assert_eq!(plan.posted_from, NaiveDate::from_ymd_opt(2026, 9, 19).unwrap());
    assert_eq!(plan.page_size, 100);
    assert_eq!(plan.passes(), vec![None]);

    let too_big = SyncRequest {
        limit: Some(1001),
        ..Default::default()
    };
    assert!(matches!(
        too_big.validate(&config, today),
        Err(DomainError::Validation { .. })
    ));

    let backwards = SyncRequest {
        posted_from: NaiveDate::from_ymd_opt(2026, 10, 20),
        ..Default::default()
    };
    assert!(backwards.validate(&config, today).is_err());

    let dupes = SyncRequest {
        naics_codes: Some(vec![" 541511".into(), "541511".into(), "".into()]),
        ..Default::default()
    };
    assert_eq!(
        dupes.validate(&config, today).unwrap().naics_codes,
        vec!["541511".to_string()]
    );
}
