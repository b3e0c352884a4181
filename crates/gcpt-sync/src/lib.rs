//! Bulk reconciliation of the external opportunity mirror against SAM.gov.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use gcpt_adapters::{FixtureSource, OpportunitySource, SamGovAdapter, SamGovConfig, SearchQuery, MAX_PAGE_SIZE};
use gcpt_core::{DomainError, DomainResult};
use gcpt_storage::{HttpClientConfig, HttpFetcher, PipelineStore};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub mod jobs;
pub mod pipeline;

pub use jobs::{JobSnapshot, JobState, SyncHandle, SyncManager};
pub use pipeline::SyncPipeline;

pub const CRATE_NAME: &str = "gcpt-sync";

/// Breakdown key used when a run is not split by NAICS code.
pub const UNFILTERED_KEY: &str = "all";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub request_delay: Duration,
    pub page_size: u32,
    pub max_pages_per_code: u32,
    pub lookback_days: i64,
    pub reports_dir: Option<PathBuf>,
    pub defaults_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_delay: Duration::from_millis(200),
            page_size: 100,
            max_pages_per_code: 10,
            lookback_days: 30,
            reports_dir: None,
            defaults_path: PathBuf::from("sync.yaml"),
            user_agent: "gcpt-sync/0.1".to_string(),
            http_timeout_secs: 20,
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            request_delay: env_parsed("GCPT_SYNC_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_delay),
            page_size: env_parsed("GCPT_SYNC_PAGE_SIZE")
                .map(|n: u32| n.clamp(1, MAX_PAGE_SIZE))
                .unwrap_or(defaults.page_size),
            max_pages_per_code: env_parsed("GCPT_SYNC_MAX_PAGES")
                .map(|n: u32| n.max(1))
                .unwrap_or(defaults.max_pages_per_code),
            lookback_days: env_parsed("GCPT_SYNC_LOOKBACK_DAYS").unwrap_or(defaults.lookback_days),
            reports_dir: std::env::var("GCPT_REPORTS_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            defaults_path: std::env::var("GCPT_SYNC_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.defaults_path),
            user_agent: std::env::var("GCPT_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parsed("GCPT_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

/// Operator defaults from `sync.yaml`, applied to fields a request leaves unset.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SyncDefaults {
    #[serde(default)]
    pub naics_codes: Vec<String>,
    pub keyword: Option<String>,
    pub state: Option<String>,
    pub set_aside: Option<String>,
    pub limit: Option<u32>,
}

impl SyncDefaults {
    /// A missing file yields `None`; a malformed one is an error.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        let defaults = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(defaults))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SyncRequest {
    pub keyword: Option<String>,
    pub naics_codes: Option<Vec<String>>,
    pub state: Option<String>,
    pub set_aside: Option<String>,
    pub posted_from: Option<NaiveDate>,
    pub posted_to: Option<NaiveDate>,
    pub limit: Option<u32>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl SyncRequest {
    pub fn with_defaults(mut self, defaults: &SyncDefaults) -> Self {
        if self.naics_codes.as_ref().map_or(true, Vec::is_empty) && !defaults.naics_codes.is_empty() {
            self.naics_codes = Some(defaults.naics_codes.clone());
        }
        self.keyword = self.keyword.or_else(|| defaults.keyword.clone());
        self.state = self.state.or_else(|| defaults.state.clone());
        self.set_aside = self.set_aside.or_else(|| defaults.set_aside.clone());
        self.limit = self.limit.or(defaults.limit);
        self
    }

    pub fn validate(self, config: &SyncConfig, today: NaiveDate) -> DomainResult<SyncPlan> {
        let limit = self.limit.unwrap_or(config.page_size);
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(DomainError::validation(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        let posted_to = self.posted_to.unwrap_or(today);
        let posted_from = self
            .posted_from
            .unwrap_or_else(|| posted_to - chrono::Duration::days(config.lookback_days));
        if posted_from > posted_to {
            return Err(DomainError::validation("postedFrom must not be after postedTo"));
        }

        let mut codes: Vec<String> = Vec::new();
        for code in self.naics_codes.unwrap_or_default() {
            let code = code.trim().to_string();
            if code.is_empty() {
                continue;
            }
            if !code.chars().all(|c| c.is_ascii_digit()) {
                return Err(DomainError::validation(format!("invalid NAICS code: {code}")));
            }
            if !codes.contains(&code) {
                codes.push(code);
            }
        }

        Ok(SyncPlan {
            naics_codes: codes,
            keyword: non_blank(self.keyword),
            state: non_blank(self.state),
            set_aside: non_blank(self.set_aside),
            posted_from,
            posted_to,
            page_size: limit,
        })
    }
}

/// Validated request; an empty code list means one unfiltered pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPlan {
    pub naics_codes: Vec<String>,
    pub keyword: Option<String>,
    pub state: Option<String>,
    pub set_aside: Option<String>,
    pub posted_from: NaiveDate,
    pub posted_to: NaiveDate,
    pub page_size: u32,
}

impl SyncPlan {
    pub fn passes(&self) -> Vec<Option<String>> {
        if self.naics_codes.is_empty() {
            vec![None]
        } else {
            self.naics_codes.iter().cloned().map(Some).collect()
        }
    }

    pub fn query(&self, naics_code: Option<&str>, offset: u32) -> SearchQuery {
        SearchQuery {
            naics_code: naics_code.map(str::to_string),
            keyword: self.keyword.clone(),
            state: self.state.clone(),
            set_aside: self.set_aside.clone(),
            posted_from: self.posted_from,
            posted_to: self.posted_to,
            limit: self.page_size,
            offset,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeBreakdown {
    pub imported: u64,
    pub updated: u64,
    pub errors: u64,
    pub total_fetched: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub job_id: Uuid,
    pub source: String,
    pub imported: u64,
    pub updated: u64,
    pub errors: u64,
    pub total_fetched: u64,
    pub breakdown: BTreeMap<String, CodeBreakdown>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancelled: bool,
}

impl SyncReport {
    pub fn new(job_id: Uuid, source: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            source: source.to_string(),
            imported: 0,
            updated: 0,
            errors: 0,
            total_fetched: 0,
            breakdown: BTreeMap::new(),
            started_at,
            finished_at: None,
            cancelled: false,
        }
    }
}

pub fn report_path(reports_dir: &Path, job_id: Uuid) -> PathBuf {
    reports_dir.join("sync").join(format!("{job_id}.json"))
}

pub async fn write_report(reports_dir: &Path, report: &SyncReport) -> Result<PathBuf> {
    let path = report_path(reports_dir, report.job_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let bytes = serde_json::to_vec_pretty(report).context("serializing sync report")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Replay captured responses when `fixtures` is set, otherwise talk to SAM.gov.
pub fn source_from_config(config: &SyncConfig, fixtures: Option<&Path>) -> Result<Arc<dyn OpportunitySource>> {
    match fixtures {
        Some(dir) => {
            let source = FixtureSource::from_dir(dir)?;
            info!(root = %dir.display(), listings = source.len(), "using fixture listing source");
            Ok(Arc::new(source))
        }
        None => {
            let sam = SamGovConfig::from_env();
            if sam.api_key.is_none() {
                warn!("SAM_API_KEY is not set; live sync requests will fail");
            }
            let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
            Ok(Arc::new(SamGovAdapter::new(http, sam)))
        }
    }
}

/// Load `sync.yaml` defaults (if present) and validate `request` against them.
pub async fn plan_request(config: &SyncConfig, request: SyncRequest) -> Result<SyncPlan> {
    let request = match SyncDefaults::load(&config.defaults_path).await? {
        Some(defaults) => {
            info!(path = %config.defaults_path.display(), "applying sync defaults");
            request.with_defaults(&defaults)
        }
        None => request,
    };
    Ok(request.validate(config, Utc::now().date_naive())?)
}

/// One synchronous run for the command line; the report file is written
/// before returning.
pub async fn run_sync_once(
    store: Arc<dyn PipelineStore>,
    config: SyncConfig,
    request: SyncRequest,
    fixtures: Option<&Path>,
) -> Result<SyncReport> {
    let plan = plan_request(&config, request).await?;
    let source = source_from_config(&config, fixtures)?;
    let reports_dir = config.reports_dir.clone();
    let pipeline = SyncPipeline::new(source, store, config);
    let report = pipeline.run(&plan).await;
    if let Some(dir) = reports_dir {
        match write_report(&dir, &report).await {
            Ok(path) => info!(path = %path.display(), "sync report written"),
            Err(err) => warn!(error = %err, "failed to write sync report"),
        }
    }
    Ok(report)
}
