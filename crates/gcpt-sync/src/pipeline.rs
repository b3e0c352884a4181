use std::sync::Arc;

use chrono::Utc;
use gcpt_adapters::OpportunitySource;
use gcpt_core::UpsertOutcome;
use gcpt_storage::PipelineStore;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{CodeBreakdown, SyncConfig, SyncPlan, SyncReport, UNFILTERED_KEY};

/// Pages a listing source into the external mirror, one NAICS code at a time.
///
/// A failed fetch ends only the code it belongs to. Consecutive requests are
/// separated by the configured delay, and cancellation is checked before each
/// request and while waiting.
pub struct SyncPipeline {
    source: Arc<dyn OpportunitySource>,
    store: Arc<dyn PipelineStore>,
    config: SyncConfig,
}

impl SyncPipeline {
    pub fn new(source: Arc<dyn OpportunitySource>, store: Arc<dyn PipelineStore>, config: SyncConfig) -> Self {
        Self { source, store, config }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn source_id(&self) -> &'static str {
        self.source.source_id()
    }

    /// Run to completion with no observer and no way to cancel.
    pub async fn run(&self, plan: &SyncPlan) -> SyncReport {
        let report = SyncReport::new(Uuid::new_v4(), self.source_id(), Utc::now());
        let (progress, _rx) = watch::channel(report.clone());
        self.run_with(report, plan, &CancellationToken::new(), &progress).await
    }

    /// Counters in `progress` are refreshed after every page.
    pub async fn run_with(
        &self,
        mut report: SyncReport,
        plan: &SyncPlan,
        cancel: &CancellationToken,
        progress: &watch::Sender<SyncReport>,
    ) -> SyncReport {
        let span = info_span!("sync_run", job_id = %report.job_id, source = self.source_id());
        async move {
            info!(
                codes = plan.naics_codes.len(),
                posted_from = %plan.posted_from,
                posted_to = %plan.posted_to,
                page_size = plan.page_size,
                "sync started"
            );
            let mut requests_sent = 0u32;
            'codes: for code in plan.passes() {
                let key = code.clone().unwrap_or_else(|| UNFILTERED_KEY.to_string());
                report.breakdown.entry(key.clone()).or_default();
                let mut offset = 0u32;
                let mut pages = 0u32;

                loop {
                    if cancel.is_cancelled() || (requests_sent > 0 && !self.pace(cancel).await) {
                        report.cancelled = true;
                        break 'codes;
                    }
                    requests_sent += 1;

                    let query = plan.query(code.as_deref(), offset);
                    let page = match self.source.search(&query).await {
                        Ok(page) => page,
                        Err(err) => {
                            warn!(naics = %key, offset, error = %err, "sync fetch failed; skipping code");
                            let entry = report.breakdown.entry(key.clone()).or_default();
                            entry.errors += 1;
                            entry.error = Some(err.to_string());
                            report.errors += 1;
                            progress.send_replace(report.clone());
                            break;
                        }
                    };

                    let received = page.received;
                    let dropped = page.dropped();
                    if dropped > 0 {
                        warn!(naics = %key, offset, dropped, "unparsable notices counted as errors");
                    }
                    let mut tally = CodeBreakdown {
                        total_fetched: u64::from(received),
                        errors: u64::from(dropped),
                        ..Default::default()
                    };
                    for listing in page.listings {
                        let notice_id = listing.notice_id.clone();
                        match self.store.upsert_external(listing, Utc::now()).await {
                            Ok(UpsertOutcome::Inserted) => tally.imported += 1,
                            Ok(UpsertOutcome::Updated) => tally.updated += 1,
                            Err(err) => {
                                warn!(naics = %key, notice_id = %notice_id, error = %err, "upsert failed");
                                tally.errors += 1;
                            }
                        }
                    }
                    Self::accumulate(&mut report, &key, &tally);
                    progress.send_replace(report.clone());

                    pages += 1;
                    offset += received;
                    debug!(naics = %key, pages, offset, total = page.total_records, "page processed");
                    if received < plan.page_size
                        || u64::from(offset) >= page.total_records
                        || pages >= self.config.max_pages_per_code
                    {
                        break;
                    }
                }
            }

            report.finished_at = Some(Utc::now());
            progress.send_replace(report.clone());
            info!(
                imported = report.imported,
                updated = report.updated,
                errors = report.errors,
                total_fetched = report.total_fetched,
                cancelled = report.cancelled,
                "sync finished"
            );
            report
        }
        .instrument(span)
        .await
    }

    /// Returns `false` if cancelled while waiting.
    async fn pace(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.request_delay) => true,
        }
    }

    fn accumulate(report: &mut SyncReport, key: &str, tally: &CodeBreakdown) {
        report.imported += tally.imported;
        report.updated += tally.updated;
        report.errors += tally.errors;
        report.total_fetched += tally.total_fetched;
        let entry = report.breakdown.entry(key.to_string()).or_default();
        entry.imported += tally.imported;
        entry.updated += tally.updated;
        entry.errors += tally.errors;
        entry.total_fetched += tally.total_fetched;
    }
}
