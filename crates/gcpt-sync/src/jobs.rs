//! Sync jobs running as spawned tasks, with live status and cancellation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{write_report, SyncPipeline, SyncPlan, SyncReport};

/// Finished jobs kept for polling before the oldest are forgotten.
pub const RETAINED_JOBS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub state: JobState,
    pub report: SyncReport,
}

impl JobSnapshot {
    fn from_report(report: SyncReport) -> Self {
        let state = match (report.finished_at, report.cancelled) {
            (None, _) => JobState::Running,
            (Some(_), true) => JobState::Cancelled,
            (Some(_), false) => JobState::Completed,
        };
        Self {
            job_id: report.job_id,
            state,
            report,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state != JobState::Running
    }
}

#[derive(Clone)]
pub struct SyncHandle {
    job_id: Uuid,
    progress: watch::Receiver<SyncReport>,
    cancel: CancellationToken,
}

impl SyncHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn status(&self) -> JobSnapshot {
        JobSnapshot::from_report(self.progress.borrow().clone())
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves with the final report. If the task died first, the last
    /// published counters come back marked cancelled.
    pub async fn wait(&self) -> SyncReport {
        let mut rx = self.progress.clone();
        if let Ok(report) = rx.wait_for(|report| report.finished_at.is_some()).await {
            return report.clone();
        }
        let mut report = rx.borrow().clone();
        if report.finished_at.is_none() {
            warn!(job_id = %self.job_id, "sync task ended without a final report");
            report.finished_at = Some(Utc::now());
            report.cancelled = true;
        }
        report
    }
}

pub struct SyncManager {
    pipeline: Arc<SyncPipeline>,
    jobs: RwLock<HashMap<Uuid, SyncHandle>>,
}

impl SyncManager {
    pub fn new(pipeline: SyncPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn pipeline(&self) -> &SyncPipeline {
        &self.pipeline
    }

    pub async fn start(&self, plan: SyncPlan) -> SyncHandle {
        let job_id = Uuid::new_v4();
        let initial = SyncReport::new(job_id, self.pipeline.source_id(), Utc::now());
        let (tx, rx) = watch::channel(initial.clone());
        let cancel = CancellationToken::new();
        let handle = SyncHandle {
            job_id,
            progress: rx,
            cancel: cancel.clone(),
        };

        let pipeline = self.pipeline.clone();
        let reports_dir: Option<PathBuf> = pipeline.config().reports_dir.clone();
        tokio::spawn(async move {
            let report = pipeline.run_with(initial, &plan, &cancel, &tx).await;
            if let Some(dir) = reports_dir {
                match write_report(&dir, &report).await {
                    Ok(path) => info!(job_id = %job_id, path = %path.display(), "sync report written"),
                    Err(err) => warn!(job_id = %job_id, error = %err, "failed to write sync report"),
                }
            }
        });

        let mut jobs = self.jobs.write().await;
        jobs.insert(job_id, handle.clone());
        Self::prune(&mut jobs);
        handle
    }

    pub async fn get(&self, job_id: Uuid) -> Option<SyncHandle> {
        self.jobs.read().await.get(&job_id).cloned()
    }

    /// Newest first.
    pub async fn list(&self) -> Vec<JobSnapshot> {
        let mut snapshots: Vec<JobSnapshot> = self
            .jobs
            .read()
            .await
            .values()
            .map(SyncHandle::status)
            .collect();
        snapshots.sort_by(|a, b| b.report.started_at.cmp(&a.report.started_at));
        snapshots
    }

    pub async fn cancel(&self, job_id: Uuid) -> Option<JobSnapshot> {
        let handle = self.get(job_id).await?;
        info!(job_id = %job_id, "sync cancellation requested");
        handle.cancel();
        Some(handle.status())
    }

    fn prune(jobs: &mut HashMap<Uuid, SyncHandle>) {
        let mut finished: Vec<(chrono::DateTime<Utc>, Uuid)> = jobs
            .values()
            .map(SyncHandle::status)
            .filter(JobSnapshot::is_finished)
            .map(|s| (s.report.started_at, s.job_id))
            .collect();
        if finished.len() <= RETAINED_JOBS {
            return;
        }
        finished.sort();
        let excess = finished.len() - RETAINED_JOBS;
        for (_, id) in finished.into_iter().take(excess) {
            jobs.remove(&id);
        }
    }
}
