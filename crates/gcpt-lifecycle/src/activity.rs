//! Audit outbox.
//!
//! Activities are written after the mutation they describe has committed. A
//! failed write never propagates: the entry is parked in the store's durable
//! outbox and replayed, oldest first, ahead of the next append or when `flush`
//! is called explicitly. While anything is parked, new entries queue behind it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gcpt_core::Activity;
use gcpt_storage::{ActivityOutbox, ActivitySink};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Entries pulled from the outbox per replay round.
pub const FLUSH_BATCH: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxStatus {
    pub pending: usize,
    /// Entries neither delivered nor parked because the outbox itself failed.
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    pub delivered: usize,
    pub pending: usize,
}

pub struct ActivityRecorder {
    sink: Arc<dyn ActivitySink>,
    outbox: Arc<dyn ActivityOutbox>,
    // Serializes replay and append so delivery order matches record order.
    order: Mutex<()>,
    dropped: AtomicU64,
}

impl ActivityRecorder {
    pub fn new(sink: Arc<dyn ActivitySink>, outbox: Arc<dyn ActivityOutbox>) -> Self {
        Self {
            sink,
            outbox,
            order: Mutex::new(()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Deliver `activity`, draining any backlog first.
    pub async fn record(&self, activity: Activity) {
        let _order = self.order.lock().await;
        let (_, backlog) = self.drain().await;
        if backlog != Some(0) {
            debug!(
                activity_id = %activity.id,
                backlog = ?backlog,
                "outbox not empty; queueing behind it"
            );
            self.park(activity).await;
            return;
        }

        let id = activity.id;
        match self.sink.append_activity(activity.clone()).await {
            Ok(_) => debug!(activity_id = %id, kind = %activity.activity_type, "activity recorded"),
            Err(err) => {
                warn!(
                    activity_id = %id,
                    entity_type = %activity.entity_type,
                    entity_id = %activity.entity_id,
                    error = %err,
                    "activity write failed; queued for retry"
                );
                self.park(activity).await;
            }
        }
    }

    /// Replay parked entries in order, stopping at the first failure.
    pub async fn flush(&self) -> FlushReport {
        let _order = self.order.lock().await;
        let (delivered, backlog) = self.drain().await;
        FlushReport {
            delivered,
            pending: backlog.unwrap_or(0),
        }
    }

    pub async fn status(&self) -> OutboxStatus {
        OutboxStatus {
            pending: self.backlog().await.unwrap_or(0),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    pub async fn pending(&self) -> Vec<Activity> {
        match self.outbox.next_queued(usize::MAX).await {
            Ok(queued) => queued,
            Err(err) => {
                warn!(error = %err, "reading activity outbox failed");
                Vec::new()
            }
        }
    }

    /// Returns entries delivered and the backlog left, `None` when the
    /// outbox could not be read.
    async fn drain(&self) -> (usize, Option<usize>) {
        let mut delivered = 0;
        loop {
            let batch = match self.outbox.next_queued(FLUSH_BATCH).await {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(error = %err, "reading activity outbox failed");
                    return (delivered, None);
                }
            };
            if batch.is_empty() {
                return (delivered, Some(0));
            }
            for activity in batch {
                let id = activity.id;
                if let Err(err) = self.sink.append_activity(activity).await {
                    warn!(activity_id = %id, error = %err, "outbox retry failed");
                    return (delivered, self.backlog().await);
                }
                // Appends are idempotent, so a failed removal only costs a replay.
                if let Err(err) = self.outbox.mark_delivered(id).await {
                    warn!(activity_id = %id, error = %err, "clearing delivered outbox entry failed");
                    return (delivered, self.backlog().await);
                }
                delivered += 1;
            }
        }
    }

    async fn backlog(&self) -> Option<usize> {
        match self.outbox.queued_count().await {
            Ok(count) => Some(count),
            Err(err) => {
                warn!(error = %err, "counting activity outbox failed");
                None
            }
        }
    }

    async fn park(&self, activity: Activity) {
        if let Err(err) = self.outbox.queue_activity(&activity).await {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            error!(
                activity_id = %activity.id,
                entity_type = %activity.entity_type,
                entity_id = %activity.entity_id,
                error = %err,
                "activity outbox unavailable; entry lost"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gcpt_core::{Actor, ActivityType, EntityType, Role};
    use gcpt_storage::{MemoryStore, StoreError, StoreResult};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use uuid::Uuid;

    #[derive(Default)]
    struct FlakySink {
        down: AtomicBool,
        refuse_next: AtomicUsize,
        written: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl ActivitySink for FlakySink {
        async fn append_activity(&self, activity: Activity) -> StoreResult<Activity> {
            let refused = self
                .refuse_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused || self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Corrupt {
                    table: "activities",
                    message: "sink offline".into(),
                });
            }
            self.written.lock().await.push(activity.id);
            Ok(activity)
        }
    }

    /// Outbox that refuses every write.
    struct BrokenOutbox;

    #[async_trait]
    impl ActivityOutbox for BrokenOutbox {
        async fn queue_activity(&self, _activity: &Activity) -> StoreResult<()> {
            Err(StoreError::Corrupt {
                table: "activity_outbox",
                message: "disk full".into(),
            })
        }

        async fn next_queued(&self, _limit: usize) -> StoreResult<Vec<Activity>> {
            Ok(Vec::new())
        }

        async fn mark_delivered(&self, _id: Uuid) -> StoreResult<()> {
            Ok(())
        }

        async fn queued_count(&self) -> StoreResult<usize> {
            Ok(0)
        }
    }

    fn note() -> Activity {
        let actor = Actor::new("u-1", "org-1", Role::User);
        Activity::new(&actor, EntityType::Opportunity, Uuid::new_v4(), ActivityType::Note, "n")
    }

    fn recorder(sink: &Arc<FlakySink>, outbox: &Arc<MemoryStore>) -> ActivityRecorder {
        ActivityRecorder::new(sink.clone(), outbox.clone())
    }

    #[tokio::test]
    async fn failed_writes_are_queued_and_replayed_in_order() {
        let sink = Arc::new(FlakySink::default());
        let outbox = Arc::new(MemoryStore::new());
        let recorder = recorder(&sink, &outbox);

        sink.down.store(true, Ordering::SeqCst);
        let first = note();
        let second = note();
        recorder.record(first.clone()).await;
        recorder.record(second.clone()).await;
        assert_eq!(recorder.status().await.pending, 2);

        sink.down.store(false, Ordering::SeqCst);
        let third = note();
        recorder.record(third.clone()).await;

        assert_eq!(recorder.status().await.pending, 0);
        assert_eq!(*sink.written.lock().await, vec![first.id, second.id, third.id]);
    }

    #[tokio::test]
    async fn explicit_flush_reports_delivery() {
        let sink = Arc::new(FlakySink::default());
        let outbox = Arc::new(MemoryStore::new());
        let recorder = recorder(&sink, &outbox);
        sink.down.store(true, Ordering::SeqCst);
        recorder.record(note()).await;

        let report = recorder.flush().await;
        assert_eq!(report, FlushReport { delivered: 0, pending: 1 });

        sink.down.store(false, Ordering::SeqCst);
        let report = recorder.flush().await;
        assert_eq!(report, FlushReport { delivered: 1, pending: 0 });
    }

    #[tokio::test]
    async fn queued_entries_survive_a_new_recorder() {
        let sink = Arc::new(FlakySink::default());
        let outbox = Arc::new(MemoryStore::new());
        sink.down.store(true, Ordering::SeqCst);
        let parked = note();
        recorder(&sink, &outbox).record(parked.clone()).await;

        sink.down.store(false, Ordering::SeqCst);
        let restarted = recorder(&sink, &outbox);
        assert_eq!(restarted.status().await.pending, 1);
        assert_eq!(restarted.pending().await[0].id, parked.id);

        let report = restarted.flush().await;
        assert_eq!(report, FlushReport { delivered: 1, pending: 0 });
        assert_eq!(*sink.written.lock().await, vec![parked.id]);
    }

    #[tokio::test]
    async fn new_entries_wait_behind_an_undelivered_backlog() {
        let sink = Arc::new(FlakySink::default());
        let outbox = Arc::new(MemoryStore::new());
        let recorder = recorder(&sink, &outbox);

        sink.down.store(true, Ordering::SeqCst);
        let a = note();
        recorder.record(a.clone()).await;

        // The replay of `a` fails once more; `b` would be accepted directly.
        sink.down.store(false, Ordering::SeqCst);
        sink.refuse_next.store(1, Ordering::SeqCst);
        let b = note();
        recorder.record(b.clone()).await;
        assert!(sink.written.lock().await.is_empty());
        let queued: Vec<Uuid> = recorder.pending().await.iter().map(|x| x.id).collect();
        assert_eq!(queued, vec![a.id, b.id]);

        let c = note();
        recorder.record(c.clone()).await;
        assert_eq!(*sink.written.lock().await, vec![a.id, b.id, c.id]);
        assert_eq!(recorder.status().await.pending, 0);
    }

    #[tokio::test]
    async fn unavailable_outbox_counts_lost_entries() {
        let sink = Arc::new(FlakySink::default());
        let recorder = ActivityRecorder::new(sink.clone(), Arc::new(BrokenOutbox));
        sink.down.store(true, Ordering::SeqCst);
        recorder.record(note()).await;

        let status = recorder.status().await;
        assert_eq!(status.pending, 0);
        assert_eq!(status.dropped, 1);
    }
}
