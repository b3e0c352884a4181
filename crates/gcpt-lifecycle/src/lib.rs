//! Opportunity lifecycle rules and the audit outbox.

pub mod activity;
pub mod service;

pub use activity::{ActivityRecorder, FlushReport, OutboxStatus, FLUSH_BATCH};
pub use service::{PipelineService, RevertOutcome, WonOutcome};

pub const CRATE_NAME: &str = "gcpt-lifecycle";
