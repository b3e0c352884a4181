use std::sync::Arc;

use gcpt_lifecycle::PipelineService;
use gcpt_sync::{SyncConfig, SyncManager};

#[derive(Clone)]
pub struct AppState {
    pub service: PipelineService,
    pub sync: Arc<SyncManager>,
}

impl AppState {
    pub fn new(service: PipelineService, sync: SyncManager) -> Self {
        Self {
            service,
            sync: Arc::new(sync),
        }
    }

    pub fn sync_config(&self) -> &SyncConfig {
        self.sync.pipeline().config()
    }
}
