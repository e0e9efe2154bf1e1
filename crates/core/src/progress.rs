use serde::{Deserialize, Serialize};

use crate::state::Phase;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationProgress {
    pub phase: Phase,
    pub items_total: u64,
    pub items_done: u64,
    pub items_failed: u64,
    pub bytes_done: u64,
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: MigrationProgress);
}
