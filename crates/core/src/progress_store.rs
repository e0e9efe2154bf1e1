use chrono::Utc;
use tracing::{debug, warn};

use crate::kv::KvStore;
use crate::state::{PROGRESS_SCHEMA_VERSION, ProgressState, TransferItem};
use crate::{Error, Result};

pub const PROGRESS_KEY: &str = "migration-progress";
pub const OBJECT_INDEX_KEY: &str = "object-index";

/// Durable home of the migration state: the full progress record plus a
/// redundant object-index record holding only the items.
pub struct ProgressStore {
    kv: Box<dyn KvStore>,
}

impl ProgressStore {
    pub fn new(kv: Box<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn backend(&self) -> &'static str {
        self.kv.backend()
    }

    pub fn progress_location(&self) -> String {
        self.kv.location(PROGRESS_KEY)
    }

    pub fn index_location(&self) -> String {
        self.kv.location(OBJECT_INDEX_KEY)
    }

    /// Loads the progress record. A missing, unreadable or corrupt record
    /// yields a fresh state; the reason is logged.
    pub async fn load(&self) -> ProgressState {
        let bytes = match self.kv.get(PROGRESS_KEY).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(event = "state.load", found = false, "state.load");
                return ProgressState::new();
            }
            Err(e) => {
                warn!(
                    event = "state.load_failed",
                    backend = self.kv.backend(),
                    error = %e,
                    "state.load_failed"
                );
                return ProgressState::new();
            }
        };

        match serde_json::from_slice::<ProgressState>(&bytes) {
            Ok(state) if state.schema_version == PROGRESS_SCHEMA_VERSION => {
                debug!(
                    event = "state.load",
                    found = true,
                    phase = %state.phase,
                    items = state.items.len() as u64,
                    "state.load"
                );
                state
            }
            Ok(state) => {
                warn!(
                    event = "state.load_failed",
                    backend = self.kv.backend(),
                    schema_version = state.schema_version,
                    "state.load_failed"
                );
                ProgressState::new()
            }
            Err(e) => {
                warn!(
                    event = "state.load_failed",
                    backend = self.kv.backend(),
                    error = %e,
                    "state.load_failed"
                );
                ProgressState::new()
            }
        }
    }

    /// Loads the object-index record on its own. Missing or corrupt records
    /// yield an empty list.
    pub async fn load_index(&self) -> Vec<TransferItem> {
        let bytes = match self.kv.get(OBJECT_INDEX_KEY).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(event = "index.load_failed", error = %e, "index.load_failed");
                return Vec::new();
            }
        };
        serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            warn!(event = "index.load_failed", error = %e, "index.load_failed");
            Vec::new()
        })
    }

    /// Writes the progress record, stamping `last_saved_at`.
    pub async fn save(&self, state: &mut ProgressState) -> Result<()> {
        let previous = state.last_saved_at;
        state.last_saved_at = Some(Utc::now());
        let bytes = match serde_json::to_vec(state) {
            Ok(bytes) => bytes,
            Err(e) => {
                state.last_saved_at = previous;
                return Err(Error::Persistence {
                    message: format!("encode progress failed: {e}"),
                });
            }
        };
        if let Err(e) = self.kv.put(PROGRESS_KEY, bytes).await {
            state.last_saved_at = previous;
            return Err(persistence(e));
        }
        Ok(())
    }

    pub async fn save_index(&self, items: &[TransferItem]) -> Result<()> {
        let bytes = serde_json::to_vec(items).map_err(|e| Error::Persistence {
            message: format!("encode object index failed: {e}"),
        })?;
        self.kv
            .put(OBJECT_INDEX_KEY, bytes)
            .await
            .map_err(persistence)
    }

    /// Checkpoint: progress record first, then the index snapshot.
    pub async fn checkpoint(&self, state: &mut ProgressState) -> Result<()> {
        self.save(state).await?;
        self.save_index(&state.items).await
    }

    /// Discards both records.
    pub async fn reset(&self) -> Result<()> {
        self.kv.delete(PROGRESS_KEY).await.map_err(persistence)?;
        self.kv.delete(OBJECT_INDEX_KEY).await.map_err(persistence)
    }
}

fn persistence(e: Error) -> Error {
    match e {
        Error::Persistence { .. } => e,
        other => Error::Persistence {
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::JsonFileKvStore;
    use crate::state::Phase;

    fn store_in(dir: &std::path::Path) -> (ProgressStore, JsonFileKvStore) {
        let kv = JsonFileKvStore::new(dir);
        (ProgressStore::new(Box::new(kv.clone())), kv)
    }

    #[tokio::test]
    async fn missing_store_yields_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store_in(dir.path());
        let state = store.load().await;
        assert_eq!(state.phase, Phase::Init);
        assert!(state.items.is_empty());
        assert!(store.load_index().await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_store_yields_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let (store, kv) = store_in(dir.path());
        std::fs::write(kv.path_for(PROGRESS_KEY), b"{not json").unwrap();
        std::fs::write(kv.path_for(OBJECT_INDEX_KEY), b"[{").unwrap();

        assert_eq!(store.load().await.phase, Phase::Init);
        assert!(store.load_index().await.is_empty());
    }

    #[tokio::test]
    async fn checkpoint_roundtrip_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let (store, kv) = store_in(dir.path());

        let mut state = ProgressState::new();
        state.advance_phase(Phase::Downloading);
        state.items.push(TransferItem::new("b", "c.txt", 5, None));
        state.advance_download_cursor(0);
        store.checkpoint(&mut state).await.unwrap();
        assert!(state.last_saved_at.is_some());

        let loaded = store.load().await;
        assert_eq!(loaded.phase, Phase::Downloading);
        assert_eq!(loaded.download_cursor, Some(0));
        assert_eq!(loaded.items, state.items);
        assert_eq!(store.load_index().await, state.items);

        store.reset().await.unwrap();
        assert!(!kv.path_for(PROGRESS_KEY).exists());
        assert!(!kv.path_for(OBJECT_INDEX_KEY).exists());
        assert_eq!(store.load().await.phase, Phase::Init);
    }
}
