mod batch;
pub mod config;
mod error;
mod indexer;
pub mod kv;
mod migrator;
pub mod progress;
mod progress_store;
mod retry;
pub mod run_log;
mod state;
mod storage;
mod transfer;

pub const APP_NAME: &str = "BucketMigrate";

pub use batch::{BatchOutcome, BoundedBatchRunner};
pub use config::{MigrationConfig, Settings, StateBackend};
pub use error::{Error, Result};
pub use indexer::build_index;
pub use kv::{JsonFileKvStore, KvStore, SqliteKvStore};
pub use migrator::{
    CleanReport, FailedItem, MigrationReport, Migrator, PhaseSummary, RunMode, RunOptions,
    StatusReport,
};
pub use progress::{MigrationProgress, ProgressSink};
pub use progress_store::{OBJECT_INDEX_KEY, PROGRESS_KEY, ProgressStore};
pub use retry::RetryPolicy;
pub use state::{ItemCounts, Phase, ProgressState, TransferItem};
pub use storage::{
    BucketOptions, HttpObjectStore, HttpObjectStoreConfig, InMemoryStorage, ListEntry,
    ObjectStore, StoreFuture, UploadOptions,
};
pub use transfer::{BucketReport, DownloadReceipt, Staging, download_one, ensure_buckets, upload_one};
