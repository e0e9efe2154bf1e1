use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("sqlite migrate error: {0}")]
    SqliteMigrate(#[from] sqlx::migrate::MigrateError),

    #[error("listing failed: bucket={bucket} folder={folder:?}: {message}")]
    Listing {
        bucket: String,
        folder: String,
        message: String,
    },

    #[error("no signed url returned for {bucket}/{path}")]
    NoSignedUrl { bucket: String, path: String },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("staging file missing: {path:?}")]
    StagingFileMissing { path: PathBuf },

    #[error("backend rejected request: {message}")]
    BackendRejected { message: String },

    #[error("bucket already exists: {bucket}")]
    BucketExists { bucket: String },

    #[error("invalid object path: {path:?}")]
    InvalidObjectPath { path: String },

    #[error("persistence error: {message}")]
    Persistence { message: String },

    #[error("no object index found; run `download` or `migrate` first")]
    NoIndex,

    #[error("download phase not finished (phase={phase}); run `download` or `migrate` first")]
    DownloadIncomplete { phase: crate::state::Phase },

    #[error("worker task failed: {message}")]
    Task { message: String },

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Whether a later attempt of the same operation could plausibly succeed.
    ///
    /// The retry loop does not consult this; it is surfaced to operators.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoSignedUrl { .. }
                | Self::Transport { .. }
                | Self::BackendRejected { .. }
                | Self::Io(_)
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "config.invalid",
            Self::Io(_) => "io.failed",
            Self::Json(_) => "json.invalid",
            Self::Sqlite(_) | Self::SqliteMigrate(_) => "db.failed",
            Self::Listing { .. } => "storage.listing_failed",
            Self::NoSignedUrl { .. } => "storage.no_signed_url",
            Self::Transport { .. } => "storage.unavailable",
            Self::StagingFileMissing { .. } => "staging.missing",
            Self::BackendRejected { .. } => "storage.rejected",
            Self::BucketExists { .. } => "storage.bucket_exists",
            Self::InvalidObjectPath { .. } => "object.invalid_path",
            Self::Persistence { .. } => "state.write_failed",
            Self::NoIndex => "state.no_index",
            Self::DownloadIncomplete { .. } => "state.download_incomplete",
            Self::Task { .. } => "task.failed",
            Self::Cancelled => "task.cancelled",
        }
    }
}
