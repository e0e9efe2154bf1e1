use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::BoundedBatchRunner;
use crate::config::MigrationConfig;
use crate::indexer::build_index;
use crate::progress::{MigrationProgress, ProgressSink};
use crate::progress_store::ProgressStore;
use crate::state::{ItemCounts, Phase, ProgressState, TransferItem};
use crate::storage::{BucketOptions, ObjectStore};
use crate::transfer::{BucketReport, DownloadReceipt, Staging, download_one, ensure_buckets, upload_one};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Index, download, upload.
    Migrate,
    /// Index and download only.
    Download,
    /// Upload from an existing index.
    Upload,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Migrate => "migrate",
            Self::Download => "download",
            Self::Upload => "upload",
        }
    }
}

#[derive(Default, Clone, Copy)]
pub struct RunOptions<'a> {
    /// Overrides the persisted cursor of every phase run in this call.
    pub resume_from: Option<u64>,
    pub cancel: Option<&'a CancellationToken>,
    pub progress: Option<&'a dyn ProgressSink>,
}

impl RunOptions<'_> {
    fn is_cancelled(&self) -> bool {
        self.cancel.is_some_and(|c| c.is_cancelled())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedItem {
    pub ordinal: u64,
    pub bucket: String,
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseSummary {
    pub phase: Phase,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub bytes: u64,
    pub failures: Vec<FailedItem>,
}

impl PhaseSummary {
    fn new(phase: Phase, attempted: u64) -> Self {
        Self {
            phase,
            attempted,
            succeeded: 0,
            failed: 0,
            bytes: 0,
            failures: Vec::new(),
        }
    }

    fn record_success(&mut self, bytes: u64) {
        self.succeeded += 1;
        self.bytes += bytes;
    }

    fn record_failure(&mut self, item: &TransferItem, error: &Error) {
        self.failed += 1;
        self.failures.push(FailedItem {
            ordinal: item.ordinal,
            bucket: item.bucket.clone(),
            path: item.path.clone(),
            error: error.to_string(),
        });
    }

    fn progress(&self) -> MigrationProgress {
        MigrationProgress {
            phase: self.phase,
            items_total: self.attempted,
            items_done: self.succeeded + self.failed,
            items_failed: self.failed,
            bytes_done: self.bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub phase: Phase,
    pub items_total: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    /// The state was already completed; nothing was contacted.
    pub already_completed: bool,
    pub download: Option<PhaseSummary>,
    pub upload: Option<PhaseSummary>,
    pub buckets_created: Vec<String>,
    pub buckets_existing: Vec<String>,
}

impl MigrationReport {
    fn from_state(state: &ProgressState) -> Self {
        let counts = state.counts();
        Self {
            phase: state.phase,
            items_total: counts.total,
            downloaded: counts.downloaded,
            uploaded: counts.uploaded,
            already_completed: false,
            download: None,
            upload: None,
            buckets_created: Vec::new(),
            buckets_existing: Vec::new(),
        }
    }

    pub fn failed_items(&self) -> u64 {
        [&self.download, &self.upload]
            .into_iter()
            .flatten()
            .map(|s| s.failed)
            .sum()
    }

    pub fn has_failures(&self) -> bool {
        self.failed_items() > 0
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub phase: Phase,
    pub counts: ItemCounts,
    pub downloaded_percent: f64,
    pub uploaded_percent: f64,
    pub download_cursor: Option<u64>,
    pub upload_cursor: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_saved_at: Option<DateTime<Utc>>,
    pub buckets: Vec<String>,
    pub backend: &'static str,
    pub progress_location: String,
    pub staging_dir: PathBuf,
    pub staged_files: u64,
    pub staged_bytes: u64,
    pub failures: Vec<FailedItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanReport {
    pub was_completed: bool,
    pub removed_files: u64,
    pub removed_bytes: u64,
}

pub struct Migrator {
    config: MigrationConfig,
    source: Arc<dyn ObjectStore>,
    destination: Arc<dyn ObjectStore>,
    store: ProgressStore,
    staging: Staging,
}

impl Migrator {
    pub fn new(
        config: MigrationConfig,
        source: Arc<dyn ObjectStore>,
        destination: Arc<dyn ObjectStore>,
        store: ProgressStore,
    ) -> Self {
        let staging = Staging::new(config.staging_dir.clone());
        Self {
            config,
            source,
            destination,
            store,
            staging,
        }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub async fn run(&self, mode: RunMode, options: RunOptions<'_>) -> Result<MigrationReport> {
        self.config.validate()?;

        let mut state = self.load_state().await;
        if state.phase == Phase::Completed {
            info!(
                event = "run.already_completed",
                mode = mode.as_str(),
                items = state.items.len() as u64,
                "run.already_completed"
            );
            let mut report = MigrationReport::from_state(&state);
            report.already_completed = true;
            return Ok(report);
        }

        let indexed = state.has_index() || state.phase >= Phase::Downloading;
        if !indexed {
            if mode == RunMode::Upload {
                return Err(Error::NoIndex);
            }
            options.check_cancelled()?;
            self.index_phase(&mut state).await?;
        }
        if mode == RunMode::Upload && state.phase < Phase::Uploading {
            // Items not yet downloaded would never enter the upload work list.
            return Err(Error::DownloadIncomplete { phase: state.phase });
        }

        let mut download = None;
        let run_download = match mode {
            RunMode::Migrate => state.phase <= Phase::Downloading,
            RunMode::Download => true,
            RunMode::Upload => false,
        };
        if run_download {
            options.check_cancelled()?;
            let summary = self.download_phase(&mut state, &options).await?;
            state.advance_phase(Phase::Uploading);
            self.store.checkpoint(&mut state).await?;
            log_phase_finish(&summary, &state);
            download = Some(summary);
        }

        let mut upload = None;
        let mut buckets = BucketReport::default();
        if mode != RunMode::Download {
            options.check_cancelled()?;
            state.advance_phase(Phase::Uploading);
            let (summary, report) = self.upload_phase(&mut state, &options).await?;
            state.advance_phase(Phase::Completed);
            self.store.checkpoint(&mut state).await?;
            log_phase_finish(&summary, &state);
            upload = Some(summary);
            buckets = report;
        }

        let mut report = MigrationReport::from_state(&state);
        report.download = download;
        report.upload = upload;
        report.buckets_created = buckets.created;
        report.buckets_existing = buckets.existing;
        Ok(report)
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let state = self.load_state().await;
        let counts = state.counts();
        let (staged_files, staged_bytes) = self.staged_totals().await?;
        let failures = state
            .items
            .iter()
            .filter_map(|i| {
                i.last_error.as_ref().map(|e| FailedItem {
                    ordinal: i.ordinal,
                    bucket: i.bucket.clone(),
                    path: i.path.clone(),
                    error: e.clone(),
                })
            })
            .collect();

        Ok(StatusReport {
            phase: state.phase,
            counts,
            downloaded_percent: counts.downloaded_percent(),
            uploaded_percent: counts.uploaded_percent(),
            download_cursor: state.download_cursor,
            upload_cursor: state.upload_cursor,
            started_at: state.has_index().then_some(state.started_at),
            last_saved_at: state.last_saved_at,
            buckets: state.buckets,
            backend: self.store.backend(),
            progress_location: self.store.progress_location(),
            staging_dir: self.staging.root().to_path_buf(),
            staged_files,
            staged_bytes,
            failures,
        })
    }

    pub async fn reset(&self) -> Result<()> {
        self.store.reset().await?;
        info!(
            event = "state.reset",
            backend = self.store.backend(),
            "state.reset"
        );
        Ok(())
    }

    /// Discards the persisted state and the staging directory.
    pub async fn clean(&self) -> Result<CleanReport> {
        let state = self.store.load().await;
        let was_completed = state.phase == Phase::Completed;
        if !was_completed && state.has_index() {
            warn!(
                event = "clean.incomplete_migration",
                phase = %state.phase,
                "clean.incomplete_migration"
            );
        }

        let (removed_files, removed_bytes) = self.staged_totals().await?;
        self.reset().await?;
        match tokio::fs::remove_dir_all(self.staging.root()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(
            event = "staging.removed",
            files = removed_files,
            bytes = removed_bytes,
            "staging.removed"
        );

        Ok(CleanReport {
            was_completed,
            removed_files,
            removed_bytes,
        })
    }

    async fn staged_totals(&self) -> Result<(u64, u64)> {
        let root = self.staging.root().to_path_buf();
        tokio::task::spawn_blocking(move || staged_totals(&root))
            .await
            .map_err(|e| Error::Task {
                message: format!("staging scan failed: {e}"),
            })
    }

    async fn load_state(&self) -> ProgressState {
        let mut state = self.store.load().await;
        if state.has_index() || state.phase == Phase::Completed {
            return state;
        }

        let items = self.store.load_index().await;
        if items.is_empty() {
            return state;
        }
        let mut buckets: Vec<String> = Vec::new();
        for item in &items {
            if !buckets.contains(&item.bucket) {
                buckets.push(item.bucket.clone());
            }
        }
        warn!(
            event = "state.index_adopted",
            items = items.len() as u64,
            location = %self.store.index_location(),
            "state.index_adopted"
        );
        state.buckets = buckets;
        state.items = items;
        state.advance_phase(Phase::Downloading);
        state
    }

    async fn index_phase(&self, state: &mut ProgressState) -> Result<()> {
        let started = Instant::now();
        state.advance_phase(Phase::Indexing);
        debug!(event = "phase.start", phase = "indexing", "phase.start");

        let buckets = if self.config.buckets.is_empty() {
            self.source.list_buckets().await?
        } else {
            self.config.buckets.clone()
        };
        let items = build_index(self.source.as_ref(), &buckets).await;

        state.buckets = buckets;
        state.items = items;
        state.download_cursor = None;
        state.upload_cursor = None;
        state.advance_phase(Phase::Downloading);
        self.store.checkpoint(state).await?;

        let counts = state.counts();
        info!(
            event = "phase.finish",
            phase = "indexing",
            buckets = state.buckets.len() as u64,
            items = counts.total,
            bytes = counts.bytes_total,
            duration_ms = started.elapsed().as_millis() as u64,
            "phase.finish"
        );
        Ok(())
    }

    async fn download_phase(
        &self,
        state: &mut ProgressState,
        options: &RunOptions<'_>,
    ) -> Result<PhaseSummary> {
        state.advance_phase(Phase::Downloading);
        let resume = resume_point(options.resume_from, state.download_cursor);
        let work_list: Vec<TransferItem> = state
            .items
            .iter()
            .filter(|i| i.ordinal >= resume && !i.downloaded)
            .cloned()
            .collect();
        debug!(
            event = "phase.start",
            phase = "downloading",
            resume_from = resume,
            work = work_list.len() as u64,
            "phase.start"
        );

        let source = self.source.clone();
        let staging = self.staging.clone();
        let retry = self.config.retry;
        let ttl = self.config.signed_url_ttl;
        let work = move |item: TransferItem| {
            let source = source.clone();
            let staging = staging.clone();
            async move {
                let label = format!("download {}/{}", item.bucket, item.path);
                retry
                    .run(&label, |_| download_one(source.as_ref(), &staging, &item, ttl))
                    .await
            }
        };

        self.drive_phase(
            state,
            Phase::Downloading,
            work_list,
            self.config.download_concurrency,
            self.config.download_checkpoint_every,
            work,
            |item, receipt: DownloadReceipt| {
                item.downloaded = true;
                item.staging_path = Some(receipt.staging_path);
                receipt.bytes
            },
            options,
        )
        .await
    }

    async fn upload_phase(
        &self,
        state: &mut ProgressState,
        options: &RunOptions<'_>,
    ) -> Result<(PhaseSummary, BucketReport)> {
        let resume = resume_point(options.resume_from, state.upload_cursor);
        let mut work_list = Vec::new();
        for item in state.items.iter().filter(|i| i.ordinal >= resume && !i.uploaded) {
            if item.downloaded || self.is_staged(item).await {
                work_list.push(item.clone());
            }
        }
        debug!(
            event = "phase.start",
            phase = "uploading",
            resume_from = resume,
            work = work_list.len() as u64,
            "phase.start"
        );

        let buckets = if work_list.is_empty() {
            BucketReport::default()
        } else {
            let options = BucketOptions {
                public: self.config.public_buckets,
            };
            ensure_buckets(self.destination.as_ref(), &work_list, options).await?
        };

        let destination = self.destination.clone();
        let staging = self.staging.clone();
        let retry = self.config.retry;
        let work = move |item: TransferItem| {
            let destination = destination.clone();
            let staging = staging.clone();
            async move {
                let label = format!("upload {}/{}", item.bucket, item.path);
                retry
                    .run(&label, |_| upload_one(destination.as_ref(), &staging, &item))
                    .await
            }
        };

        let summary = self
            .drive_phase(
                state,
                Phase::Uploading,
                work_list,
                self.config.upload_concurrency,
                self.config.upload_checkpoint_every,
                work,
                |item, bytes: u64| {
                    item.uploaded = true;
                    bytes
                },
                options,
            )
            .await?;
        Ok((summary, buckets))
    }

    async fn is_staged(&self, item: &TransferItem) -> bool {
        match self.staging.path_for(&item.bucket, &item.path) {
            Ok(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Runs one transfer phase chunk by chunk. Outcomes are folded into
    /// `state` after every chunk; a checkpoint is written once at least
    /// `checkpoint_every` successes accumulated since the previous one.
    #[allow(clippy::too_many_arguments)]
    async fn drive_phase<R, F, Fut>(
        &self,
        state: &mut ProgressState,
        phase: Phase,
        work_list: Vec<TransferItem>,
        concurrency: usize,
        checkpoint_every: usize,
        work: F,
        apply: fn(&mut TransferItem, R) -> u64,
        options: &RunOptions<'_>,
    ) -> Result<PhaseSummary>
    where
        F: Fn(TransferItem) -> Fut,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        let mut summary = PhaseSummary::new(phase, work_list.len() as u64);
        let mut runner = BoundedBatchRunner::new(work_list, concurrency, self.config.batch_pause);
        let checkpoint_every = checkpoint_every.max(1);
        let mut since_checkpoint = 0usize;
        let mut settled_through: Option<u64> = None;

        while let Some(batch) = runner.next_batch(&work).await {
            for outcome in batch {
                let ordinal = outcome.item.ordinal;
                settled_through = Some(settled_through.map_or(ordinal, |o| o.max(ordinal)));
                let Some(item) = state.item_mut(ordinal) else {
                    continue;
                };
                match outcome.result {
                    Ok(value) => {
                        let bytes = apply(item, value);
                        item.last_error = None;
                        summary.record_success(bytes);
                        since_checkpoint += 1;
                    }
                    Err(e) => {
                        item.last_error = Some(e.to_string());
                        summary.record_failure(item, &e);
                    }
                }
            }

            if let Some(sink) = options.progress {
                sink.on_progress(summary.progress());
            }

            if since_checkpoint >= checkpoint_every {
                if let Some(ordinal) = settled_through {
                    advance_cursor(state, phase, ordinal);
                }
                match self.store.checkpoint(state).await {
                    Ok(()) => {
                        debug!(
                            event = "checkpoint.saved",
                            phase = phase.as_str(),
                            cursor = settled_through,
                            "checkpoint.saved"
                        );
                        since_checkpoint = 0;
                    }
                    Err(e) => {
                        warn!(
                            event = "checkpoint.failed",
                            phase = phase.as_str(),
                            error = %e,
                            "checkpoint.failed"
                        );
                    }
                }
            }

            if options.is_cancelled() && runner.remaining() > 0 {
                if let Some(ordinal) = settled_through {
                    advance_cursor(state, phase, ordinal);
                }
                self.store.checkpoint(state).await?;
                warn!(
                    event = "phase.cancelled",
                    phase = phase.as_str(),
                    remaining = runner.remaining() as u64,
                    "phase.cancelled"
                );
                return Err(Error::Cancelled);
            }
        }

        if let Some(ordinal) = settled_through {
            advance_cursor(state, phase, ordinal);
        }
        Ok(summary)
    }
}

fn resume_point(resume_from: Option<u64>, cursor: Option<u64>) -> u64 {
    resume_from.unwrap_or_else(|| cursor.map_or(0, |c| c + 1))
}

fn advance_cursor(state: &mut ProgressState, phase: Phase, ordinal: u64) {
    match phase {
        Phase::Downloading => state.advance_download_cursor(ordinal),
        Phase::Uploading => state.advance_upload_cursor(ordinal),
        _ => {}
    }
}

fn log_phase_finish(summary: &PhaseSummary, state: &ProgressState) {
    info!(
        event = "phase.finish",
        phase = summary.phase.as_str(),
        attempted = summary.attempted,
        succeeded = summary.succeeded,
        failed = summary.failed,
        bytes = summary.bytes,
        next_phase = state.phase.as_str(),
        "phase.finish"
    );
    for failure in &summary.failures {
        warn!(
            event = "item.failed",
            phase = summary.phase.as_str(),
            ordinal = failure.ordinal,
            bucket = %failure.bucket,
            path = %failure.path,
            error = %failure.error,
            "item.failed"
        );
    }
}

fn staged_totals(root: &Path) -> (u64, u64) {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .fold((0, 0), |(files, bytes), e| {
            let len = e.metadata().map(|m| m.len()).unwrap_or(0);
            (files + 1, bytes + len)
        })
}
