use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use chrono::Utc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "BUCKETMIGRATE_LOG";
pub const LOG_DIR_ENV: &str = "BUCKETMIGRATE_LOG_DIR";

/// Run kinds that get their own NDJSON file.
pub const RUN_KINDS: &[&str] = &["migrate", "download", "upload"];

static RUN_LOGGER: OnceLock<RunLogger> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

#[derive(Debug)]
struct RunLogger {
    writer: Mutex<Option<BufWriter<std::fs::File>>>,
}

impl RunLogger {
    fn new() -> Self {
        Self {
            writer: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<BufWriter<std::fs::File>>> {
        // A panic while holding the lock leaves at worst a torn log line.
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start(&self, path: &Path) -> std::io::Result<()> {
        let mut guard = self.lock();
        if guard.is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "run log already active",
            ));
        }

        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        *guard = Some(BufWriter::new(file));
        Ok(())
    }

    fn finish(&self) -> std::io::Result<()> {
        let Some(mut writer) = self.lock().take() else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }
}

pub struct RunLogWriter<'a> {
    guard: MutexGuard<'a, Option<BufWriter<std::fs::File>>>,
}

impl Write for RunLogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.guard.as_mut() {
            Some(w) => w.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.guard.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RunLogger {
    type Writer = RunLogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RunLogWriter { guard: self.lock() }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for &RunLogger {
    type Writer = RunLogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        (**self).make_writer()
    }
}

fn build_env_filter_from(app_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let default = || EnvFilter::new("debug");

    if let Some(v) = app_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    if let Some(v) = rust_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    default()
}

fn build_env_filter() -> EnvFilter {
    build_env_filter_from(
        std::env::var(LOG_ENV).ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    )
}

pub fn init_run_logging() {
    TRACING_INIT.get_or_init(|| {
        let logger = RUN_LOGGER.get_or_init(RunLogger::new);

        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(logger);

        let _ = tracing_subscriber::registry()
            .with(build_env_filter())
            .with(layer)
            .try_init();
    });
}

/// Flushes and closes the run log when dropped.
pub struct RunLogGuard {
    path: PathBuf,
}

impl RunLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        if let Some(logger) = RUN_LOGGER.get() {
            let _ = logger.finish();
        }
    }
}

pub fn start_run_log(kind: &str, run_id: &str, data_dir: &Path) -> std::io::Result<RunLogGuard> {
    init_run_logging();

    if !RUN_KINDS.contains(&kind) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unsupported kind: {kind}"),
        ));
    }

    let log_dir = resolve_log_dir(data_dir);
    std::fs::create_dir_all(&log_dir)?;

    let file_name = format!(
        "migrate-{}-{}-{}.ndjson",
        sanitize_filename_component(kind),
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        sanitize_filename_component(run_id)
    );
    let path = log_dir.join(file_name);

    RUN_LOGGER.get_or_init(RunLogger::new).start(&path)?;

    Ok(RunLogGuard { path })
}

fn resolve_log_dir(data_dir: &Path) -> PathBuf {
    match std::env::var(LOG_DIR_ENV) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v),
        _ => data_dir.join("logs"),
    }
}

fn sanitize_filename_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_filter_prefers_app_variable_then_rust_log() {
        assert_eq!(
            build_env_filter_from(Some("info"), Some("debug")).to_string(),
            "info"
        );
        assert_eq!(build_env_filter_from(None, Some("warn")).to_string(), "warn");
        assert_eq!(build_env_filter_from(None, None).to_string(), "debug");
    }

    #[test]
    fn sanitizes_run_ids() {
        assert_eq!(sanitize_filename_component("run/1 x"), "run_1_x");
    }

    #[test]
    fn rejects_unknown_kind() {
        let temp = tempfile::tempdir().unwrap();
        let err = start_run_log("backup", "r1", temp.path()).err().unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn run_log_is_ndjson_and_flushed_on_drop() {
        let temp = tempfile::tempdir().unwrap();
        let guard = start_run_log("migrate", "run_test", temp.path()).unwrap();

        assert_eq!(guard.path().parent(), Some(temp.path().join("logs").as_path()));
        let name = guard.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("migrate-migrate-"), "{name}");
        assert!(name.ends_with("-run_test.ndjson"), "{name}");

        tracing::info!(event = "run.start", kind = "migrate", run_id = "run_test", "run.start");
        tracing::debug!(event = "phase.start", phase = "downloading", "phase.start");
        tracing::info!(event = "run.finish", status = "succeeded", "run.finish");

        let path = guard.path().to_path_buf();
        drop(guard);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.trim().is_empty(), "run log is empty");
        for line in text.lines() {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            let obj = v.as_object().unwrap();
            assert!(obj.contains_key("timestamp"));
            assert!(obj.contains_key("level"));
            let fields = obj.get("fields").and_then(|f| f.as_object()).unwrap();
            assert!(fields.contains_key("event") || fields.contains_key("message"));
        }
    }
}
