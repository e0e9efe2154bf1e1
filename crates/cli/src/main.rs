use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bucket_migrate_core::config::{self, Endpoint};
use bucket_migrate_core::{
    APP_NAME, HttpObjectStore, HttpObjectStoreConfig, JsonFileKvStore, KvStore,
    MigrationProgress, MigrationReport, Migrator, ProgressSink, ProgressStore, RunMode,
    RunOptions, Settings, SqliteKvStore, StateBackend, run_log,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

const EXIT_OK: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PARTIAL: i32 = 2;

const FALLBACK_ERROR_JSON: &str =
    r#"{"code":"unknown","message":"json encode failed","details":{},"retryable":false}"#;

#[derive(Parser)]
#[command(name = "bucketmigrate")]
#[command(
    about = "Copy every object of one storage service into another, resumably",
    long_about = None
)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    /// Print NDJSON progress events on stdout.
    #[arg(long, global = true)]
    events: bool,

    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Index, download and upload (default).
    Migrate {
        /// Restart every phase at this ordinal instead of the saved cursor.
        #[arg(long = "from")]
        from: Option<u64>,
    },
    /// Index and download into the staging directory.
    Download {
        #[arg(long = "from")]
        from: Option<u64>,
    },
    /// Upload staged objects using the saved index.
    Upload {
        #[arg(long = "from")]
        from: Option<u64>,
    },
    /// Show the saved progress.
    Status {
        /// Number of failed items to list.
        #[arg(long, default_value_t = 20)]
        failures: usize,
    },
    /// Discard the saved progress and object index.
    Reset,
    /// Reset and delete the staging directory.
    Clean,
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
    /// Read TOML settings from stdin, validate and save them.
    Set,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

struct NdjsonProgressSink {
    task_id: String,
}

impl ProgressSink for NdjsonProgressSink {
    fn on_progress(&self, p: MigrationProgress) {
        let line = serde_json::json!({
            "type": "task.progress",
            "taskId": self.task_id,
            "phase": p.phase,
            "itemsTotal": p.items_total,
            "itemsDone": p.items_done,
            "itemsFailed": p.items_failed,
            "bytesDone": p.bytes_done,
        });
        println!("{line}");
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            emit_error(&e);
            EXIT_ERROR
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32, CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| {
            std::env::var("BUCKETMIGRATE_CONFIG_DIR")
                .ok()
                .map(PathBuf::from)
        })
        .unwrap_or_else(default_config_dir);
    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var("BUCKETMIGRATE_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| config_dir.clone());

    let out = Output {
        json: cli.json,
        events: cli.events,
    };
    match cli.cmd.unwrap_or(Command::Migrate { from: None }) {
        Command::Migrate { from } => {
            transfer_run(&config_dir, &data_dir, RunMode::Migrate, from, out).await
        }
        Command::Download { from } => {
            transfer_run(&config_dir, &data_dir, RunMode::Download, from, out).await
        }
        Command::Upload { from } => {
            transfer_run(&config_dir, &data_dir, RunMode::Upload, from, out).await
        }
        Command::Status { failures } => status(&config_dir, &data_dir, failures, out).await,
        Command::Reset => reset(&config_dir, &data_dir, out).await,
        Command::Clean => clean(&config_dir, &data_dir, out).await,
        Command::Settings { cmd } => match cmd {
            SettingsCmd::Get => settings_get(&config_dir, out),
            SettingsCmd::Set => settings_set(&config_dir, out),
        },
    }
}

#[derive(Clone, Copy)]
struct Output {
    json: bool,
    events: bool,
}

fn print_json(value: &impl Serialize) -> Result<(), CliError> {
    let text = serde_json::to_string(value)
        .map_err(|e| CliError::new("json.invalid", e.to_string()))?;
    println!("{text}");
    Ok(())
}

async fn transfer_run(
    config_dir: &Path,
    data_dir: &Path,
    mode: RunMode,
    from: Option<u64>,
    out: Output,
) -> Result<i32, CliError> {
    let settings = load_settings(config_dir)?;
    let migrator = build_migrator(&settings, data_dir, true).await?;

    let run_id = format!("run_{}", uuid::Uuid::new_v4());
    let _log = run_log::start_run_log(mode.as_str(), &run_id, data_dir)
        .map_err(|e| CliError::new("log.init_failed", e.to_string()))?;
    tracing::info!(
        event = "run.start",
        kind = mode.as_str(),
        run_id = %run_id,
        resume_from = from,
        "run.start"
    );

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if let Some(err) = watch_interrupts(tokio::signal::ctrl_c, signal_token).await {
            emit_error(&err);
            std::process::exit(EXIT_ERROR);
        }
    });

    if out.events {
        emit_task_state(&run_id, mode, "running", None);
    }

    let sink = NdjsonProgressSink {
        task_id: run_id.clone(),
    };
    let options = RunOptions {
        resume_from: from,
        cancel: Some(&cancel),
        progress: if out.events { Some(&sink) } else { None },
    };
    let report = match migrator.run(mode, options).await {
        Ok(report) => report,
        Err(e) => {
            let err = map_core_err(e);
            tracing::error!(
                event = "run.finish",
                kind = mode.as_str(),
                run_id = %run_id,
                status = "failed",
                code = err.code,
                error = %err.message,
                "run.finish"
            );
            if out.events {
                emit_task_state(&run_id, mode, "failed", Some(&err));
            }
            return Err(err);
        }
    };

    let code = if report.has_failures() {
        EXIT_PARTIAL
    } else {
        EXIT_OK
    };
    tracing::info!(
        event = "run.finish",
        kind = mode.as_str(),
        run_id = %run_id,
        status = if code == EXIT_OK { "succeeded" } else { "partial" },
        phase = report.phase.as_str(),
        failed_items = report.failed_items(),
        "run.finish"
    );

    if out.events {
        emit_task_state(&run_id, mode, "succeeded", None);
        return Ok(code);
    }
    if out.json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    Ok(code)
}

fn emit_task_state(run_id: &str, mode: RunMode, state: &str, error: Option<&CliError>) {
    let mut line = serde_json::json!({
        "type": "task.state",
        "taskId": run_id,
        "kind": mode.as_str(),
        "state": state,
    });
    if let Some(e) = error {
        line["error"] = serde_json::json!({ "code": e.code, "message": e.message });
    }
    println!("{line}");
}

fn print_report(report: &MigrationReport) {
    if report.already_completed {
        println!("migration already completed ({} items)", report.items_total);
        return;
    }
    println!("phase={}", report.phase);
    println!(
        "itemsTotal={} downloaded={} uploaded={}",
        report.items_total, report.downloaded, report.uploaded
    );
    for summary in [&report.download, &report.upload].into_iter().flatten() {
        println!(
            "{}: attempted={} succeeded={} failed={} bytes={}",
            summary.phase, summary.attempted, summary.succeeded, summary.failed, summary.bytes
        );
        for f in &summary.failures {
            println!("  failed #{} {}/{}: {}", f.ordinal, f.bucket, f.path, f.error);
        }
    }
    if !report.buckets_created.is_empty() {
        println!("bucketsCreated={}", report.buckets_created.join(","));
    }
}

async fn status(
    config_dir: &Path,
    data_dir: &Path,
    failures: usize,
    out: Output,
) -> Result<i32, CliError> {
    let settings = load_settings(config_dir)?;
    let migrator = build_migrator(&settings, data_dir, false).await?;
    let mut status = migrator.status().await.map_err(map_core_err)?;

    if out.json {
        print_json(&status)?;
        return Ok(EXIT_OK);
    }

    println!("phase={}", status.phase);
    println!(
        "itemsTotal={} downloaded={} ({:.1}%) uploaded={} ({:.1}%) withErrors={}",
        status.counts.total,
        status.counts.downloaded,
        status.downloaded_percent,
        status.counts.uploaded,
        status.uploaded_percent,
        status.counts.with_errors
    );
    println!(
        "downloadCursor={} uploadCursor={}",
        cursor_text(status.download_cursor),
        cursor_text(status.upload_cursor)
    );
    if let Some(started) = status.started_at {
        println!("startedAt={}", started.to_rfc3339());
    }
    if let Some(saved) = status.last_saved_at {
        println!("lastSavedAt={}", saved.to_rfc3339());
    }
    println!("state={} ({})", status.progress_location, status.backend);
    println!(
        "staging={} files={} bytes={}",
        status.staging_dir.display(),
        status.staged_files,
        status.staged_bytes
    );
    let total_failures = status.failures.len();
    status.failures.truncate(failures);
    for f in &status.failures {
        println!("  failed #{} {}/{}: {}", f.ordinal, f.bucket, f.path, f.error);
    }
    if total_failures > status.failures.len() {
        println!("  ... {} more", total_failures - status.failures.len());
    }
    Ok(EXIT_OK)
}

fn cursor_text(cursor: Option<u64>) -> String {
    cursor.map_or_else(|| "-".to_string(), |c| c.to_string())
}

async fn reset(config_dir: &Path, data_dir: &Path, out: Output) -> Result<i32, CliError> {
    let settings = load_settings(config_dir)?;
    let migrator = build_migrator(&settings, data_dir, false).await?;
    migrator.reset().await.map_err(map_core_err)?;
    if out.json {
        println!("{}", serde_json::json!({ "reset": true }));
    } else {
        println!("progress discarded");
    }
    Ok(EXIT_OK)
}

async fn clean(config_dir: &Path, data_dir: &Path, out: Output) -> Result<i32, CliError> {
    let settings = load_settings(config_dir)?;
    let migrator = build_migrator(&settings, data_dir, false).await?;
    let report = migrator.clean().await.map_err(map_core_err)?;
    if out.json {
        print_json(&report)?;
    } else {
        if !report.was_completed {
            eprintln!("warning: the migration had not completed");
        }
        println!(
            "removed staging: files={} bytes={}",
            report.removed_files, report.removed_bytes
        );
    }
    Ok(EXIT_OK)
}

fn settings_get(config_dir: &Path, out: Output) -> Result<i32, CliError> {
    let settings = load_settings(config_dir)?;
    let source_key = key_present(&settings.source);
    let destination_key = key_present(&settings.destination);

    if out.json {
        println!(
            "{}",
            serde_json::json!({
                "settings": settings,
                "keys": { "sourcePresent": source_key, "destinationPresent": destination_key }
            })
        );
    } else {
        let text = toml::to_string(&settings)
            .map_err(|e| CliError::new("config.invalid", e.to_string()))?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
        println!();
        println!("sourceKeyPresent={source_key}");
        println!("destinationKeyPresent={destination_key}");
    }
    Ok(EXIT_OK)
}

fn settings_set(config_dir: &Path, out: Output) -> Result<i32, CliError> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
    let settings = config::parse_settings(&input).map_err(map_core_err)?;
    std::fs::create_dir_all(config_dir)
        .map_err(|e| CliError::new("config.write_failed", e.to_string()))?;
    config::save_settings(config_dir, &settings).map_err(map_core_err)?;

    if out.json {
        println!("{}", serde_json::json!({ "settings": settings }));
    }
    Ok(EXIT_OK)
}

fn default_config_dir() -> PathBuf {
    PathBuf::from(format!(".{}", APP_NAME.to_ascii_lowercase()))
}

fn load_settings(config_dir: &Path) -> Result<Settings, CliError> {
    config::load_settings(config_dir).map_err(map_core_err)
}

fn key_present(endpoint: &Endpoint) -> bool {
    read_key(endpoint).is_some()
}

fn read_key(endpoint: &Endpoint) -> Option<String> {
    std::env::var(&endpoint.key_env)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Local-only commands (status, reset, clean) never reach the services, so
/// their credentials are not required.
fn build_store(
    name: &str,
    endpoint: &Endpoint,
    require_credentials: bool,
) -> Result<HttpObjectStore, CliError> {
    let key = read_key(endpoint);
    if require_credentials {
        if endpoint.url.is_empty() {
            return Err(CliError::new(
                "config.invalid",
                format!("{name}.url is empty"),
            ));
        }
        if key.is_none() {
            return Err(CliError::new(
                "config.invalid",
                format!("{name} service key missing: set {}", endpoint.key_env),
            )
            .with_details(serde_json::json!({ "env": endpoint.key_env })));
        }
    }
    HttpObjectStore::new(HttpObjectStoreConfig::new(
        endpoint.url.clone(),
        key.unwrap_or_default(),
    ))
    .map_err(map_core_err)
}

async fn build_migrator(
    settings: &Settings,
    data_dir: &Path,
    require_credentials: bool,
) -> Result<Migrator, CliError> {
    let source = build_store("source", &settings.source, require_credentials)?;
    let destination = build_store("destination", &settings.destination, require_credentials)?;

    let state_dir = data_dir.join("state");
    let kv: Box<dyn KvStore> = match settings.state.backend {
        StateBackend::Json => Box::new(JsonFileKvStore::new(&state_dir)),
        StateBackend::Sqlite => Box::new(
            SqliteKvStore::open(&state_dir.join("state.sqlite"))
                .await
                .map_err(map_core_err)?,
        ),
    };

    let config = settings.migration_config(data_dir.join("staging"));
    config.validate().map_err(map_core_err)?;
    Ok(Migrator::new(
        config,
        Arc::new(source),
        Arc::new(destination),
        ProgressStore::new(kv),
    ))
}

/// The first interrupt stops the run at the next chunk boundary. A second
/// one returns the error to exit with immediately.
async fn watch_interrupts<S, F>(mut next_signal: S, cancel: CancellationToken) -> Option<CliError>
where
    S: FnMut() -> F,
    F: Future<Output = std::io::Result<()>>,
{
    next_signal().await.ok()?;
    tracing::warn!(event = "run.interrupt", "run.interrupt");
    cancel.cancel();

    next_signal().await.ok()?;
    tracing::warn!(event = "run.interrupt_forced", "run.interrupt_forced");
    Some(CliError::new(
        "task.cancelled",
        "interrupted again; exiting before the next checkpoint",
    ))
}

fn map_core_err(e: bucket_migrate_core::Error) -> CliError {
    use bucket_migrate_core::Error;

    let details = match &e {
        Error::Listing { bucket, folder, .. } => {
            serde_json::json!({ "bucket": bucket, "folder": folder })
        }
        Error::NoSignedUrl { bucket, path } => serde_json::json!({ "bucket": bucket, "path": path }),
        Error::StagingFileMissing { path } => serde_json::json!({ "path": path }),
        Error::BucketExists { bucket } => serde_json::json!({ "bucket": bucket }),
        Error::InvalidObjectPath { path } => serde_json::json!({ "path": path }),
        Error::DownloadIncomplete { phase } => serde_json::json!({ "phase": phase }),
        _ => serde_json::json!({}),
    };
    let message = match &e {
        Error::InvalidConfig { message } => message.clone(),
        other => other.to_string(),
    };
    CliError {
        code: e.code(),
        message,
        details,
        retryable: e.is_retryable(),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| FALLBACK_ERROR_JSON.to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_migrate() {
        let cli = Cli::try_parse_from(["bucketmigrate", "--json"]).unwrap();
        assert!(cli.json);
        assert!(cli.cmd.is_none());
    }

    #[test]
    fn from_flag_is_parsed_per_transfer_command() {
        let cli = Cli::try_parse_from(["bucketmigrate", "upload", "--from", "42"]).unwrap();
        assert!(matches!(cli.cmd, Some(Command::Upload { from: Some(42) })));
        assert!(Cli::try_parse_from(["bucketmigrate", "status", "--from", "1"]).is_err());
    }

    #[test]
    fn core_errors_keep_code_and_retryability() {
        let err = map_core_err(bucket_migrate_core::Error::Transport {
            message: "timeout".to_string(),
        });
        assert_eq!(err.code, "storage.unavailable");
        assert!(err.retryable);

        let err = map_core_err(bucket_migrate_core::Error::NoIndex);
        assert_eq!(err.code, "state.no_index");
        assert!(!err.retryable);

        let err = map_core_err(bucket_migrate_core::Error::DownloadIncomplete {
            phase: bucket_migrate_core::Phase::Downloading,
        });
        assert_eq!(err.code, "state.download_incomplete");
        assert_eq!(err.details["phase"], "downloading");
    }

    #[tokio::test]
    async fn second_interrupt_forces_exit() {
        let cancel = CancellationToken::new();
        let err = watch_interrupts(|| std::future::ready(Ok(())), cancel.clone())
            .await
            .unwrap();
        assert!(cancel.is_cancelled());
        assert_eq!(err.code, "task.cancelled");
    }

    #[tokio::test]
    async fn single_interrupt_only_cancels() {
        let cancel = CancellationToken::new();
        let mut presses = 0;
        let res = watch_interrupts(
            || {
                presses += 1;
                std::future::ready(if presses == 1 {
                    Ok(())
                } else {
                    Err(std::io::Error::other("signal stream closed"))
                })
            },
            cancel.clone(),
        )
        .await;
        assert!(res.is_none());
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn local_commands_do_not_need_credentials() {
        let endpoint = Endpoint {
            url: String::new(),
            key_env: "BUCKETMIGRATE_TEST_UNSET_KEY".to_string(),
        };
        assert!(build_store("source", &endpoint, false).is_ok());
        let err = build_store("source", &endpoint, true).err().unwrap();
        assert_eq!(err.code, "config.invalid");
    }
}
