use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::{debug, error};

use crate::{Error, Result};

pub type KvFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Minimal durable key/value seam the progress store is written against.
pub trait KvStore: Send + Sync {
    fn backend(&self) -> &'static str;

    fn get<'a>(&'a self, key: &'a str) -> KvFuture<'a, Option<Vec<u8>>>;

    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> KvFuture<'a, ()>;

    /// Removes `key`. Removing an absent key is not an error.
    fn delete<'a>(&'a self, key: &'a str) -> KvFuture<'a, ()>;

    /// Operator-visible location of `key`, for status output.
    fn location(&self, key: &str) -> String;
}

/// One JSON file per key under a directory, written via tmp file + rename.
#[derive(Debug, Clone)]
pub struct JsonFileKvStore {
    dir: PathBuf,
}

impl JsonFileKvStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl KvStore for JsonFileKvStore {
    fn backend(&self) -> &'static str {
        "json"
    }

    fn get<'a>(&'a self, key: &'a str) -> KvFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            match tokio::fs::read(self.path_for(key)).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> KvFuture<'a, ()> {
        Box::pin(async move {
            let path = self.path_for(key);
            tokio::task::spawn_blocking(move || write_file_atomic(&path, &value))
                .await
                .map_err(|e| Error::Persistence {
                    message: format!("write task failed: {e}"),
                })?
                .map_err(|e| Error::Persistence {
                    message: format!("write {key} failed: {e}"),
                })
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> KvFuture<'a, ()> {
        Box::pin(async move {
            match tokio::fs::remove_file(self.path_for(key)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn location(&self, key: &str) -> String {
        self.path_for(key).display().to_string()
    }
}

pub fn write_file_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
    let tmp = path.with_file_name(tmp_name);
    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    f.write_all(data)?;
    f.sync_all()?;
    drop(f);

    std::fs::rename(&tmp, path)?;

    // Best-effort directory sync (ignored on platforms where it isn't supported).
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }

    Ok(())
}

/// All keys in one SQLite table.
#[derive(Debug, Clone)]
pub struct SqliteKvStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteKvStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = open_state_db(path).await?;
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }
}

impl KvStore for SqliteKvStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn get<'a>(&'a self, key: &'a str) -> KvFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT value FROM kv_records WHERE key = ? LIMIT 1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
        })
    }

    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> KvFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO kv_records (key, value, updated_at)
                VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%fZ','now'))
                "#,
            )
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Persistence {
                message: format!("write {key} failed: {e}"),
            })?;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> KvFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query("DELETE FROM kv_records WHERE key = ?")
                .bind(key)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    fn location(&self, key: &str) -> String {
        format!("{}#{key}", self.path.display())
    }
}

pub async fn open_state_db(path: &Path) -> Result<SqlitePool> {
    debug!(
        event = "sqlite.open",
        db_path = %path.display(),
        create_if_missing = true,
        "sqlite.open"
    );
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete)
        .synchronous(SqliteSynchronous::Full);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| {
            error!(
                event = "io.sqlite.connect_failed",
                db_path = %path.display(),
                error = %e,
                "io.sqlite.connect_failed"
            );
            e
        })?;

    sqlx::migrate!().run(&pool).await.map_err(|e| {
        error!(
            event = "io.sqlite.migrate_failed",
            db_path = %path.display(),
            error = %e,
            "io.sqlite.migrate_failed"
        );
        e
    })?;
    Ok(pool)
}
