use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bucket_migrate_core::{
    BucketOptions, InMemoryStorage, JsonFileKvStore, ListEntry, MigrationConfig, Migrator,
    ObjectStore, ProgressStore, RetryPolicy, RunMode, RunOptions, StoreFuture, UploadOptions,
};
use tempfile::TempDir;
use tokio::sync::Mutex;

/// Delegates to an in-memory backend but holds every transfer for `delay`,
/// recording how many were in flight at once.
struct TimedStorage {
    inner: InMemoryStorage,
    delay: Duration,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
    starts: Mutex<Vec<Instant>>,
}

impl TimedStorage {
    fn new(inner: InMemoryStorage, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            starts: Mutex::new(Vec::new()),
        }
    }

    fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::Relaxed)
    }

    async fn start_times(&self) -> Vec<Instant> {
        self.starts.lock().await.clone()
    }

    async fn enter(&self) {
        let current = self.concurrent.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_concurrent.fetch_max(current, Ordering::Relaxed);
        self.starts.lock().await.push(Instant::now());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    fn leave(&self) {
        self.concurrent.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ObjectStore for TimedStorage {
    fn provider(&self) -> &str {
        "test.timed"
    }

    fn list_buckets(&self) -> StoreFuture<'_, Vec<String>> {
        self.inner.list_buckets()
    }

    fn list_entries<'a>(
        &'a self,
        bucket: &'a str,
        folder: &'a str,
    ) -> StoreFuture<'a, Vec<ListEntry>> {
        self.inner.list_entries(bucket, folder)
    }

    fn signed_download_url<'a>(
        &'a self,
        bucket: &'a str,
        path: &'a str,
        ttl: Duration,
    ) -> StoreFuture<'a, Option<String>> {
        self.inner.signed_download_url(bucket, path, ttl)
    }

    fn stream_download<'a>(&'a self, url: &'a str, destination: &'a Path) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            self.enter().await;
            let res = self.inner.stream_download(url, destination).await;
            self.leave();
            res
        })
    }

    fn create_bucket_if_absent<'a>(
        &'a self,
        bucket: &'a str,
        options: BucketOptions,
    ) -> StoreFuture<'a, ()> {
        self.inner.create_bucket_if_absent(bucket, options)
    }

    fn upload_object<'a>(
        &'a self,
        bucket: &'a str,
        path: &'a str,
        bytes: Vec<u8>,
        options: UploadOptions,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.enter().await;
            let res = self.inner.upload_object(bucket, path, bytes, options).await;
            self.leave();
            res
        })
    }
}

fn source_objects(n: usize) -> InMemoryStorage {
    let mut storage = InMemoryStorage::new();
    for i in 0..n {
        storage = storage.with_object("assets", &format!("dir{}/obj{i:02}.bin", i % 3), &[i as u8; 64]);
    }
    storage
}

fn config(temp: &TempDir) -> MigrationConfig {
    let mut config = MigrationConfig::new(temp.path().join("staging"));
    config.batch_pause = Duration::ZERO;
    config.retry = RetryPolicy::new(1, Duration::from_millis(1));
    config
}

fn progress_store(temp: &TempDir) -> ProgressStore {
    ProgressStore::new(Box::new(JsonFileKvStore::new(temp.path().join("state"))))
}

#[tokio::test]
async fn transfers_respect_configured_concurrency() {
    let temp = TempDir::new().unwrap();
    let source = Arc::new(TimedStorage::new(source_objects(10), Duration::from_millis(30)));
    let destination = Arc::new(TimedStorage::new(InMemoryStorage::new(), Duration::from_millis(30)));

    let mut config = config(&temp);
    config.download_concurrency = 3;
    config.upload_concurrency = 2;

    let report = Migrator::new(
        config,
        source.clone(),
        destination.clone(),
        progress_store(&temp),
    )
    .run(RunMode::Migrate, RunOptions::default())
    .await
    .unwrap();

    assert_eq!(report.uploaded, 10);
    assert_eq!(source.max_concurrent(), 3);
    assert_eq!(destination.max_concurrent(), 2);
    assert_eq!(destination.inner.object_count().await, 10);
}

#[tokio::test]
async fn next_chunk_waits_for_pause() {
    let temp = TempDir::new().unwrap();
    let source = Arc::new(TimedStorage::new(source_objects(3), Duration::ZERO));
    let destination = Arc::new(TimedStorage::new(InMemoryStorage::new(), Duration::ZERO));

    let mut config = config(&temp);
    config.upload_concurrency = 1;
    config.batch_pause = Duration::from_millis(50);

    Migrator::new(
        config,
        source.clone(),
        destination.clone(),
        progress_store(&temp),
    )
    .run(RunMode::Migrate, RunOptions::default())
    .await
    .unwrap();

    let starts = destination.start_times().await;
    assert_eq!(starts.len(), 3);
    for window in starts.windows(2) {
        let delta = window[1].duration_since(window[0]);
        assert!(delta >= Duration::from_millis(40), "delta={delta:?}");
    }
}
