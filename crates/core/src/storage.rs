use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{Error, Result};

mod http;

pub use http::{HttpObjectStore, HttpObjectStoreConfig};

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// One entry of a folder listing. `name` is relative to the listed folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub name: String,
    pub is_folder: bool,
    pub size_bytes: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

impl ListEntry {
    pub fn folder(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_folder: true,
            size_bytes: 0,
            last_modified: None,
        }
    }

    pub fn object(name: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            name: name.into(),
            is_folder: false,
            size_bytes,
            last_modified: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BucketOptions {
    pub public: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct UploadOptions {
    pub upsert: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self { upsert: true }
    }
}

/// Capability surface of a storage backend, used both as migration source
/// and destination.
///
/// `create_bucket_if_absent` reports an existing bucket as
/// [`Error::BucketExists`]; callers decide whether that is fatal.
pub trait ObjectStore: Send + Sync {
    fn provider(&self) -> &str;

    fn list_buckets(&self) -> StoreFuture<'_, Vec<String>>;

    fn list_entries<'a>(&'a self, bucket: &'a str, folder: &'a str)
    -> StoreFuture<'a, Vec<ListEntry>>;

    fn signed_download_url<'a>(
        &'a self,
        bucket: &'a str,
        path: &'a str,
        ttl: Duration,
    ) -> StoreFuture<'a, Option<String>>;

    /// Streams the payload behind `url` into `destination`, returning the
    /// number of bytes written.
    fn stream_download<'a>(&'a self, url: &'a str, destination: &'a Path) -> StoreFuture<'a, u64>;

    fn create_bucket_if_absent<'a>(
        &'a self,
        bucket: &'a str,
        options: BucketOptions,
    ) -> StoreFuture<'a, ()>;

    fn upload_object<'a>(
        &'a self,
        bucket: &'a str,
        path: &'a str,
        bytes: Vec<u8>,
        options: UploadOptions,
    ) -> StoreFuture<'a, ()>;
}

const MEM_URL_SCHEME: &str = "mem://";

/// Process-local backend. Every trait call counts as one remote operation.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    pub operations: AtomicUsize,
    pub downloads: AtomicUsize,
    pub uploads: AtomicUsize,
    buckets: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(mut self, bucket: &str) -> Self {
        self.buckets.get_mut().entry(bucket.to_string()).or_default();
        self
    }

    pub fn with_object(mut self, bucket: &str, path: &str, bytes: &[u8]) -> Self {
        self.buckets
            .get_mut()
            .entry(bucket.to_string())
            .or_default()
            .insert(path.to_string(), bytes.to_vec());
        self
    }

    pub async fn get(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        self.buckets
            .lock()
            .await
            .get(bucket)
            .and_then(|objects| objects.get(path))
            .cloned()
    }

    pub async fn has_bucket(&self, bucket: &str) -> bool {
        self.buckets.lock().await.contains_key(bucket)
    }

    pub async fn object_count(&self) -> usize {
        self.buckets.lock().await.values().map(|o| o.len()).sum()
    }

    pub fn operation_count(&self) -> usize {
        self.operations.load(Ordering::Relaxed)
    }

    fn count_op(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
    }
}

impl ObjectStore for InMemoryStorage {
    fn provider(&self) -> &str {
        "test.mem"
    }

    fn list_buckets(&self) -> StoreFuture<'_, Vec<String>> {
        Box::pin(async move {
            self.count_op();
            Ok(self.buckets.lock().await.keys().cloned().collect())
        })
    }

    fn list_entries<'a>(
        &'a self,
        bucket: &'a str,
        folder: &'a str,
    ) -> StoreFuture<'a, Vec<ListEntry>> {
        Box::pin(async move {
            self.count_op();
            let guard = self.buckets.lock().await;
            let objects = guard.get(bucket).ok_or_else(|| Error::Listing {
                bucket: bucket.to_string(),
                folder: folder.to_string(),
                message: "bucket not found".to_string(),
            })?;

            let prefix = if folder.is_empty() {
                String::new()
            } else {
                format!("{}/", folder.trim_end_matches('/'))
            };

            let mut folders = Vec::<String>::new();
            let mut entries = Vec::new();
            for (key, bytes) in objects.range(prefix.clone()..) {
                let Some(rest) = key.strip_prefix(&prefix) else {
                    break;
                };
                match rest.split_once('/') {
                    Some((dir, _)) => {
                        if folders.last().map(String::as_str) != Some(dir) {
                            folders.push(dir.to_string());
                        }
                    }
                    None => entries.push(ListEntry::object(rest, bytes.len() as u64)),
                }
            }

            let mut out: Vec<ListEntry> = folders.into_iter().map(ListEntry::folder).collect();
            out.extend(entries);
            Ok(out)
        })
    }

    fn signed_download_url<'a>(
        &'a self,
        bucket: &'a str,
        path: &'a str,
        _ttl: Duration,
    ) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            self.count_op();
            let exists = self
                .buckets
                .lock()
                .await
                .get(bucket)
                .is_some_and(|objects| objects.contains_key(path));
            Ok(exists.then(|| format!("{MEM_URL_SCHEME}{bucket}/{path}")))
        })
    }

    fn stream_download<'a>(&'a self, url: &'a str, destination: &'a Path) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            self.count_op();
            let (bucket, path) = url
                .strip_prefix(MEM_URL_SCHEME)
                .and_then(|rest| rest.split_once('/'))
                .ok_or_else(|| Error::Transport {
                    message: format!("unsupported url: {url}"),
                })?;
            let bytes = self.get(bucket, path).await.ok_or_else(|| Error::Transport {
                message: format!("http 404: {url}"),
            })?;
            tokio::fs::write(destination, &bytes).await?;
            self.downloads.fetch_add(1, Ordering::Relaxed);
            Ok(bytes.len() as u64)
        })
    }

    fn create_bucket_if_absent<'a>(
        &'a self,
        bucket: &'a str,
        _options: BucketOptions,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.count_op();
            let mut guard = self.buckets.lock().await;
            if guard.contains_key(bucket) {
                return Err(Error::BucketExists {
                    bucket: bucket.to_string(),
                });
            }
            guard.insert(bucket.to_string(), BTreeMap::new());
            Ok(())
        })
    }

    fn upload_object<'a>(
        &'a self,
        bucket: &'a str,
        path: &'a str,
        bytes: Vec<u8>,
        options: UploadOptions,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.count_op();
            let mut guard = self.buckets.lock().await;
            let objects = guard.get_mut(bucket).ok_or_else(|| Error::BackendRejected {
                message: format!("bucket not found: {bucket}"),
            })?;
            if !options.upsert && objects.contains_key(path) {
                return Err(Error::BackendRejected {
                    message: format!("object already exists: {bucket}/{path}"),
                });
            }
            objects.insert(path.to_string(), bytes);
            self.uploads.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }
}
