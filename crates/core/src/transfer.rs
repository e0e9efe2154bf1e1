use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::state::TransferItem;
use crate::storage::{BucketOptions, ObjectStore, UploadOptions};
use crate::{Error, Result};

/// Local staging area: `<root>/<bucket>/<object path>`.
#[derive(Debug, Clone)]
pub struct Staging {
    root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReceipt {
    pub staging_path: PathBuf,
    pub bytes: u64,
}

impl Staging {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bucket_dir(&self, bucket: &str) -> Result<PathBuf> {
        Ok(self.root.join(checked_relative(bucket)?))
    }

    pub fn path_for(&self, bucket: &str, path: &str) -> Result<PathBuf> {
        Ok(self.bucket_dir(bucket)?.join(checked_relative(path)?))
    }
}

/// Object names come from a remote listing; refuse anything that would
/// resolve outside the staging directory.
fn checked_relative(name: &str) -> Result<PathBuf> {
    let invalid = || Error::InvalidObjectPath {
        path: name.to_string(),
    };
    if name.is_empty()
        || name
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(invalid());
    }
    let rel = PathBuf::from(name);
    if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(invalid());
    }
    Ok(rel)
}

/// Unique per attempt, so it never names another object's staged file.
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".part-{}", uuid::Uuid::new_v4().simple()));
    path.with_file_name(name)
}

/// Fetches one object into staging through a signed url. Single attempt;
/// callers wrap it in a retry policy.
pub async fn download_one(
    source: &dyn ObjectStore,
    staging: &Staging,
    item: &TransferItem,
    url_ttl: Duration,
) -> Result<DownloadReceipt> {
    tokio::fs::create_dir_all(staging.bucket_dir(&item.bucket)?).await?;
    let staging_path = staging.path_for(&item.bucket, &item.path)?;

    let url = source
        .signed_download_url(&item.bucket, &item.path, url_ttl)
        .await?
        .ok_or_else(|| Error::NoSignedUrl {
            bucket: item.bucket.clone(),
            path: item.path.clone(),
        })?;

    if let Some(parent) = staging_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let part = partial_path(&staging_path);
    let bytes = match source.stream_download(&url, &part).await {
        Ok(n) => n,
        Err(e) => {
            let _ = tokio::fs::remove_file(&part).await;
            error!(
                event = "io.storage.download_failed",
                provider = source.provider(),
                bucket = %item.bucket,
                path = %item.path,
                ordinal = item.ordinal,
                error = %e,
                "io.storage.download_failed"
            );
            return Err(e);
        }
    };
    tokio::fs::rename(&part, &staging_path).await?;

    debug!(
        event = "transfer.downloaded",
        bucket = %item.bucket,
        path = %item.path,
        ordinal = item.ordinal,
        bytes,
        "transfer.downloaded"
    );
    Ok(DownloadReceipt {
        staging_path,
        bytes,
    })
}

/// Pushes one staged object to the destination with upsert semantics.
/// Returns the number of bytes sent.
pub async fn upload_one(
    destination: &dyn ObjectStore,
    staging: &Staging,
    item: &TransferItem,
) -> Result<u64> {
    let staging_path = staging.path_for(&item.bucket, &item.path)?;
    let bytes = match tokio::fs::read(&staging_path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::StagingFileMissing { path: staging_path });
        }
        Err(e) => return Err(e.into()),
    };
    let len = bytes.len() as u64;

    destination
        .upload_object(
            &item.bucket,
            &item.path,
            bytes,
            UploadOptions { upsert: true },
        )
        .await
        .map_err(|e| {
            error!(
                event = "io.storage.upload_failed",
                provider = destination.provider(),
                bucket = %item.bucket,
                path = %item.path,
                ordinal = item.ordinal,
                blob_bytes = len,
                error = %e,
                "io.storage.upload_failed"
            );
            e
        })?;

    debug!(
        event = "transfer.uploaded",
        bucket = %item.bucket,
        path = %item.path,
        ordinal = item.ordinal,
        bytes = len,
        "transfer.uploaded"
    );
    Ok(len)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketReport {
    pub created: Vec<String>,
    pub existing: Vec<String>,
}

/// Creates every distinct bucket of `items` on the destination. A bucket
/// that already exists counts as success; any other failure aborts.
pub async fn ensure_buckets<'a>(
    destination: &dyn ObjectStore,
    items: impl IntoIterator<Item = &'a TransferItem>,
    options: BucketOptions,
) -> Result<BucketReport> {
    let buckets: BTreeSet<&str> = items.into_iter().map(|i| i.bucket.as_str()).collect();
    let mut report = BucketReport::default();
    for bucket in buckets {
        match destination.create_bucket_if_absent(bucket, options).await {
            Ok(()) => {
                info!(event = "bucket.created", bucket, public = options.public, "bucket.created");
                report.created.push(bucket.to_string());
            }
            Err(Error::BucketExists { .. }) => {
                debug!(event = "bucket.exists", bucket, "bucket.exists");
                report.existing.push(bucket.to_string());
            }
            Err(e) => {
                error!(
                    event = "io.storage.create_bucket_failed",
                    provider = destination.provider(),
                    bucket,
                    error = %e,
                    "io.storage.create_bucket_failed"
                );
                return Err(e);
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    fn item(bucket: &str, path: &str) -> TransferItem {
        TransferItem::new(bucket, path, 0, None)
    }

    #[test]
    fn staging_path_is_deterministic() {
        let staging = Staging::new("/tmp/stage");
        assert_eq!(
            staging.path_for("b", "x/a.txt").unwrap(),
            PathBuf::from("/tmp/stage/b/x/a.txt")
        );
    }

    #[test]
    fn rejects_paths_escaping_staging() {
        let staging = Staging::new("/tmp/stage");
        for bad in ["../etc/passwd", "/abs", "x//y", "a/./b", "", "x/.."] {
            assert!(
                matches!(
                    staging.path_for("b", bad),
                    Err(Error::InvalidObjectPath { .. })
                ),
                "accepted {bad:?}"
            );
        }
        assert!(staging.path_for("..", "a").is_err());
    }

    #[tokio::test]
    async fn download_writes_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let staging = Staging::new(dir.path());
        let source = InMemoryStorage::new().with_object("b", "x/a.txt", b"0123456789");

        let receipt = download_one(
            &source,
            &staging,
            &item("b", "x/a.txt"),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        assert_eq!(receipt.bytes, 10);
        assert_eq!(receipt.staging_path, dir.path().join("b/x/a.txt"));
        assert_eq!(std::fs::read(&receipt.staging_path).unwrap(), b"0123456789");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("b/x"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("a.txt")]);
    }

    #[tokio::test]
    async fn sibling_named_like_a_temp_file_survives() {
        let dir = tempfile::tempdir().unwrap();
        let staging = Staging::new(dir.path());
        let source = InMemoryStorage::new()
            .with_object("b", "a", b"AAAA")
            .with_object("b", "a.part", b"PART");
        let ttl = Duration::from_secs(60);

        download_one(&source, &staging, &item("b", "a.part"), ttl)
            .await
            .unwrap();
        download_one(&source, &staging, &item("b", "a"), ttl)
            .await
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("b/a")).unwrap(), b"AAAA");
        assert_eq!(std::fs::read(dir.path().join("b/a.part")).unwrap(), b"PART");

        // Same again with both transfers in flight together.
        let item_a = item("b", "a");
        let item_part = item("b", "a.part");
        let (a, part) = tokio::join!(
            download_one(&source, &staging, &item_a, ttl),
            download_one(&source, &staging, &item_part, ttl),
        );
        a.unwrap();
        part.unwrap();
        assert_eq!(std::fs::read(dir.path().join("b/a")).unwrap(), b"AAAA");
        assert_eq!(std::fs::read(dir.path().join("b/a.part")).unwrap(), b"PART");
    }

    #[tokio::test]
    async fn download_without_signed_url_fails() {
        let dir = tempfile::tempdir().unwrap();
        let staging = Staging::new(dir.path());
        let source = InMemoryStorage::new().with_bucket("b");

        let err = download_one(&source, &staging, &item("b", "gone.txt"), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoSignedUrl { .. }));
        // The bucket staging directory is still prepared.
        assert!(dir.path().join("b").is_dir());
    }

    #[tokio::test]
    async fn upload_requires_staged_file() {
        let dir = tempfile::tempdir().unwrap();
        let staging = Staging::new(dir.path());
        let dest = InMemoryStorage::new().with_bucket("b");

        let err = upload_one(&dest, &staging, &item("b", "c.txt")).await.unwrap_err();
        assert!(matches!(err, Error::StagingFileMissing { .. }));

        std::fs::create_dir_all(dir.path().join("b")).unwrap();
        std::fs::write(dir.path().join("b/c.txt"), b"hello").unwrap();
        assert_eq!(upload_one(&dest, &staging, &item("b", "c.txt")).await.unwrap(), 5);
        assert_eq!(dest.get("b", "c.txt").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn existing_bucket_counts_as_success() {
        let dest = InMemoryStorage::new().with_bucket("b");
        let items = vec![item("b", "1"), item("c", "2"), item("b", "3")];
        let report = ensure_buckets(&dest, &items, BucketOptions::default())
            .await
            .unwrap();
        assert_eq!(report.created, vec!["c".to_string()]);
        assert_eq!(report.existing, vec!["b".to_string()]);
    }
}
