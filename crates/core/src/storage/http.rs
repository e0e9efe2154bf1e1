use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use super::{BucketOptions, ListEntry, ObjectStore, StoreFuture, UploadOptions};
use crate::{Error, Result};

const LIST_PAGE_SIZE: usize = 1000;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
// Applies per read, so long streamed downloads are fine as long as bytes keep flowing.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

// Keep unreserved characters readable in object URLs.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Clone)]
pub struct HttpObjectStoreConfig {
    /// Project base url, e.g. `https://abc.example.co`. The storage API is
    /// served under `/storage/v1`.
    pub base_url: String,
    pub service_key: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl HttpObjectStoreConfig {
    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            service_key: service_key.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Client for a storage REST API with signed-url downloads and upsert
/// uploads.
pub struct HttpObjectStore {
    config: HttpObjectStoreConfig,
    client: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(config: HttpObjectStoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()
            .map_err(|e| Error::InvalidConfig {
                message: format!("http client build failed: {e}"),
            })?;
        Ok(Self { config, client })
    }

    fn api_url(&self, suffix: &str) -> String {
        format!(
            "{}/storage/v1{}",
            self.config.base_url.trim_end_matches('/'),
            suffix
        )
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(&self.config.service_key)
            .header("apikey", &self.config.service_key)
    }

    async fn list_page(
        &self,
        bucket: &str,
        folder: &str,
        offset: usize,
    ) -> Result<Vec<ApiListEntry>> {
        let url = self.api_url(&format!("/object/list/{}", encode_segment(bucket)));
        let body = serde_json::json!({
            "prefix": folder,
            "limit": LIST_PAGE_SIZE,
            "offset": offset,
            "sortBy": { "column": "name", "order": "asc" },
        });
        let res = self
            .authorized(self.client.post(url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Listing {
                bucket: bucket.to_string(),
                folder: folder.to_string(),
                message: format!("request failed: {e}"),
            })?;

        let status = res.status();
        let text = res.text().await.map_err(|e| Error::Listing {
            bucket: bucket.to_string(),
            folder: folder.to_string(),
            message: format!("read response failed: {e}"),
        })?;
        if !status.is_success() {
            return Err(Error::Listing {
                bucket: bucket.to_string(),
                folder: folder.to_string(),
                message: format!("http {status}: {text}"),
            });
        }

        serde_json::from_str(&text).map_err(|e| Error::Listing {
            bucket: bucket.to_string(),
            folder: folder.to_string(),
            message: format!("invalid json: {e}; body={text}"),
        })
    }
}

impl ObjectStore for HttpObjectStore {
    fn provider(&self) -> &str {
        "storage.http"
    }

    fn list_buckets(&self) -> StoreFuture<'_, Vec<String>> {
        Box::pin(async move {
            let res = self
                .authorized(self.client.get(self.api_url("/bucket")))
                .send()
                .await
                .map_err(|e| Error::Transport {
                    message: format!("list buckets request failed: {e}"),
                })?;
            let status = res.status();
            let text = res.text().await.map_err(|e| Error::Transport {
                message: format!("list buckets read response failed: {e}"),
            })?;
            if !status.is_success() {
                return Err(Error::BackendRejected {
                    message: format!("list buckets http {status}: {text}"),
                });
            }
            let buckets: Vec<ApiBucket> = serde_json::from_str(&text)?;
            Ok(buckets.into_iter().map(|b| b.name).collect())
        })
    }

    fn list_entries<'a>(
        &'a self,
        bucket: &'a str,
        folder: &'a str,
    ) -> StoreFuture<'a, Vec<ListEntry>> {
        Box::pin(async move {
            let mut out = Vec::new();
            let mut offset = 0usize;
            loop {
                let page = self.list_page(bucket, folder, offset).await?;
                let page_len = page.len();
                out.extend(page.into_iter().map(ApiListEntry::into_entry));
                if page_len < LIST_PAGE_SIZE {
                    break;
                }
                offset += page_len;
            }
            debug!(
                event = "storage.list",
                provider = self.provider(),
                bucket,
                folder,
                entries = out.len() as u64,
                "storage.list"
            );
            Ok(out)
        })
    }

    fn signed_download_url<'a>(
        &'a self,
        bucket: &'a str,
        path: &'a str,
        ttl: Duration,
    ) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let url = self.api_url(&format!(
                "/object/sign/{}/{}",
                encode_segment(bucket),
                encode_object_path(path)
            ));
            let res = self
                .authorized(self.client.post(url))
                .json(&serde_json::json!({ "expiresIn": ttl.as_secs() }))
                .send()
                .await
                .map_err(|e| Error::Transport {
                    message: format!("sign request failed: {e}"),
                })?;

            let status = res.status();
            let text = res.text().await.map_err(|e| Error::Transport {
                message: format!("sign read response failed: {e}"),
            })?;
            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !status.is_success() {
                return Err(Error::Transport {
                    message: format!("sign http {status}: {text}"),
                });
            }

            let signed: ApiSignedUrl = serde_json::from_str(&text).map_err(|e| Error::Transport {
                message: format!("sign invalid json: {e}; body={text}"),
            })?;
            Ok(signed
                .signed_url
                .filter(|s| !s.is_empty())
                .map(|s| absolutize_signed_url(&self.api_url(""), &s)))
        })
    }

    fn stream_download<'a>(&'a self, url: &'a str, destination: &'a Path) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut res = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| Error::Transport {
                    message: format!("download request failed: {e}"),
                })?;
            let status = res.status();
            if !status.is_success() {
                return Err(Error::Transport {
                    message: format!("download http {status}"),
                });
            }

            let mut file = tokio::fs::File::create(destination).await?;
            let mut written = 0u64;
            while let Some(chunk) = res.chunk().await.map_err(|e| Error::Transport {
                message: format!("download read failed: {e}"),
            })? {
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(written)
        })
    }

    fn create_bucket_if_absent<'a>(
        &'a self,
        bucket: &'a str,
        options: BucketOptions,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let res = self
                .authorized(self.client.post(self.api_url("/bucket")))
                .json(&serde_json::json!({
                    "id": bucket,
                    "name": bucket,
                    "public": options.public,
                }))
                .send()
                .await
                .map_err(|e| Error::Transport {
                    message: format!("create bucket request failed: {e}"),
                })?;

            let status = res.status();
            let text = res.text().await.map_err(|e| Error::Transport {
                message: format!("create bucket read response failed: {e}"),
            })?;
            if status.is_success() {
                return Ok(());
            }
            if status == StatusCode::CONFLICT || is_already_exists(&text) {
                return Err(Error::BucketExists {
                    bucket: bucket.to_string(),
                });
            }
            error!(
                event = "io.storage.create_bucket_failed",
                provider = self.provider(),
                bucket,
                status = status.as_u16(),
                "io.storage.create_bucket_failed"
            );
            Err(Error::BackendRejected {
                message: format!("create bucket http {status}: {text}"),
            })
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
            let url = self.api_url(&format!(
                "/object/{}/{}",
                encode_segment(bucket),
                encode_object_path(path)
            ));
            let res = self
                .authorized(self.client.post(url))
                .header("x-upsert", if options.upsert { "true" } else { "false" })
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(bytes)
                .send()
                .await
                .map_err(|e| Error::Transport {
                    message: format!("upload request failed: {e}"),
                })?;

            let status = res.status();
            if status.is_success() {
                return Ok(());
            }
            let text = res.text().await.unwrap_or_default();
            Err(Error::BackendRejected {
                message: format!("upload http {status}: {text}"),
            })
        })
    }
}

fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, PATH_SEGMENT).to_string()
}

fn encode_object_path(path: &str) -> String {
    path.split('/')
        .map(encode_segment)
        .collect::<Vec<_>>()
        .join("/")
}

fn absolutize_signed_url(api_base: &str, signed: &str) -> String {
    if signed.starts_with("http://") || signed.starts_with("https://") {
        return signed.to_string();
    }
    format!("{api_base}/{}", signed.trim_start_matches('/'))
}

fn is_already_exists(body: &str) -> bool {
    body.to_ascii_lowercase().contains("already exists")
}

#[derive(Debug, Deserialize)]
struct ApiBucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiSignedUrl {
    #[serde(rename = "signedURL", alias = "signedUrl")]
    signed_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiListEntry {
    name: String,
    // Folder placeholders come back without an object id.
    id: Option<String>,
    updated_at: Option<DateTime<Utc>>,
    metadata: Option<ApiObjectMetadata>,
}

#[derive(Debug, Deserialize)]
struct ApiObjectMetadata {
    size: Option<u64>,
    #[serde(rename = "lastModified")]
    last_modified: Option<DateTime<Utc>>,
}

impl ApiListEntry {
    fn into_entry(self) -> ListEntry {
        let (size_bytes, meta_modified) = match self.metadata {
            Some(m) => (m.size.unwrap_or(0), m.last_modified),
            None => (0, None),
        };
        ListEntry {
            name: self.name,
            is_folder: self.id.is_none(),
            size_bytes,
            last_modified: meta_modified.or(self.updated_at),
        }
    }
}
