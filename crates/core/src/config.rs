use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::kv::write_file_atomic;
use crate::retry::RetryPolicy;
use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub source: Endpoint,
    #[serde(default = "Endpoint::default_destination")]
    pub destination: Endpoint,
    #[serde(default)]
    pub migration: Migration,
    #[serde(default)]
    pub state: StateSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    /// Base url of the storage service.
    #[serde(default)]
    pub url: String,
    /// Name of the environment variable holding the service key.
    pub key_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Migration {
    /// Buckets to migrate; empty means every bucket of the source.
    pub buckets: Vec<String>,
    pub download_concurrency: u32,
    pub upload_concurrency: u32,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub batch_pause_ms: u64,
    pub download_checkpoint_every: u32,
    pub upload_checkpoint_every: u32,
    pub signed_url_ttl_secs: u64,
    pub public_buckets: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    #[default]
    Json,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StateSettings {
    #[serde(default)]
    pub backend: StateBackend,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            url: String::new(),
            key_env: "BUCKETMIGRATE_SOURCE_KEY".to_string(),
        }
    }
}

impl Endpoint {
    fn default_destination() -> Self {
        Self {
            url: String::new(),
            key_env: "BUCKETMIGRATE_DESTINATION_KEY".to_string(),
        }
    }
}

impl Default for Migration {
    fn default() -> Self {
        Self {
            buckets: Vec::new(),
            download_concurrency: 5,
            upload_concurrency: 3,
            max_attempts: 3,
            retry_base_delay_ms: 1000,
            batch_pause_ms: 500,
            download_checkpoint_every: 10,
            upload_checkpoint_every: 5,
            signed_url_ttl_secs: 3600,
            public_buckets: false,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            source: Endpoint::default(),
            destination: Endpoint::default_destination(),
            migration: Migration::default(),
            state: StateSettings::default(),
        }
    }
}

/// Runtime knobs of one migration, derived from [`Settings`].
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub staging_dir: PathBuf,
    pub buckets: Vec<String>,
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
    pub retry: RetryPolicy,
    pub batch_pause: Duration,
    pub download_checkpoint_every: usize,
    pub upload_checkpoint_every: usize,
    pub signed_url_ttl: Duration,
    pub public_buckets: bool,
}

impl MigrationConfig {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Settings::default().migration_config(staging_dir)
    }

    pub fn validate(&self) -> Result<()> {
        if self.download_concurrency == 0 || self.upload_concurrency == 0 {
            return Err(Error::InvalidConfig {
                message: "concurrency must be >= 1".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidConfig {
                message: "max_attempts must be >= 1".to_string(),
            });
        }
        if self.download_checkpoint_every == 0 || self.upload_checkpoint_every == 0 {
            return Err(Error::InvalidConfig {
                message: "checkpoint intervals must be >= 1".to_string(),
            });
        }
        if self.signed_url_ttl.is_zero() {
            return Err(Error::InvalidConfig {
                message: "signed_url_ttl must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

impl Settings {
    pub fn migration_config(&self, staging_dir: impl Into<PathBuf>) -> MigrationConfig {
        let m = &self.migration;
        MigrationConfig {
            staging_dir: staging_dir.into(),
            buckets: m.buckets.clone(),
            download_concurrency: m.download_concurrency as usize,
            upload_concurrency: m.upload_concurrency as usize,
            retry: RetryPolicy::new(m.max_attempts, Duration::from_millis(m.retry_base_delay_ms)),
            batch_pause: Duration::from_millis(m.batch_pause_ms),
            download_checkpoint_every: m.download_checkpoint_every as usize,
            upload_checkpoint_every: m.upload_checkpoint_every as usize,
            signed_url_ttl: Duration::from_secs(m.signed_url_ttl_secs),
            public_buckets: m.public_buckets,
        }
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    let settings = parse_settings(&text)?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn parse_settings(text: &str) -> Result<Settings> {
    let raw: toml::Value = toml::from_str(text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(SETTINGS_SCHEMA_VERSION) | None => {
            let mut s: Settings = if version.is_some() {
                toml::from_str::<Settings>(text)
            } else {
                // Unversioned files are accepted as the current schema.
                toml::from_str::<Settings>(&format!("version = {SETTINGS_SCHEMA_VERSION}\n{text}"))
            }
            .map_err(|e| Error::InvalidConfig {
                message: format!("config invalid: {e}"),
            })?;
            normalize_settings(&mut s);
            Ok(s)
        }
        Some(other) => Err(Error::InvalidConfig {
            message: format!(
                "unsupported settings schema version: {other} (expected {SETTINGS_SCHEMA_VERSION})"
            ),
        }),
    }
}

fn normalize_settings(settings: &mut Settings) {
    settings.source.url = settings.source.url.trim().trim_end_matches('/').to_string();
    settings.destination.url = settings
        .destination
        .url
        .trim()
        .trim_end_matches('/')
        .to_string();
    settings.migration.buckets = settings
        .migration
        .buckets
        .iter()
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty())
        .collect();
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    validate_settings(settings)?;

    let text = toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })?;
    write_file_atomic(&config_path(config_dir), text.as_bytes()).map_err(|e| {
        Error::InvalidConfig {
            message: format!("config write failed: {e}"),
        }
    })
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "settings.version must be {SETTINGS_SCHEMA_VERSION} (got {})",
                settings.version
            ),
        });
    }

    for (name, ep) in [
        ("source", &settings.source),
        ("destination", &settings.destination),
    ] {
        if ep.key_env.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: format!("{name}.key_env must not be empty"),
            });
        }
        if !ep.url.is_empty() && !(ep.url.starts_with("http://") || ep.url.starts_with("https://"))
        {
            return Err(Error::InvalidConfig {
                message: format!("{name}.url must start with http:// or https://"),
            });
        }
    }

    let mut seen = std::collections::HashSet::new();
    for bucket in &settings.migration.buckets {
        if !seen.insert(bucket.as_str()) {
            return Err(Error::InvalidConfig {
                message: format!("duplicate migration.buckets entry: {bucket}"),
            });
        }
    }

    settings.migration_config(PathBuf::new()).validate()
}
