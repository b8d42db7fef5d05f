// ABOUTME: Run configuration for fetch and verify, loadable from a TOML file
// ABOUTME: CLI flags are applied on top of the file values before validation

use crate::error::MoltError;
use crate::fetch::blobstore::gcs::GcsSettings;
use crate::fetch::blobstore::s3::S3Settings;
use crate::utils::matches_file_convention;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Contents of a `--config` file. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub fetch: FetchConfig,
    pub verify: VerifyConfig,
}

impl FileConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// Schema and table regexes; both default to everything.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FilterConfig {
    pub schema: String,
    pub table: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            schema: ".*".to_string(),
            table: ".*".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    None,
    #[default]
    Gzip,
}

/// Where chunks are staged.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    S3(S3Settings),
    Gcs(GcsSettings),
    Local {
        path: String,
        listen_addr: Option<String>,
        access_addr: Option<String>,
    },
    /// Skip staging and COPY straight into the target.
    Direct,
}

impl StoreConfig {
    /// Parse `s3://bucket/prefix` or `gs://bucket/prefix`.
    pub fn from_bucket_path(bucket_path: &str) -> Result<Self, MoltError> {
        let (scheme, rest) = bucket_path.split_once("://").ok_or_else(|| {
            MoltError::Config(format!(
                "bucket path {} must start with s3:// or gs://",
                bucket_path
            ))
        })?;
        let (bucket, path) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(MoltError::Config(format!(
                "bucket path {} has no bucket name",
                bucket_path
            )));
        }
        let path = path.trim_matches('/').to_string();
        match scheme {
            "s3" => Ok(StoreConfig::S3(S3Settings {
                bucket: bucket.to_string(),
                path,
                ..Default::default()
            })),
            "gs" => Ok(StoreConfig::Gcs(GcsSettings {
                bucket: bucket.to_string(),
                path,
                ..Default::default()
            })),
            other => Err(MoltError::Config(format!(
                "unsupported bucket scheme {}://",
                other
            ))),
        }
    }
}

/// Which tables to resume and from where.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContinuationConfig {
    /// Resume the run with this id; only tables with a logged failure are loaded.
    pub fetch_id: Option<String>,
    /// Resume a single table from this token.
    pub token: Option<String>,
    /// Override the file a token resumes from.
    pub file_name: Option<String>,
}

impl ContinuationConfig {
    pub fn fetch_id(&self) -> Option<&str> {
        self.fetch_id.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref().filter(|s| !s.is_empty())
    }

    /// A resumed run loads from staged files instead of exporting.
    pub fn is_resume(&self) -> bool {
        self.fetch_id().is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Tables loaded at once.
    pub concurrency: usize,
    /// Shards exported at once per table.
    pub shards: usize,
    /// Bytes per chunk; the store's default when unset.
    pub flush_size: Option<usize>,
    /// Rows per chunk; 0 means no row limit.
    pub flush_rows: usize,
    pub compression: CompressionKind,
    /// Delete staged files of tables that loaded successfully.
    pub cleanup: bool,
    pub truncate: bool,
    /// Load with COPY so the target table stays online.
    pub live: bool,
    /// Rows per page for sources that export with a scan.
    pub row_batch_size: usize,
    pub continuation: ContinuationConfig,
    pub filter: FilterConfig,
    pub store: Option<StoreConfig>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            shards: 1,
            flush_size: None,
            flush_rows: 0,
            compression: CompressionKind::default(),
            cleanup: false,
            truncate: false,
            live: false,
            row_batch_size: 100_000,
            continuation: ContinuationConfig::default(),
            filter: FilterConfig::default(),
            store: None,
        }
    }
}

impl FetchConfig {
    pub fn validate(&self) -> Result<(), MoltError> {
        if self.concurrency == 0 {
            return Err(MoltError::Config("table concurrency must be at least 1".into()));
        }
        if self.shards == 0 {
            return Err(MoltError::Config("shards must be at least 1".into()));
        }
        if self.row_batch_size == 0 {
            return Err(MoltError::Config("row batch size must be at least 1".into()));
        }
        if self.store.is_none() {
            return Err(MoltError::Config(
                "one of --bucket-path, --local-path or --direct-copy is required".into(),
            ));
        }
        let cont = &self.continuation;
        if let Some(name) = cont.file_name() {
            if !matches_file_convention(name) {
                return Err(MoltError::Config(format!(
                    "continuation file name {} doesn't match the format part_<8 digits>.<csv|tar.gz>",
                    name
                )));
            }
            if cont.token().is_none() {
                return Err(MoltError::Config(
                    "--continuation-file-name requires --continuation-token".into(),
                ));
            }
        }
        if cont.token().is_some() && cont.fetch_id().is_none() {
            return Err(MoltError::Config(
                "--continuation-token requires --fetch-id".into(),
            ));
        }
        Ok(())
    }

    pub fn gzip(&self) -> bool {
        self.compression == CompressionKind::Gzip
    }
}

/// Retry policy for rows the live reverifier rechecks.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    #[serde(with = "millis")]
    pub initial_backoff: Duration,
    pub multiplier: u32,
    #[serde(with = "millis")]
    pub max_backoff: Duration,
    pub max_retries: usize,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            multiplier: 2,
            max_backoff: Duration::from_secs(1),
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LiveReverifySettings {
    pub max_batch_size: usize,
    #[serde(with = "millis")]
    pub flush_interval: Duration,
    pub retry: RetrySettings,
    /// Reverification batches per second; unlimited when unset.
    pub max_rps: Option<u32>,
}

impl Default for LiveReverifySettings {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            flush_interval: Duration::from_secs(1),
            retry: RetrySettings::default(),
            max_rps: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Shards verified at once.
    pub concurrency: usize,
    pub rows_per_batch: usize,
    /// Shards per table.
    pub table_splits: usize,
    pub filter: FilterConfig,
    /// Repair inconsistencies on the target.
    pub fix: bool,
    pub live: Option<LiveReverifySettings>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            rows_per_batch: 20_000,
            table_splits: 1,
            filter: FilterConfig::default(),
            fix: false,
            live: None,
        }
    }
}

impl VerifyConfig {
    pub fn validate(&self) -> Result<(), MoltError> {
        if self.concurrency == 0 {
            return Err(MoltError::Config("concurrency must be at least 1".into()));
        }
        if self.rows_per_batch == 0 {
            return Err(MoltError::Config("rows per batch must be at least 1".into()));
        }
        if self.table_splits == 0 {
            return Err(MoltError::Config("table splits must be at least 1".into()));
        }
        if let Some(live) = &self.live {
            if live.max_batch_size == 0 || live.retry.multiplier == 0 {
                return Err(MoltError::Config(
                    "live max batch size and retry multiplier must be positive".into(),
                ));
            }
            if live.max_rps == Some(0) {
                return Err(MoltError::Config("live max rps must be positive".into()));
            }
        }
        Ok(())
    }
}

/// Durations written as integer milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
