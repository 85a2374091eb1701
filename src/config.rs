use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::index::{IndexOptions, MAX_BLOCK_CAPACITY};
use crate::storage::BucketConfig;

/// Top-level application configuration loaded from file + environment.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub bucket: BucketSection,
    pub index: IndexSection,
    pub logging: LoggingSection,
    pub node: NodeSection,
}

impl AppConfig {
    /// Load configuration from `CHANIDX_CONFIG` (default `config.toml`, optional)
    /// layered with `CHANIDX_*` environment variables.
    ///
    /// Nested keys use a double underscore, e.g. `CHANIDX_INDEX__BLOCK_CAPACITY`.
    pub fn load() -> Result<Self> {
        let config_path = env::var("CHANIDX_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Load configuration from a specific file (skipped when missing) plus environment.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut builder = config::Config::builder();

        if path.exists() {
            builder = builder.add_source(config::File::from(PathBuf::from(path)));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CHANIDX")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder
            .build()
            .with_context(|| format!("failed to read configuration from {}", path.display()))?;
        let mut config: Self = settings.try_deserialize()?;

        if config.node.node_id.is_none() {
            if let Ok(node_id) = env::var("CHANIDX_NODE_ID") {
                config.node.node_id = Some(node_id);
            }
        }

        if config.logging.level.trim().is_empty() {
            config.logging.level = "info".to_string();
        }

        Ok(config)
    }

    /// Reject configurations the index cannot run with.
    pub fn validate(&self) -> Result<()> {
        let index = &self.index;
        if index.block_capacity == 0 || index.block_capacity > MAX_BLOCK_CAPACITY {
            bail!(
                "index.block_capacity must be between 1 and {}",
                MAX_BLOCK_CAPACITY
            );
        }
        if index.num_vbuckets == 0 {
            bail!("index.num_vbuckets must be greater than 0");
        }
        if index.num_partitions == 0 {
            bail!("index.num_partitions must be greater than 0");
        }
        if index.num_partitions > index.num_vbuckets {
            bail!(
                "index.num_partitions ({}) cannot exceed index.num_vbuckets ({})",
                index.num_partitions,
                index.num_vbuckets
            );
        }
        if index.key_prefix.trim().is_empty() {
            bail!("index.key_prefix must be specified");
        }
        if index.poll_interval_ms == 0 {
            bail!("index.poll_interval_ms must be greater than 0");
        }
        if index.cas_backoff_base_ms > index.cas_backoff_max_ms {
            bail!("index.cas_backoff_base_ms cannot exceed index.cas_backoff_max_ms");
        }

        self.bucket.to_runtime().map(|_| ())
    }

    /// Resolve the bucket backend configuration.
    pub fn bucket_runtime(&self) -> Result<BucketConfig> {
        self.bucket.to_runtime()
    }

    pub fn index_options(&self) -> IndexOptions {
        self.index.to_options()
    }

    /// Node identity: configuration, then `CHANIDX_NODE_ID`, then the host name.
    pub fn node_id(&self) -> String {
        self.node
            .node_id
            .clone()
            .or_else(|| env::var("CHANIDX_NODE_ID").ok())
            .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
            .unwrap_or_else(|| "chanidx-node".to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4985,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BucketSection {
    pub backend: BucketBackendKind,
    pub s3: Option<S3BucketSection>,
}

impl BucketSection {
    pub fn to_runtime(&self) -> Result<BucketConfig> {
        match self.backend {
            BucketBackendKind::Memory => Ok(BucketConfig::Memory),
            BucketBackendKind::S3 => {
                let s3 = self
                    .s3
                    .clone()
                    .context("bucket.s3 configuration required when backend is 's3'")?;

                if s3.bucket.trim().is_empty() {
                    bail!("bucket.s3.bucket must be specified");
                }
                if s3.region.trim().is_empty() {
                    bail!("bucket.s3.region must be specified");
                }

                Ok(BucketConfig::S3 {
                    bucket: s3.bucket,
                    region: s3.region,
                    endpoint: s3.endpoint.filter(|e| !e.trim().is_empty()),
                })
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BucketBackendKind {
    #[default]
    Memory,
    S3,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct S3BucketSection {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexSection {
    pub key_prefix: String,
    pub block_capacity: u64,
    pub num_vbuckets: u16,
    pub num_partitions: u16,
    pub poll_interval_ms: u64,
    pub cache_max_blocks: usize,
    pub max_cas_retries: u32,
    pub cas_backoff_base_ms: u64,
    pub cas_backoff_max_ms: u64,
    pub notify_queue_capacity: usize,
    pub index_star_channel: bool,
}

impl IndexSection {
    pub fn to_options(&self) -> IndexOptions {
        IndexOptions {
            key_prefix: self.key_prefix.clone(),
            block_capacity: self.block_capacity,
            num_vbuckets: self.num_vbuckets,
            num_partitions: self.num_partitions,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            cache_max_blocks: self.cache_max_blocks,
            max_cas_retries: self.max_cas_retries,
            cas_backoff_base: Duration::from_millis(self.cas_backoff_base_ms),
            cas_backoff_max: Duration::from_millis(self.cas_backoff_max_ms),
            notify_queue_capacity: self.notify_queue_capacity,
            index_star_channel: self.index_star_channel,
            poll_enabled: true,
        }
    }
}

impl Default for IndexSection {
    fn default() -> Self {
        let defaults = IndexOptions::default();
        Self {
            key_prefix: defaults.key_prefix,
            block_capacity: defaults.block_capacity,
            num_vbuckets: defaults.num_vbuckets,
            num_partitions: defaults.num_partitions,
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            cache_max_blocks: defaults.cache_max_blocks,
            max_cas_retries: defaults.max_cas_retries,
            cas_backoff_base_ms: defaults.cas_backoff_base.as_millis() as u64,
            cas_backoff_max_ms: defaults.cas_backoff_max.as_millis() as u64,
            notify_queue_capacity: defaults.notify_queue_capacity,
            index_star_channel: defaults.index_star_channel,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct NodeSection {
    pub node_id: Option<String>,
}
