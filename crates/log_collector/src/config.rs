//! Log Collector Configuration
//!
//! Configuration for storage, source backends, the scheduling loop and the
//! pipeline driver. Values come from defaults, an optional TOML file and
//! `LOG_COLLECTOR__*` environment variables, in that order of precedence.

use garde::Validate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{
    error::{CollectorError, CollectorResult},
    pipeline::PipelineKind,
    source::BackendKind,
};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "LOG_COLLECTOR";

/// Main configuration for the collector
#[derive(Debug, Clone, Serialize, Deserialize, Default, Validate)]
#[serde(default)]
pub struct CollectorConfig {
    /// Storage configuration
    #[garde(dive)]
    pub storage: StorageConfig,

    /// Source backend configuration
    #[garde(dive)]
    pub source: SourceConfig,

    /// Scheduling loop configuration
    #[garde(dive)]
    pub scheduler: SchedulerConfig,

    /// Pipeline driver configuration
    #[garde(dive)]
    pub pipeline: PipelineConfig,
}

/// Storage configuration (redb)
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path (None for in-memory)
    #[garde(skip)]
    pub database_path: Option<PathBuf>,

    /// Use in-memory storage (tests and dry runs)
    #[garde(skip)]
    pub use_memory_storage: bool,

    /// Cache size in bytes
    #[garde(range(min = 1_048_576))]
    pub cache_size_bytes: u64,

    /// Raw lines committed per ingestion transaction
    #[garde(range(min = 1, max = 1_000_000))]
    pub ingest_batch_size: u32,
}

/// Source backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SourceConfig {
    /// Backend to read tracking logs from
    #[garde(skip)]
    pub backend: BackendKind,

    /// Directory with tracking log files (file-system backend)
    #[garde(skip)]
    pub tracking_log_dir: PathBuf,

    /// S3 bucket with tracking logs
    #[garde(skip)]
    pub bucket_name: Option<String>,

    /// AWS access key id
    #[garde(skip)]
    pub aws_access_key_id: Option<String>,

    /// AWS secret access key
    #[garde(skip)]
    pub aws_secret_access_key: Option<String>,

    /// AWS region
    #[garde(skip)]
    pub aws_region: Option<String>,

    /// Azure blob container with tracking logs
    #[garde(skip)]
    pub container_name: Option<String>,

    /// Azure storage account
    #[garde(skip)]
    pub azure_account: Option<String>,

    /// Azure storage access key
    #[garde(skip)]
    pub azure_access_key: Option<String>,
}

/// Scheduling loop configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Time between collection cycles (seconds)
    #[garde(range(min = 1, max = 86_400))]
    pub sleep_interval_secs: u64,

    /// Reprocess every unit, including archived units already marked processed
    #[garde(skip)]
    pub reload_logs: bool,

    /// Delete consumed raw events after an archived unit is processed
    #[garde(skip)]
    pub delete_logs: bool,
}

/// Pipeline driver configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pipelines run on every cycle, in this order
    #[garde(length(min = 1))]
    pub enabled: Vec<PipelineKind>,

    /// Raw events read per candidate page
    #[garde(range(min = 1, max = 100_000))]
    pub page_size: u32,

    /// Retry configuration for failing aggregate writes
    #[garde(dive)]
    pub retry: RetryConfig,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries
    #[garde(range(max = 20))]
    pub max_retries: u32,

    /// Initial retry delay (milliseconds)
    #[garde(range(min = 1))]
    pub initial_delay_ms: u64,

    /// Maximum retry delay (milliseconds)
    #[garde(range(min = 1))]
    pub max_delay_ms: u64,

    /// Backoff multiplier
    #[garde(range(min = 1.0, max = 10.0))]
    pub backoff_multiplier: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: Some(PathBuf::from("./data/log_collector.redb")),
            use_memory_storage: false,
            cache_size_bytes: 134_217_728, // 128MB
            ingest_batch_size: 1024,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::FileSystem,
            tracking_log_dir: PathBuf::from("/edx/var/log/tracking"),
            bucket_name: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            aws_region: None,
            container_name: None,
            azure_account: None,
            azure_access_key: None,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sleep_interval_secs: 300,
            reload_logs: false,
            delete_logs: false,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: PipelineKind::ALL.to_vec(),
            page_size: 1000,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl CollectorConfig {
    /// Load configuration from defaults, an optional TOML file and the environment
    ///
    /// # Errors
    ///
    /// Returns error if a source cannot be read or the result fails validation
    pub fn load(path: Option<&Path>) -> CollectorResult<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate_config()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any section is out of range
    pub fn validate_config(&self) -> CollectorResult<()> {
        self.validate(&()).map_err(|e| {
            CollectorError::validation("collector_config", format!("Validation failed: {e}"))
        })?;

        if !self.storage.use_memory_storage && self.storage.database_path.is_none() {
            return Err(CollectorError::configuration(
                "Either use_memory_storage must be true or database_path must be provided",
            ));
        }

        Ok(())
    }

    /// Render the effective configuration as TOML
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_toml(&self) -> CollectorResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| CollectorError::configuration(format!("Cannot render config: {e}")))
    }

    /// Configuration for an in-memory collector (tests, dry runs)
    #[must_use]
    pub fn in_memory() -> Self {
        let mut config = Self::default();
        config.storage.use_memory_storage = true;
        config.storage.database_path = None;
        config
    }
}

impl SourceConfig {
    /// Check that the chosen backend has everything it needs to connect
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the missing parameters
    pub fn check_credentials(&self) -> CollectorResult<()> {
        fn missing(value: Option<&String>) -> bool {
            value.map_or(true, |v| v.trim().is_empty())
        }

        match self.backend {
            BackendKind::FileSystem => Ok(()),
            BackendKind::S3 => {
                if missing(self.aws_access_key_id.as_ref())
                    || missing(self.aws_secret_access_key.as_ref())
                {
                    return Err(CollectorError::configuration(
                        "For backend s3 params --aws-access-key-id and --aws-secret-access-key can't be empty",
                    ));
                }
                if missing(self.bucket_name.as_ref()) {
                    return Err(CollectorError::configuration(
                        "For backend s3 param --bucket-name can't be empty",
                    ));
                }
                Ok(())
            }
            BackendKind::AzureBlob => {
                if missing(self.azure_account.as_ref())
                    || missing(self.azure_access_key.as_ref())
                    || missing(self.container_name.as_ref())
                {
                    return Err(CollectorError::configuration(
                        "For backend azure-blob params --azure-account, --azure-access-key and --container-name can't be empty",
                    ));
                }
                Ok(())
            }
        }
    }
}

impl SchedulerConfig {
    /// Sleep interval between cycles
    #[must_use]
    pub const fn sleep_interval(&self) -> Duration {
        Duration::from_secs(self.sleep_interval_secs)
    }
}

impl RetryConfig {
    /// Delay before the given retry attempt (1-based), capped at `max_delay_ms`
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay_ms = (self.initial_delay_ms as f64) * self.backoff_multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_delay_ms as f64);

        Duration::from_millis(capped as u64)
    }
}
