//! Source backends
//!
//! A backend only knows how to enumerate log units and open their content.
//! [`LogSource`] layers the shared behaviour on top: candidate filtering,
//! deterministic ordering, gzip decoding, ingestion into the
//! [`EventRepository`] and processed-unit bookkeeping.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{BufReader, Read};
use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    config::SourceConfig,
    error::{CollectorError, CollectorResult},
    storage::{EventRepository, IngestStats},
};

pub mod filesystem;
pub mod live;
pub mod remote;

pub use filesystem::FileSystemBackend;
pub use live::LiveEventBackend;
pub use remote::ObjectStoreBackend;

/// Source backend selection
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Local tracking log directory
    #[default]
    FileSystem,
    /// Amazon S3 bucket
    S3,
    /// Azure blob container
    AzureBlob,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FileSystem => "file-system",
            Self::S3 => "s3",
            Self::AzureBlob => "azure-blob",
        };
        f.write_str(name)
    }
}

/// How a unit is treated once consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Rotated, gzip-compressed and immutable (`.gz`)
    Archived,
    /// Still being appended to (`.log`); never marked processed
    Live,
}

impl UnitKind {
    /// Classify a unit by name; `None` if it is not a tracking log
    #[must_use]
    pub fn of(name: &str) -> Option<Self> {
        if name.ends_with(".gz") {
            Some(Self::Archived)
        } else if name.ends_with(".log") {
            Some(Self::Live)
        } else {
            None
        }
    }
}

/// One log unit (file or object)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    /// File name or object key
    pub name: String,
    /// Creation time (modification time where creation is unavailable)
    pub created: DateTime<Utc>,
    /// Size in bytes
    pub size: u64,
}

impl SourceUnit {
    /// Unit classification, `None` for non-candidates
    #[must_use]
    pub fn kind(&self) -> Option<UnitKind> {
        UnitKind::of(&self.name)
    }
}

/// Capability interface of a log source
#[async_trait]
pub trait SourceBackend: Send + Sync + fmt::Debug {
    /// Backend name used in logs and errors
    fn name(&self) -> &str;

    /// Enumerate all units, in any order
    async fn list(&self) -> CollectorResult<Vec<SourceUnit>>;

    /// Open the raw (possibly compressed) content of a unit
    ///
    /// The returned reader is blocking and must be consumed off the async
    /// executor threads.
    async fn open(&self, unit: &SourceUnit) -> CollectorResult<Box<dyn Read + Send>>;
}

/// Build the backend selected by configuration
///
/// # Errors
///
/// Returns a configuration error if credentials are missing, or a source
/// error if the client cannot be built
pub fn build_backend(config: &SourceConfig) -> CollectorResult<Arc<dyn SourceBackend>> {
    config.check_credentials()?;

    let backend: Arc<dyn SourceBackend> = match config.backend {
        BackendKind::FileSystem => Arc::new(FileSystemBackend::new(&config.tracking_log_dir)),
        BackendKind::S3 => Arc::new(ObjectStoreBackend::s3(
            config.bucket_name.as_deref().unwrap_or_default(),
            config.aws_access_key_id.as_deref().unwrap_or_default(),
            config.aws_secret_access_key.as_deref().unwrap_or_default(),
            config.aws_region.as_deref(),
        )?),
        BackendKind::AzureBlob => Arc::new(ObjectStoreBackend::azure(
            config.azure_account.as_deref().unwrap_or_default(),
            config.azure_access_key.as_deref().unwrap_or_default(),
            config.container_name.as_deref().unwrap_or_default(),
        )?),
    };

    info!("Using {} source backend '{}'", config.backend, backend.name());
    Ok(backend)
}

/// Order units ascending by creation time, ties broken by name
pub fn order_units(units: &mut [SourceUnit]) {
    units.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.name.cmp(&b.name)));
}

/// Backend plus repository: the ingestion half of a collection cycle
#[derive(Debug, Clone)]
pub struct LogSource {
    backend: Arc<dyn SourceBackend>,
    repository: EventRepository,
    reload_logs: bool,
}

impl LogSource {
    /// Create log source
    #[must_use]
    pub fn new(
        backend: Arc<dyn SourceBackend>,
        repository: EventRepository,
        reload_logs: bool,
    ) -> Self {
        Self {
            backend,
            repository,
            reload_logs,
        }
    }

    /// Backend name
    #[must_use]
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Candidate units not yet processed, in ingestion order
    ///
    /// Live units are always candidates; archived units are skipped once
    /// processed unless reloading is enabled.
    ///
    /// # Errors
    ///
    /// Returns a source error if the backend cannot be listed
    pub async fn list_unprocessed_units(&self) -> CollectorResult<Vec<SourceUnit>> {
        let listed = self.backend.list().await?;
        let total = listed.len();

        let mut units = Vec::with_capacity(total);
        for unit in listed {
            match unit.kind() {
                None => continue,
                Some(UnitKind::Archived)
                    if !self.reload_logs && self.repository.is_unit_processed(&unit.name)? =>
                {
                    debug!("Skipping processed unit {}", unit.name);
                }
                Some(_) => units.push(unit),
            }
        }

        order_units(&mut units);
        debug!(
            "{} of {} listed units are candidates on '{}'",
            units.len(),
            total,
            self.backend.name()
        );
        Ok(units)
    }

    /// Stream one unit into the repository
    ///
    /// # Errors
    ///
    /// Returns a source error if the unit cannot be opened or read to the end
    pub async fn ingest_unit(&self, unit: &SourceUnit) -> CollectorResult<IngestStats> {
        let raw = self.backend.open(unit).await?;
        let archived = unit.kind() == Some(UnitKind::Archived);
        let repository = self.repository.clone();

        let result = tokio::task::spawn_blocking(move || {
            let reader: Box<dyn Read + Send> = if archived {
                Box::new(MultiGzDecoder::new(raw))
            } else {
                raw
            };
            repository.store_lines(BufReader::new(reader))
        })
        .await
        .map_err(|e| CollectorError::internal(format!("ingestion task failed: {e}")))?;

        match result {
            Err(CollectorError::Io(e)) => Err(CollectorError::source(
                self.backend.name(),
                format!("reading {}: {}", unit.name, e),
            )),
            other => other,
        }
    }

    /// Mark an archived unit processed; live units are left alone
    ///
    /// # Errors
    ///
    /// Returns error if the marker cannot be written
    pub fn mark_processed(&self, unit: &SourceUnit) -> CollectorResult<()> {
        if unit.kind() == Some(UnitKind::Archived) {
            self.repository.mark_unit_processed(&unit.name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn unit(name: &str, hour: u32) -> SourceUnit {
        SourceUnit {
            name: name.to_string(),
            created: Utc.with_ymd_and_hms(2020, 1, 1, hour, 0, 0).unwrap(),
            size: 0,
        }
    }

    #[test]
    fn test_unit_kinds() {
        assert_eq!(UnitKind::of("tracking.log-20200101.gz"), Some(UnitKind::Archived));
        assert_eq!(UnitKind::of("tracking.log"), Some(UnitKind::Live));
        assert_eq!(UnitKind::of("notes.txt"), None);
    }

    #[test]
    fn test_units_ordered_by_time_then_name() {
        let mut units = vec![
            unit("c.gz", 3),
            unit("b.gz", 1),
            unit("a.gz", 2),
            unit("a2.gz", 1),
        ];
        order_units(&mut units);

        let names: Vec<&str> = units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["a2.gz", "b.gz", "a.gz", "c.gz"]);
    }

    #[test]
    fn test_backend_kind_names() -> CollectorResult<()> {
        assert_eq!(BackendKind::AzureBlob.to_string(), "azure-blob");
        let parsed: BackendKind = serde_json::from_str("\"file-system\"")?;
        assert_eq!(parsed, BackendKind::FileSystem);
        Ok(())
    }

    #[test]
    fn test_build_backend_checks_credentials() {
        let config = SourceConfig {
            backend: BackendKind::S3,
            ..SourceConfig::default()
        };
        assert!(matches!(
            build_backend(&config),
            Err(CollectorError::Configuration { .. })
        ));
    }
}
