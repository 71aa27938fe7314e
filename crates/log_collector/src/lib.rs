//! Log Collector - Tracking Log Ingestion and Course Statistics
//!
//! This crate ingests line-delimited learning-platform tracking logs from a
//! local directory, an S3 bucket or an Azure blob container, stores every raw
//! event exactly once and incrementally rolls the events up into per-day,
//! per-user and per-course statistics.

#![allow(clippy::missing_errors_doc)] // Error documentation is handled at module level
#![allow(clippy::module_name_repetitions)] // Type names mirror their module for re-export
#![allow(clippy::cast_possible_truncation)] // Video positions are truncated to whole seconds
#![allow(clippy::cast_sign_loss)] // Negative positions are filtered before casting
#![allow(clippy::cast_precision_loss)] // Backoff delays tolerate float rounding
//!
//! # Features
//!
//! - **Pluggable sources**: local filesystem, S3, Azure blob and live events
//! - **Idempotent ingestion**: raw events deduplicated on (type hash, time, user)
//! - **Checkpointed pipelines**: enrollment, video views, discussion, student
//!   step and course activity, each resuming from its own checkpoint
//! - **Atomic aggregation**: same-time event groups and their checkpoint
//!   commit in one redb transaction
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        LogCollector                          │
//! ├───────────────┬──────────────────┬───────────────────────────┤
//! │   LogSource   │ EventRepository  │        Processor          │
//! │ (fs/s3/azure) │ (dedup + store)  │ (PipelineRunner x kinds)  │
//! ├───────────────┴──────────────────┴───────────────────────────┤
//! │          redb: raw events, checkpoints, aggregates           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use log_collector::{CollectorConfig, LogCollector, source::FileSystemBackend};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let collector = LogCollector::open(CollectorConfig::in_memory())?;
//!     let backend = Arc::new(FileSystemBackend::new("/edx/var/log/tracking"));
//!
//!     let report = collector.load_and_process(backend).await?;
//!     println!("ingested {} units", report.units);
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use tracing::{error, info, warn};

// Public exports
pub use config::*;
pub use error::*;
pub use types::*;

// Internal modules
pub mod config;
pub mod error;
pub mod types;

// Storage
pub mod storage;

// Sources and pipelines
pub mod pipeline;
pub mod processor;
pub mod source;

// Re-exports for convenience
pub use pipeline::{PipelineKind, PipelineRunner, PipelineStats};
pub use processor::{ProcessReport, Processor};
pub use source::{
    BackendKind, FileSystemBackend, LiveEventBackend, LogSource, ObjectStoreBackend,
    SourceBackend, SourceUnit, UnitKind,
};
pub use storage::{CheckpointStore, EventRepository, IngestStats, Store};

/// Outcome of one collection cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Units ingested
    pub units: usize,
    /// Ingestion counters summed over all units
    pub ingest: IngestStats,
    /// Records applied by the pipelines
    pub applied: u64,
    /// Pipeline runs stopped by an error
    pub failed_pipeline_runs: usize,
    /// Raw events deleted after consumption
    pub deleted: u64,
}

/// Main collector interface
///
/// Owns the database and wires sources, repository and pipelines together.
/// Cloning is cheap and clones share the same database.
#[derive(Debug, Clone)]
pub struct LogCollector {
    config: Arc<CollectorConfig>,
    store: Store,
    repository: EventRepository,
    processor: Processor,
}

impl LogCollector {
    /// Open the collector database described by `config`
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the database cannot
    /// be opened
    pub fn open(config: CollectorConfig) -> CollectorResult<Self> {
        config.validate_config()?;

        let store = Store::open(&config.storage)?;
        let batch_size = usize::try_from(config.storage.ingest_batch_size).unwrap_or(1024);
        let repository = EventRepository::new(store.clone(), batch_size);
        let processor = Processor::new(repository.clone(), &config.pipeline);

        info!(
            "Log collector opened ({} pipelines enabled)",
            processor.pipelines().len()
        );

        Ok(Self {
            config: Arc::new(config),
            store,
            repository,
            processor,
        })
    }

    /// Effective configuration
    #[must_use]
    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Database handle
    #[must_use]
    pub const fn store(&self) -> &Store {
        &self.store
    }

    /// Raw event repository
    #[must_use]
    pub const fn repository(&self) -> &EventRepository {
        &self.repository
    }

    /// Pipeline orchestrator
    #[must_use]
    pub const fn processor(&self) -> &Processor {
        &self.processor
    }

    /// Entry point for live events
    #[must_use]
    pub fn live_backend(&self) -> LiveEventBackend {
        LiveEventBackend::new(self.processor.clone())
    }

    /// Run one collection cycle against `backend`
    ///
    /// Every candidate unit is ingested in order. After each unit, archived
    /// units are marked processed, all pipelines run, and consumed raw events
    /// are deleted when configured.
    ///
    /// # Errors
    ///
    /// Returns a source error if the backend cannot be listed or a unit cannot
    /// be read, or a database error if bookkeeping fails
    pub async fn load_and_process(
        &self,
        backend: Arc<dyn SourceBackend>,
    ) -> CollectorResult<CycleReport> {
        let source = LogSource::new(
            backend,
            self.repository.clone(),
            self.config.scheduler.reload_logs,
        );
        let units = source.list_unprocessed_units().await?;
        info!(
            "Found {} units to ingest on '{}'",
            units.len(),
            source.backend_name()
        );

        let mut report = CycleReport::default();
        for unit in &units {
            let stats = source.ingest_unit(unit).await?;
            info!(
                "Ingested {}: {} lines, {} stored, {} duplicates, {} malformed, {} dropped",
                unit.name, stats.lines, stats.stored, stats.duplicates, stats.malformed, stats.dropped
            );
            report.units += 1;
            report.ingest.merge(&stats);

            let archived = unit.kind() == Some(UnitKind::Archived);
            if archived {
                source.mark_processed(unit)?;
            }

            let processed = self.process().await?;
            report.applied += processed.applied();
            report.failed_pipeline_runs += processed.failed.len();

            if archived && self.config.scheduler.delete_logs {
                report.deleted += self.delete_logs().await?;
            }
        }

        Ok(report)
    }

    /// Run every enabled pipeline on the blocking pool
    ///
    /// # Errors
    ///
    /// Returns error if the blocking task cannot complete
    pub async fn process(&self) -> CollectorResult<ProcessReport> {
        let processor = self.processor.clone();
        tokio::task::spawn_blocking(move || processor.process())
            .await
            .map_err(|e| CollectorError::internal(format!("pipeline task failed: {e}")))
    }

    /// Delete raw events consumed by every enabled pipeline
    ///
    /// # Errors
    ///
    /// Returns error if checkpoints cannot be read or the deletion fails
    pub async fn delete_logs(&self) -> CollectorResult<u64> {
        let processor = self.processor.clone();
        tokio::task::spawn_blocking(move || processor.delete_logs())
            .await
            .map_err(|e| CollectorError::internal(format!("cleanup task failed: {e}")))?
    }

    /// Poll `backend` until Ctrl-C, sleeping between cycles
    ///
    /// # Errors
    ///
    /// Returns the first source (transport) error; other cycle errors are
    /// logged and the loop continues
    pub async fn run(&self, backend: Arc<dyn SourceBackend>) -> CollectorResult<()> {
        let interval = self.config.scheduler.sleep_interval();

        loop {
            match self.load_and_process(Arc::clone(&backend)).await {
                Ok(report) => info!(
                    "Cycle finished: {} units, {} events stored, {} records applied, {} deleted",
                    report.units, report.ingest.stored, report.applied, report.deleted
                ),
                Err(e) if e.is_transport() => {
                    error!("Source backend failed: {}", e);
                    return Err(e);
                }
                Err(e) => warn!("Cycle failed: {}", e),
            }

            info!("Sleeping for {:?}", interval);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        warn!("Cannot listen for shutdown signal: {}", e);
                    }
                    info!("Shutdown requested, stopping collector");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_gz(path: &std::path::Path, lines: &[String]) -> CollectorResult<()> {
        let file = std::fs::File::create(path)?;
        let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        for line in lines {
            writeln!(encoder, "{line}")?;
        }
        encoder.finish()?;
        Ok(())
    }

    #[tokio::test]
    async fn test_open_in_memory() -> CollectorResult<()> {
        let collector = LogCollector::open(CollectorConfig::in_memory())?;
        collector.store().health_check()?;
        assert_eq!(collector.processor().pipelines().len(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_archived_unit_processed_once() -> CollectorResult<()> {
        let dir = tempfile::tempdir()?;
        let line = serde_json::json!({
            "event_type": "edx.course.enrollment.activated",
            "time": "2020-01-01T10:00:00Z",
            "username": "alice",
            "event": {"course_id": "course-v1:edX+DemoX+Demo"}
        })
        .to_string();
        write_gz(&dir.path().join("tracking.log-1.gz"), &[line])?;

        let collector = LogCollector::open(CollectorConfig::in_memory())?;
        let backend: Arc<dyn SourceBackend> = Arc::new(FileSystemBackend::new(dir.path()));

        let first = collector.load_and_process(Arc::clone(&backend)).await?;
        assert_eq!(first.units, 1);
        assert_eq!(first.ingest.stored, 1);
        assert_eq!(first.applied, 1);

        let second = collector.load_and_process(backend).await?;
        assert_eq!(second.units, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_directory_surfaces_transport_error() -> CollectorResult<()> {
        let collector = LogCollector::open(CollectorConfig::in_memory())?;
        let backend: Arc<dyn SourceBackend> =
            Arc::new(FileSystemBackend::new("/definitely/not/here"));

        let result = collector.run(backend).await;
        assert!(matches!(result, Err(ref e) if e.is_transport()));
        Ok(())
    }
}
