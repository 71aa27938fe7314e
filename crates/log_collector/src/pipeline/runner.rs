//! Checkpoint-driven pipeline driver
//!
//! Reads a pipeline's candidate raw events in pages, groups them by
//! `log_time` and applies every group together with the checkpoint advance in
//! one write transaction. A group that keeps failing after the configured
//! retries stops the pipeline for this run with its checkpoint just before the
//! failing group.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::PipelineKind;
use crate::{
    config::{PipelineConfig, RetryConfig},
    error::{CollectorError, CollectorResult},
    storage::{checkpoint, CheckpointStore, EventRepository},
    types::RawEvent,
};

/// Outcome of one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Candidate raw events read
    pub selected: u64,
    /// Records applied to aggregates
    pub applied: u64,
    /// Events dropped by `format`
    pub skipped: u64,
    /// Checkpoint after the run
    pub checkpoint: Option<DateTime<Utc>>,
}

/// Cumulative driver metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerMetrics {
    /// Completed pipeline runs
    pub runs: u64,
    /// Records applied across all runs
    pub applied: u64,
    /// Events skipped across all runs
    pub skipped: u64,
    /// Group transactions retried
    pub retries: u64,
    /// Groups abandoned after exhausting retries
    pub failed_groups: u64,
    /// Duration of the most recent run (milliseconds)
    pub last_run_ms: u64,
}

/// Drives pipelines over the stored raw events
#[derive(Debug, Clone)]
pub struct PipelineRunner {
    repository: EventRepository,
    checkpoints: CheckpointStore,
    page_size: usize,
    retry: RetryConfig,
    metrics: Arc<parking_lot::Mutex<RunnerMetrics>>,
}

impl PipelineRunner {
    /// Create runner
    #[must_use]
    pub fn new(repository: EventRepository, config: &PipelineConfig) -> Self {
        Self {
            checkpoints: CheckpointStore::new(repository.store().clone()),
            repository,
            page_size: usize::try_from(config.page_size).unwrap_or(1000).max(1),
            retry: config.retry.clone(),
            metrics: Arc::new(parking_lot::Mutex::new(RunnerMetrics::default())),
        }
    }

    /// Apply every unconsumed raw event of `kind`
    ///
    /// Blocking; call from a blocking context.
    ///
    /// # Errors
    ///
    /// Returns a pipeline error if a group could not be applied after
    /// retrying, or a database error if candidates cannot be read. Groups
    /// applied before the failure stay committed.
    pub fn run(&self, kind: PipelineKind) -> CollectorResult<PipelineStats> {
        let started = Instant::now();
        let mut stats = PipelineStats {
            checkpoint: self
                .checkpoints
                .get(kind.id())?
                .map(|c| c.last_event_time),
            ..PipelineStats::default()
        };

        loop {
            let page =
                self.repository
                    .select_after(kind.event_types(), stats.checkpoint, self.page_size)?;
            if page.is_empty() {
                break;
            }
            stats.selected += page.len() as u64;

            let mut start = 0;
            while start < page.len() {
                let time = page[start].log_time;
                let end = page[start..]
                    .iter()
                    .position(|event| event.log_time != time)
                    .map_or(page.len(), |offset| start + offset);

                let (applied, skipped) = self.apply_with_retry(kind, &page[start..end])?;
                stats.applied += applied;
                stats.skipped += skipped;
                stats.checkpoint = Some(time);
                start = end;
            }
        }

        let elapsed = started.elapsed();
        {
            let mut metrics = self.metrics.lock();
            metrics.runs += 1;
            metrics.applied += stats.applied;
            metrics.skipped += stats.skipped;
            metrics.last_run_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        }

        info!(
            "Pipeline {} applied {} of {} events ({} skipped) in {:?}, checkpoint {:?}",
            kind, stats.applied, stats.selected, stats.skipped, elapsed, stats.checkpoint
        );
        Ok(stats)
    }

    fn apply_with_retry(
        &self,
        kind: PipelineKind,
        group: &[RawEvent],
    ) -> CollectorResult<(u64, u64)> {
        let mut attempt = 0;
        loop {
            match self.apply_group(kind, group) {
                Ok(counts) => return Ok(counts),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Pipeline {} group failed ({}), retry {}/{} in {:?}",
                        kind, e, attempt, self.retry.max_retries, delay
                    );
                    self.metrics.lock().retries += 1;
                    std::thread::sleep(delay);
                }
                Err(e) => {
                    self.metrics.lock().failed_groups += 1;
                    let at = group.first().map(|event| event.log_time);
                    return Err(CollectorError::pipeline(
                        kind.id(),
                        format!("group at {at:?} not applied: {e}"),
                    ));
                }
            }
        }
    }

    /// Apply one same-time group and advance the checkpoint, atomically
    fn apply_group(&self, kind: PipelineKind, group: &[RawEvent]) -> CollectorResult<(u64, u64)> {
        let Some(time) = group.first().map(|event| event.log_time) else {
            return Ok((0, 0));
        };

        self.repository.store().write("apply_group", |txn| {
            let mut applied = 0;
            let mut skipped = 0;

            for raw in group {
                let record = match raw.envelope() {
                    Ok(envelope) => kind.format(&envelope),
                    Err(e) => {
                        debug!("Undecodable raw event at {}: {}", raw.log_time, e);
                        None
                    }
                };

                match record {
                    Some(record) => {
                        record.apply(txn)?;
                        applied += 1;
                    }
                    None => skipped += 1,
                }
            }

            checkpoint::advance(txn, kind.id(), time)?;
            Ok((applied, skipped))
        })
    }

    /// Snapshot of the cumulative metrics
    #[must_use]
    pub fn metrics(&self) -> RunnerMetrics {
        self.metrics.lock().clone()
    }
}
