//! Pipeline orchestration
//!
//! Runs the enabled pipelines in order over the stored raw events, routes live
//! events straight to the matching pipelines and prunes raw events every
//! pipeline has consumed.

use tracing::{debug, error, info};

use crate::{
    config::PipelineConfig,
    error::CollectorResult,
    pipeline::{PipelineKind, PipelineRunner, PipelineStats},
    storage::{CheckpointStore, EventRepository},
    types::EventEnvelope,
};

/// Result of running every enabled pipeline once
#[derive(Debug, Clone, Default)]
pub struct ProcessReport {
    /// Pipelines that ran to completion
    pub completed: Vec<(PipelineKind, PipelineStats)>,
    /// Pipelines stopped by an error; retried on the next run
    pub failed: Vec<PipelineKind>,
}

impl ProcessReport {
    /// Records applied across all pipelines
    #[must_use]
    pub fn applied(&self) -> u64 {
        self.completed.iter().map(|(_, stats)| stats.applied).sum()
    }
}

/// Runs pipelines and cleans up consumed raw events
#[derive(Debug, Clone)]
pub struct Processor {
    repository: EventRepository,
    runner: PipelineRunner,
    checkpoints: CheckpointStore,
    pipelines: Vec<PipelineKind>,
}

impl Processor {
    /// Create processor for the pipelines enabled in `config`
    #[must_use]
    pub fn new(repository: EventRepository, config: &PipelineConfig) -> Self {
        Self {
            runner: PipelineRunner::new(repository.clone(), config),
            checkpoints: CheckpointStore::new(repository.store().clone()),
            repository,
            pipelines: config.enabled.clone(),
        }
    }

    /// Enabled pipelines in run order
    #[must_use]
    pub fn pipelines(&self) -> &[PipelineKind] {
        &self.pipelines
    }

    /// Checkpoint access
    #[must_use]
    pub const fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Pipeline driver
    #[must_use]
    pub const fn runner(&self) -> &PipelineRunner {
        &self.runner
    }

    /// Run every enabled pipeline to completion, one after another
    ///
    /// A failing pipeline is logged and skipped; the others still run.
    /// Blocking; call from a blocking context.
    pub fn process(&self) -> ProcessReport {
        let mut report = ProcessReport::default();

        for kind in &self.pipelines {
            match self.runner.run(*kind) {
                Ok(stats) => report.completed.push((*kind, stats)),
                Err(e) => {
                    error!("Pipeline {} stopped: {}", kind, e);
                    report.failed.push(*kind);
                }
            }
        }

        report
    }

    /// Apply a single live event to every matching pipeline
    ///
    /// Checkpoints are not read or moved. Returns the number of pipelines
    /// that applied the event.
    ///
    /// # Errors
    ///
    /// Returns error if an aggregate write fails
    pub fn process_live(&self, event: &EventEnvelope) -> CollectorResult<usize> {
        let mut applied = 0;

        for kind in &self.pipelines {
            let Some(record) = kind.format(event) else {
                continue;
            };
            self.repository
                .store()
                .write("apply_live", |txn| record.apply(txn))?;
            applied += 1;
        }

        debug!(
            "Live {} event applied by {} pipelines",
            event.message_type, applied
        );
        Ok(applied)
    }

    /// Delete raw events consumed by every enabled pipeline
    ///
    /// Nothing is deleted while any enabled pipeline has no checkpoint.
    ///
    /// # Errors
    ///
    /// Returns error if checkpoints cannot be read or the deletion fails
    pub fn delete_logs(&self) -> CollectorResult<u64> {
        let ids: Vec<&str> = self.pipelines.iter().map(|kind| kind.id()).collect();

        let Some(up_to) = self.checkpoints.min_across(&ids)? else {
            info!("Not every pipeline has a checkpoint yet, keeping raw events");
            return Ok(0);
        };

        let deleted = self.repository.delete_consumed(up_to)?;
        info!("Deleted {} raw events up to {}", deleted, up_to);
        Ok(deleted)
    }
}
