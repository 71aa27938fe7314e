//! Pipeline checkpoints
//!
//! A checkpoint is the `log_time` of the most recent raw event a pipeline has
//! applied. It only moves forward, and it is written in the same transaction
//! as the aggregate updates it covers.

use chrono::{DateTime, Utc};
use redb::{ReadableTable, WriteTransaction};

use super::{db_err, Store, CHECKPOINTS};
use crate::{
    error::{CollectorError, CollectorResult},
    types::{from_micros, PipelineCheckpoint},
};

/// Read access to pipeline checkpoints
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    store: Store,
}

impl CheckpointStore {
    /// Create checkpoint store
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    /// Current checkpoint of a pipeline, if it has applied anything yet
    ///
    /// # Errors
    ///
    /// Returns error if the checkpoints table cannot be read
    pub fn get(&self, pipeline_id: &str) -> CollectorResult<Option<PipelineCheckpoint>> {
        let txn = self.store.begin_read()?;
        let table = txn
            .open_table(CHECKPOINTS)
            .map_err(db_err("open_checkpoints"))?;
        let micros = table
            .get(pipeline_id)
            .map_err(db_err("get_checkpoint"))?
            .map(|guard| guard.value());

        micros
            .map(|micros| to_checkpoint(pipeline_id, micros))
            .transpose()
    }

    /// Every stored checkpoint, ordered by pipeline id
    ///
    /// # Errors
    ///
    /// Returns error if the checkpoints table cannot be read
    pub fn all(&self) -> CollectorResult<Vec<PipelineCheckpoint>> {
        let txn = self.store.begin_read()?;
        let table = txn
            .open_table(CHECKPOINTS)
            .map_err(db_err("open_checkpoints"))?;

        let mut checkpoints = Vec::new();
        for entry in table.iter().map_err(db_err("scan_checkpoints"))? {
            let (id, micros) = entry.map_err(db_err("scan_checkpoints"))?;
            checkpoints.push(to_checkpoint(id.value(), micros.value())?);
        }
        Ok(checkpoints)
    }

    /// Oldest checkpoint across the given pipelines
    ///
    /// Returns `None` when any of them has no checkpoint yet, since that
    /// pipeline has not consumed anything.
    ///
    /// # Errors
    ///
    /// Returns error if the checkpoints table cannot be read
    pub fn min_across(&self, pipeline_ids: &[&str]) -> CollectorResult<Option<DateTime<Utc>>> {
        if pipeline_ids.is_empty() {
            return Ok(None);
        }

        let mut oldest: Option<DateTime<Utc>> = None;
        for id in pipeline_ids {
            match self.get(id)? {
                Some(checkpoint) => {
                    oldest = Some(oldest.map_or(checkpoint.last_event_time, |current| {
                        current.min(checkpoint.last_event_time)
                    }));
                }
                None => return Ok(None),
            }
        }
        Ok(oldest)
    }
}

/// Move a pipeline's checkpoint forward inside an open write transaction
///
/// An older or equal time leaves the stored checkpoint untouched.
pub(crate) fn advance(
    txn: &WriteTransaction,
    pipeline_id: &str,
    event_time: DateTime<Utc>,
) -> CollectorResult<()> {
    let micros = event_time.timestamp_micros();
    let mut table = txn
        .open_table(CHECKPOINTS)
        .map_err(db_err("open_checkpoints"))?;

    let current = table
        .get(pipeline_id)
        .map_err(db_err("get_checkpoint"))?
        .map(|guard| guard.value());

    if current.map_or(true, |stored| micros > stored) {
        table
            .insert(pipeline_id, micros)
            .map_err(db_err("set_checkpoint"))?;
    }
    Ok(())
}

fn to_checkpoint(pipeline_id: &str, micros: i64) -> CollectorResult<PipelineCheckpoint> {
    let last_event_time = from_micros(micros).ok_or_else(|| {
        CollectorError::database("decode_checkpoint", format!("invalid time {micros}"))
    })?;
    Ok(PipelineCheckpoint {
        pipeline_id: pipeline_id.to_string(),
        last_event_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_checkpoint_only_moves_forward() -> CollectorResult<()> {
        let store = Store::in_memory()?;
        let checkpoints = CheckpointStore::new(store.clone());
        assert!(checkpoints.get("enrollment")?.is_none());

        let later = Utc.with_ymd_and_hms(2020, 1, 3, 0, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();

        store.write("advance", |txn| advance(txn, "enrollment", later))?;
        store.write("advance", |txn| advance(txn, "enrollment", earlier))?;

        let stored = checkpoints.get("enrollment")?;
        assert_eq!(stored.map(|c| c.last_event_time), Some(later));
        Ok(())
    }

    #[test]
    fn test_min_across_requires_every_pipeline() -> CollectorResult<()> {
        let store = Store::in_memory()?;
        let checkpoints = CheckpointStore::new(store.clone());

        let jan1 = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let jan5 = Utc.with_ymd_and_hms(2020, 1, 5, 0, 0, 0).unwrap();

        store.write("advance", |txn| advance(txn, "enrollment", jan5))?;
        assert!(checkpoints
            .min_across(&["enrollment", "video_views"])?
            .is_none());

        store.write("advance", |txn| advance(txn, "video_views", jan1))?;
        assert_eq!(
            checkpoints.min_across(&["enrollment", "video_views"])?,
            Some(jan1)
        );
        assert_eq!(checkpoints.all()?.len(), 2);
        Ok(())
    }
}
