//! Event repository
//!
//! Parses tracking-log lines into [`RawEvent`]s, stores them deduplicated on
//! (log time, type hash, user name) and tracks which archived source units
//! have been consumed completely.

use chrono::{DateTime, Utc};
use redb::{ReadableTable, ReadableTableMetadata, WriteTransaction};
use std::collections::HashSet;
use std::io::BufRead;
use tracing::{debug, error, warn};

use super::{db_err, fetch_json, put_json, Store, PROCESSED_SOURCES, RAW_EVENTS};
use crate::{
    error::{CollectorError, CollectorResult},
    types::{message_type_hash, ProcessedSource, RawEvent},
};

/// Counters for one ingested unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Non-blank lines read
    pub lines: u64,
    /// New raw events stored
    pub stored: u64,
    /// Lines whose event was already stored
    pub duplicates: u64,
    /// Lines that could not be parsed
    pub malformed: u64,
    /// Lines lost to storage failures
    pub dropped: u64,
}

impl IngestStats {
    /// Add another unit's counters to these
    pub fn merge(&mut self, other: &Self) {
        self.lines += other.lines;
        self.stored += other.stored;
        self.duplicates += other.duplicates;
        self.malformed += other.malformed;
        self.dropped += other.dropped;
    }
}

/// Raw event store
#[derive(Debug, Clone)]
pub struct EventRepository {
    store: Store,
    batch_size: usize,
}

impl EventRepository {
    /// Create repository committing `batch_size` lines per transaction
    #[must_use]
    pub fn new(store: Store, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Underlying database handle
    #[must_use]
    pub const fn store(&self) -> &Store {
        &self.store
    }

    /// Store a single line
    ///
    /// Malformed lines and lines that fail to store are logged and counted,
    /// never returned as errors.
    ///
    /// # Errors
    ///
    /// Storage failures are counted in `dropped`; no error is returned
    pub fn store_line(&self, line: &str) -> CollectorResult<IngestStats> {
        let mut stats = IngestStats::default();
        if let Some(event) = parse_line(line, &mut stats) {
            self.store_one(&event, &mut stats, insert_events);
        }
        Ok(stats)
    }

    /// Store every line of a reader, batching commits
    ///
    /// Lines are split on `\n` with a trailing `\r` removed. Blank lines are
    /// skipped, lines that are not UTF-8 or not valid events count as
    /// malformed. A batch that fails to commit is retried line by line so only
    /// the failing lines are dropped.
    ///
    /// # Errors
    ///
    /// Returns error if the reader itself fails
    pub fn store_lines<R: BufRead>(&self, reader: R) -> CollectorResult<IngestStats> {
        let mut stats = IngestStats::default();
        let mut pending: Vec<RawEvent> = Vec::with_capacity(self.batch_size);

        for chunk in reader.split(b'\n') {
            let mut bytes = chunk?;
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }

            let line = match String::from_utf8(bytes) {
                Ok(line) => line,
                Err(_) => {
                    stats.lines += 1;
                    stats.malformed += 1;
                    warn!("Skipping line that is not valid UTF-8");
                    continue;
                }
            };

            if let Some(event) = parse_line(&line, &mut stats) {
                pending.push(event);
            }

            if pending.len() >= self.batch_size {
                self.flush(&mut pending, &mut stats);
            }
        }

        self.flush(&mut pending, &mut stats);
        Ok(stats)
    }

    fn flush(&self, pending: &mut Vec<RawEvent>, stats: &mut IngestStats) {
        self.flush_with(pending, stats, insert_events);
    }

    fn flush_with(&self, pending: &mut Vec<RawEvent>, stats: &mut IngestStats, insert: Inserter) {
        if pending.is_empty() {
            return;
        }

        match self
            .store
            .write("store_batch", |txn| insert(txn, pending.as_slice()))
        {
            Ok((stored, duplicates)) => {
                stats.stored += stored;
                stats.duplicates += duplicates;
            }
            Err(e) => {
                warn!(
                    "Batch of {} events failed ({}), retrying one by one",
                    pending.len(),
                    e
                );
                for event in pending.iter() {
                    self.store_one(event, stats, insert);
                }
            }
        }

        pending.clear();
    }

    /// Store one event in its own transaction; a failure drops the event
    fn store_one(&self, event: &RawEvent, stats: &mut IngestStats, insert: Inserter) {
        match self
            .store
            .write("store_event", |txn| insert(txn, std::slice::from_ref(event)))
        {
            Ok((stored, duplicates)) => {
                stats.stored += stored;
                stats.duplicates += duplicates;
            }
            Err(e) => {
                stats.dropped += 1;
                error!(
                    "Dropping event {} at {}: {}",
                    event.message_type, event.log_time, e
                );
            }
        }
    }

    /// Check whether a source unit was consumed completely
    ///
    /// # Errors
    ///
    /// Returns error if the processed-sources table cannot be read
    pub fn is_unit_processed(&self, unit_name: &str) -> CollectorResult<bool> {
        let txn = self.store.begin_read()?;
        let table = txn
            .open_table(PROCESSED_SOURCES)
            .map_err(db_err("open_processed_sources"))?;
        let found = table
            .get(unit_name)
            .map_err(db_err("get_processed_source"))?
            .is_some();
        Ok(found)
    }

    /// Record that a source unit was consumed completely
    ///
    /// Marking an already processed unit refreshes its timestamp.
    ///
    /// # Errors
    ///
    /// Returns error if the marker cannot be written
    pub fn mark_unit_processed(&self, unit_name: &str) -> CollectorResult<()> {
        let marker = ProcessedSource {
            source_name: unit_name.to_string(),
            processed_at: Utc::now(),
        };
        self.store.write("mark_processed", |txn| {
            put_json(txn, PROCESSED_SOURCES, unit_name, &marker)
        })
    }

    /// Processed-source marker of a unit
    ///
    /// # Errors
    ///
    /// Returns error if the marker cannot be read
    pub fn processed_unit(&self, unit_name: &str) -> CollectorResult<Option<ProcessedSource>> {
        fetch_json(&self.store, PROCESSED_SOURCES, unit_name)
    }

    /// Names of all processed units, sorted
    ///
    /// # Errors
    ///
    /// Returns error if the processed-sources table cannot be read
    pub fn processed_units(&self) -> CollectorResult<Vec<String>> {
        let txn = self.store.begin_read()?;
        let table = txn
            .open_table(PROCESSED_SOURCES)
            .map_err(db_err("open_processed_sources"))?;

        let mut names = Vec::new();
        for entry in table.iter().map_err(db_err("scan_processed_sources"))? {
            let (name, _) = entry.map_err(db_err("scan_processed_sources"))?;
            names.push(name.value().to_string());
        }
        Ok(names)
    }

    /// Number of stored raw events
    ///
    /// # Errors
    ///
    /// Returns error if the raw events table cannot be read
    pub fn count(&self) -> CollectorResult<u64> {
        let txn = self.store.begin_read()?;
        let table = txn
            .open_table(RAW_EVENTS)
            .map_err(db_err("open_raw_events"))?;
        table.len().map_err(db_err("count_raw_events"))
    }

    /// Raw events of the given types with `log_time` after `after`, oldest first
    ///
    /// At least `limit` events are returned when that many exist; the page is
    /// extended past `limit` so that events sharing one `log_time` are never
    /// split across pages.
    ///
    /// # Errors
    ///
    /// Returns error if the raw events table cannot be read or decoded
    pub fn select_after(
        &self,
        message_types: &[&str],
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> CollectorResult<Vec<RawEvent>> {
        let hashes: HashSet<String> = message_types
            .iter()
            .map(|t| message_type_hash(t))
            .collect();
        let start = after.map_or(i64::MIN, |t| t.timestamp_micros().saturating_add(1));

        let txn = self.store.begin_read()?;
        let table = txn
            .open_table(RAW_EVENTS)
            .map_err(db_err("open_raw_events"))?;

        let mut events: Vec<RawEvent> = Vec::new();
        for entry in table
            .range((start, "", "")..)
            .map_err(db_err("scan_raw_events"))?
        {
            let (key, value) = entry.map_err(db_err("scan_raw_events"))?;
            let (micros, hash, _) = key.value();
            if !hashes.contains(hash) {
                continue;
            }

            let group_closed = events
                .last()
                .map_or(false, |last| last.log_time.timestamp_micros() != micros);
            if events.len() >= limit.max(1) && group_closed {
                break;
            }

            events.push(serde_json::from_slice(value.value())?);
        }

        debug!(
            "Selected {} raw events after {:?} for {} types",
            events.len(),
            after,
            message_types.len()
        );
        Ok(events)
    }

    /// Delete every raw event with `log_time <= up_to`
    ///
    /// # Errors
    ///
    /// Returns error if the deletion transaction fails
    pub fn delete_consumed(&self, up_to: DateTime<Utc>) -> CollectorResult<u64> {
        let end = up_to.timestamp_micros().saturating_add(1);

        self.store.write("delete_consumed", |txn| {
            let mut table = txn
                .open_table(RAW_EVENTS)
                .map_err(db_err("open_raw_events"))?;

            let mut keys: Vec<(i64, String, String)> = Vec::new();
            for entry in table
                .range(..(end, "", ""))
                .map_err(db_err("scan_raw_events"))?
            {
                let (key, _) = entry.map_err(db_err("scan_raw_events"))?;
                let (micros, hash, user) = key.value();
                keys.push((micros, hash.to_string(), user.to_string()));
            }

            for (micros, hash, user) in &keys {
                table
                    .remove((*micros, hash.as_str(), user.as_str()))
                    .map_err(db_err("delete_raw_event"))?;
            }

            u64::try_from(keys.len())
                .map_err(|e| CollectorError::internal(format!("delete count overflow: {e}")))
        })
    }
}

fn parse_line(line: &str, stats: &mut IngestStats) -> Option<RawEvent> {
    if line.trim().is_empty() {
        return None;
    }

    stats.lines += 1;
    match RawEvent::parse(line) {
        Ok(event) => Some(event),
        Err(e) => {
            stats.malformed += 1;
            warn!("Skipping malformed tracking log line: {}", e);
            None
        }
    }
}

/// Raw event writer used by a storage transaction
type Inserter = fn(&WriteTransaction, &[RawEvent]) -> CollectorResult<(u64, u64)>;

/// Insert events whose dedup key is not yet present; returns (stored, duplicates)
fn insert_events(txn: &WriteTransaction, events: &[RawEvent]) -> CollectorResult<(u64, u64)> {
    let mut table = txn
        .open_table(RAW_EVENTS)
        .map_err(db_err("open_raw_events"))?;

    let mut stored = 0;
    let mut duplicates = 0;
    for event in events {
        let key = event.key();
        let exists = table
            .get(key)
            .map_err(db_err("get_raw_event"))?
            .is_some();
        if exists {
            duplicates += 1;
            continue;
        }

        let bytes = serde_json::to_vec(event)?;
        table
            .insert(key, bytes.as_slice())
            .map_err(db_err("insert_raw_event"))?;
        stored += 1;
    }
    Ok((stored, duplicates))
}
