//! Aggregation pipelines
//!
//! Each [`PipelineKind`] declares the event types it consumes, how a raw event
//! is formatted into a domain [`Record`] and how that record is applied to its
//! aggregate tables. Selection and checkpointing are shared and live in
//! [`runner`].

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use garde::Validate;
use redb::{TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::debug;

use crate::{
    error::CollectorResult,
    storage::{db_err, get_json, put_json},
    types::{CourseKey, EventEnvelope},
};

pub mod course_activity;
pub mod discussion;
pub mod enrollment;
pub mod runner;
pub mod student_step;
pub mod video_views;

pub use course_activity::{CourseActivityRecord, CourseVisitsByDay, LastCourseVisitByUser};
pub use discussion::{DiscussionActivity, DiscussionRecord};
pub use enrollment::{EnrollmentByDay, EnrollmentRecord};
pub use runner::{PipelineRunner, PipelineStats};
pub use student_step::{StudentStepCourse, StudentStepRecord};
pub use video_views::{VideoViewRecord, VideoViewsByBlock, VideoViewsByDay, VideoViewsByUser};

/// The fixed set of aggregation pipelines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    /// Enrollments per course and day with a rolling total
    Enrollment,
    /// Video views per day, user and block
    VideoViews,
    /// Forum activity facts and daily totals
    Discussion,
    /// Course navigation steps and daily totals
    StudentStep,
    /// Last visit per user and distinct visitors per day
    CourseActivity,
}

impl PipelineKind {
    /// All pipelines in their default run order
    pub const ALL: [Self; 5] = [
        Self::Enrollment,
        Self::VideoViews,
        Self::Discussion,
        Self::StudentStep,
        Self::CourseActivity,
    ];

    /// Stable identifier, used as the checkpoint key
    #[must_use]
    pub const fn id(self) -> &'static str {
        match self {
            Self::Enrollment => "enrollment",
            Self::VideoViews => "video_views",
            Self::Discussion => "discussion",
            Self::StudentStep => "student_step",
            Self::CourseActivity => "course_activity",
        }
    }

    /// Event types this pipeline consumes
    #[must_use]
    pub const fn event_types(self) -> &'static [&'static str] {
        match self {
            Self::Enrollment => enrollment::EVENT_TYPES,
            Self::VideoViews => video_views::EVENT_TYPES,
            Self::Discussion => discussion::EVENT_TYPES,
            Self::StudentStep => student_step::EVENT_TYPES,
            Self::CourseActivity => course_activity::EVENT_TYPES,
        }
    }

    /// Whether this pipeline consumes `message_type`
    #[must_use]
    pub fn accepts(self, message_type: &str) -> bool {
        self.event_types().contains(&message_type)
    }

    /// Map an event to this pipeline's record; `None` drops the event
    #[must_use]
    pub fn format(self, event: &EventEnvelope) -> Option<Record> {
        if !self.accepts(&event.message_type) {
            return None;
        }

        let record = match self {
            Self::Enrollment => enrollment::format(event).map(Record::Enrollment),
            Self::VideoViews => video_views::format(event).map(Record::VideoView),
            Self::Discussion => discussion::format(event).map(Record::Discussion),
            Self::StudentStep => student_step::format(event).map(Record::StudentStep),
            Self::CourseActivity => course_activity::format(event).map(Record::CourseActivity),
        };

        if record.is_none() {
            debug!(
                "{} dropped {} event at {}",
                self.id(),
                event.message_type,
                event.log_time
            );
        }
        record
    }

    /// Create this pipeline's aggregate tables
    pub(crate) fn create_tables(self, txn: &WriteTransaction) -> CollectorResult<()> {
        match self {
            Self::Enrollment => enrollment::create_tables(txn),
            Self::VideoViews => video_views::create_tables(txn),
            Self::Discussion => discussion::create_tables(txn),
            Self::StudentStep => student_step::create_tables(txn),
            Self::CourseActivity => course_activity::create_tables(txn),
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// A formatted, validated domain record
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// Enrollment or unenrollment
    Enrollment(EnrollmentRecord),
    /// Video player interaction
    VideoView(VideoViewRecord),
    /// Forum post
    Discussion(DiscussionRecord),
    /// Navigation between course units
    StudentStep(StudentStepRecord),
    /// Any in-course interaction
    CourseActivity(CourseActivityRecord),
}

impl Record {
    /// Apply the record to its aggregates inside an open write transaction
    ///
    /// # Errors
    ///
    /// Returns error if an aggregate cannot be read or written
    pub fn apply(&self, txn: &WriteTransaction) -> CollectorResult<()> {
        match self {
            Self::Enrollment(record) => enrollment::apply(txn, record),
            Self::VideoView(record) => video_views::apply(txn, record),
            Self::Discussion(record) => discussion::apply(txn, record),
            Self::StudentStep(record) => student_step::apply(txn, record),
            Self::CourseActivity(record) => course_activity::apply(txn, record),
        }
    }
}

/// Per-course daily counter used by the fact-plus-rollup pipelines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyTotal {
    /// Course identifier
    pub course: String,
    /// Calendar day (UTC)
    pub day: NaiveDate,
    /// Number of facts recorded that day
    pub total: u64,
}

/// Table key of a calendar day
pub(crate) fn day_key(day: NaiveDate) -> i32 {
    day.num_days_from_ce()
}

/// Increment the (course, day) counter of a daily-total table
pub(crate) fn increment_daily_total(
    txn: &WriteTransaction,
    table: TableDefinition<'_, (&'static str, i32), &'static [u8]>,
    course: &str,
    day: NaiveDate,
) -> CollectorResult<()> {
    let key = (course, day_key(day));
    let mut row: DailyTotal = get_json(txn, table, key)?.unwrap_or_else(|| DailyTotal {
        course: course.to_string(),
        day,
        total: 0,
    });
    row.total += 1;
    put_json(txn, table, key, &row)
}

/// Insert a fact row unless its key already exists; true when inserted
pub(crate) fn insert_fact<'k, K, T>(
    txn: &WriteTransaction,
    table: TableDefinition<'_, K, &'static [u8]>,
    key: K::SelfType<'k>,
    fact: &T,
) -> CollectorResult<bool>
where
    K: redb::Key + 'static,
    T: Serialize,
{
    use redb::ReadableTable;

    let bytes = serde_json::to_vec(fact)?;
    let mut open = txn.open_table(table).map_err(db_err("open_table"))?;
    let exists = open
        .get(&key)
        .map_err(db_err("get_fact"))?
        .is_some();
    if exists {
        return Ok(false);
    }

    open.insert(key, bytes.as_slice())
        .map_err(db_err("insert_fact"))?;
    Ok(true)
}

/// Run declarative validation, logging the rejection
pub(crate) fn validated<T>(record: T) -> Option<T>
where
    T: Validate<Context = ()> + fmt::Debug,
{
    match record.validate(&()) {
        Ok(()) => Some(record),
        Err(e) => {
            debug!("Rejected record {:?}: {}", record, e);
            None
        }
    }
}

/// String view of a scalar JSON field; numbers are rendered, empty strings are absent
pub(crate) fn scalar_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse a course key field, logging unparseable identifiers
pub(crate) fn course_key(value: Option<&Value>) -> Option<CourseKey> {
    let raw = value?.as_str()?;
    match CourseKey::parse(raw) {
        Ok(key) => Some(key),
        Err(e) => {
            debug!("Unparseable course identifier: {}", e);
            None
        }
    }
}

/// Microsecond table key of an event time
pub(crate) fn time_key(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros()
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::types::EventEnvelope;
    use serde_json::Value;

    /// Envelope for an event at `time` (RFC 3339)
    pub fn envelope(event_type: &str, time: &str, body: Value) -> EventEnvelope {
        let mut body = body;
        if let Value::Object(ref mut map) = body {
            map.insert("event_type".to_string(), Value::from(event_type));
            map.insert("time".to_string(), Value::from(time));
        }
        EventEnvelope::from_event(body).expect("test envelope")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_are_stable() {
        let ids: Vec<&str> = PipelineKind::ALL.iter().map(|k| k.id()).collect();
        assert_eq!(
            ids,
            vec!["enrollment", "video_views", "discussion", "student_step", "course_activity"]
        );
    }

    #[test]
    fn test_kind_serde_uses_ids() -> CollectorResult<()> {
        let parsed: PipelineKind = serde_json::from_str("\"video_views\"")?;
        assert_eq!(parsed, PipelineKind::VideoViews);
        Ok(())
    }

    #[test]
    fn test_format_ignores_foreign_types() {
        let event = test_support::envelope(
            "play_video",
            "2020-01-01T00:00:00Z",
            json!({"event": {"course_id": "course-v1:edX+DemoX+Demo"}}),
        );
        assert!(PipelineKind::Enrollment.format(&event).is_none());
    }

    #[test]
    fn test_scalar_string() {
        assert_eq!(scalar_string(Some(&json!(42))), Some("42".to_string()));
        assert_eq!(scalar_string(Some(&json!("7"))), Some("7".to_string()));
        assert_eq!(scalar_string(Some(&json!(""))), None);
        assert_eq!(scalar_string(Some(&json!(null))), None);
        assert_eq!(scalar_string(None), None);
    }
}
