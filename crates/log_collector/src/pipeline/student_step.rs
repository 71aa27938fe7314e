//! Student step pipeline
//!
//! Records each navigation between units of a subsection and counts steps per
//! course and day.

use chrono::{DateTime, Utc};
use garde::Validate;
use redb::{TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};

use super::{
    course_key, increment_daily_total, insert_fact, scalar_string, time_key, validated,
    DailyTotal,
};
use crate::{
    error::CollectorResult,
    storage::{db_err, scan_json, Store},
    types::{CourseKey, EventEnvelope},
};

pub(crate) const EVENT_TYPES: &[&str] = &["seq_goto", "seq_next", "seq_prev"];

/// Facts keyed by (course, user id, subsection, event type, log time micros)
const STUDENT_STEPS: TableDefinition<(&str, &str, &str, &str, i64), &[u8]> =
    TableDefinition::new("student_step_course");
const STUDENT_STEP_BY_DAY: TableDefinition<(&str, i32), &[u8]> =
    TableDefinition::new("student_step_by_day");

/// Formatted navigation event
#[derive(Debug, Clone, PartialEq, Validate)]
pub struct StudentStepRecord {
    /// Navigation event type
    #[garde(length(min = 1))]
    pub event_type: String,
    /// Learner
    #[garde(length(min = 1))]
    pub user_id: String,
    /// Course
    #[garde(skip)]
    pub course: CourseKey,
    /// Subsection (sequence) identifier
    #[garde(length(min = 1))]
    pub subsection_id: String,
    /// Unit the learner left
    #[garde(length(min = 1))]
    pub current_unit: String,
    /// Unit the learner moved to
    #[garde(length(min = 1))]
    pub target_unit: String,
    /// Event time
    #[garde(skip)]
    pub log_time: DateTime<Utc>,
}

/// Stored navigation fact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentStepCourse {
    /// Navigation event type
    pub event_type: String,
    /// Learner
    pub user_id: String,
    /// Course identifier
    pub course: String,
    /// Subsection identifier
    pub subsection_id: String,
    /// Unit the learner left
    pub current_unit: String,
    /// Unit the learner moved to
    pub target_unit: String,
    /// Event time
    pub log_time: DateTime<Utc>,
}

pub(crate) fn format(event: &EventEnvelope) -> Option<StudentStepRecord> {
    let payload = event.payload()?;

    validated(StudentStepRecord {
        event_type: event.message_type.clone(),
        user_id: scalar_string(event.context("user_id"))?,
        course: course_key(event.context("course_id"))?,
        subsection_id: scalar_string(payload.get("id"))?,
        current_unit: scalar_string(payload.get("old"))?,
        target_unit: scalar_string(payload.get("new"))?,
        log_time: event.log_time,
    })
}

pub(crate) fn create_tables(txn: &WriteTransaction) -> CollectorResult<()> {
    txn.open_table(STUDENT_STEPS)
        .map_err(db_err("open_student_step_course"))?;
    txn.open_table(STUDENT_STEP_BY_DAY)
        .map_err(db_err("open_student_step_by_day"))?;
    Ok(())
}

pub(crate) fn apply(txn: &WriteTransaction, record: &StudentStepRecord) -> CollectorResult<()> {
    let course = record.course.to_string();
    let fact = StudentStepCourse {
        event_type: record.event_type.clone(),
        user_id: record.user_id.clone(),
        course: course.clone(),
        subsection_id: record.subsection_id.clone(),
        current_unit: record.current_unit.clone(),
        target_unit: record.target_unit.clone(),
        log_time: record.log_time,
    };

    let key = (
        course.as_str(),
        record.user_id.as_str(),
        record.subsection_id.as_str(),
        record.event_type.as_str(),
        time_key(record.log_time),
    );

    if insert_fact(txn, STUDENT_STEPS, key, &fact)? {
        increment_daily_total(txn, STUDENT_STEP_BY_DAY, &course, record.log_time.date_naive())?;
    }
    Ok(())
}

/// Daily step totals of a course, oldest day first
///
/// # Errors
///
/// Returns error if the table cannot be read
pub fn student_step_by_day(store: &Store, course: &str) -> CollectorResult<Vec<DailyTotal>> {
    let txn = store.begin_read()?;
    scan_json(&txn, STUDENT_STEP_BY_DAY, (course, i32::MIN)..=(course, i32::MAX))
}

/// Steps of one learner in a course, in key order
///
/// # Errors
///
/// Returns error if the table cannot be read
pub fn student_steps(
    store: &Store,
    course: &str,
    user_id: &str,
) -> CollectorResult<Vec<StudentStepCourse>> {
    let txn = store.begin_read()?;
    scan_json(
        &txn,
        STUDENT_STEPS,
        (course, user_id, "", "", i64::MIN)..(course, user_id, "\u{10FFFF}", "", i64::MIN),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::envelope;
    use serde_json::json;

    const COURSE: &str = "course-v1:edX+DemoX+Demo";

    fn step(event_type: &str, time: &str, old: u64, new: u64) -> EventEnvelope {
        let payload = json!({"id": "block-v1:edX+DemoX+Demo+type@sequential+block@s1", "old": old, "new": new});
        envelope(
            event_type,
            time,
            json!({
                "context": {"user_id": 9, "course_id": COURSE},
                "event": payload.to_string()
            }),
        )
    }

    #[test]
    fn test_steps_recorded_once_and_rolled_up() -> CollectorResult<()> {
        let store = Store::in_memory()?;
        let events = [
            step("seq_next", "2020-01-01T10:00:00Z", 1, 2),
            step("seq_next", "2020-01-01T10:00:00Z", 1, 2),
            step("seq_prev", "2020-01-01T10:05:00Z", 2, 1),
            step("seq_goto", "2020-01-02T08:00:00Z", 1, 4),
        ];
        for event in &events {
            let record = format(event);
            assert!(record.is_some());
            if let Some(record) = record {
                store.write("apply", |txn| apply(txn, &record))?;
            }
        }

        let totals: Vec<u64> = student_step_by_day(&store, COURSE)?
            .into_iter()
            .map(|d| d.total)
            .collect();
        assert_eq!(totals, vec![2, 1]);

        let steps = student_steps(&store, COURSE, "9")?;
        assert_eq!(steps.len(), 3);
        assert!(steps.iter().any(|s| s.target_unit == "4"));
        Ok(())
    }

    #[test]
    fn test_format_requires_units() {
        let event = envelope(
            "seq_goto",
            "2020-01-01T10:00:00Z",
            json!({
                "context": {"user_id": 9, "course_id": COURSE},
                "event": {"id": "s1"}
            }),
        );
        assert!(format(&event).is_none());
    }
}
