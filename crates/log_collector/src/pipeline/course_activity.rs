//! Course activity pipeline
//!
//! Tracks when each learner was last active in a course and how many distinct
//! learners were active per course and day.

use chrono::{DateTime, NaiveDate, Utc};
use garde::Validate;
use redb::{TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::{course_key, day_key, scalar_string, validated};
use crate::{
    error::CollectorResult,
    storage::{db_err, fetch_json, get_json, put_json, scan_json, Store},
    types::{CourseKey, EventEnvelope},
};

pub(crate) const EVENT_TYPES: &[&str] = &[
    "problem_check",
    "play_video",
    "seq_goto",
    "seq_next",
    "seq_prev",
    "edx.ui.lms.outline.selected",
    "edx.ui.lms.sequence.tab_selected",
    "edx.course.tool.accessed",
    "edx.bookmark.accessed",
];

const LAST_COURSE_VISIT: TableDefinition<(&str, &str), &[u8]> =
    TableDefinition::new("last_course_visit_by_user");
const COURSE_VISITS_BY_DAY: TableDefinition<(&str, i32), &[u8]> =
    TableDefinition::new("course_visits_by_day");

/// Formatted in-course interaction
#[derive(Debug, Clone, PartialEq, Validate)]
pub struct CourseActivityRecord {
    /// Interaction event type
    #[garde(length(min = 1))]
    pub event_type: String,
    /// Learner
    #[garde(length(min = 1))]
    pub user_id: String,
    /// Course
    #[garde(skip)]
    pub course: CourseKey,
    /// Event time
    #[garde(skip)]
    pub log_time: DateTime<Utc>,
}

/// Most recent activity of a learner in a course
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastCourseVisitByUser {
    /// Learner
    pub user_id: String,
    /// Course identifier
    pub course: String,
    /// Time of the latest activity
    pub log_time: DateTime<Utc>,
}

/// Distinct active learners of a course on one day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseVisitsByDay {
    /// Course identifier
    pub course: String,
    /// Calendar day (UTC)
    pub day: NaiveDate,
    /// Learners active that day
    pub user_ids: BTreeSet<String>,
    /// Number of distinct learners
    pub total: u64,
}

pub(crate) fn format(event: &EventEnvelope) -> Option<CourseActivityRecord> {
    validated(CourseActivityRecord {
        event_type: event.message_type.clone(),
        user_id: scalar_string(event.context("user_id"))?,
        course: course_key(event.context("course_id"))?,
        log_time: event.log_time,
    })
}

pub(crate) fn create_tables(txn: &WriteTransaction) -> CollectorResult<()> {
    txn.open_table(LAST_COURSE_VISIT)
        .map_err(db_err("open_last_course_visit"))?;
    txn.open_table(COURSE_VISITS_BY_DAY)
        .map_err(db_err("open_course_visits_by_day"))?;
    Ok(())
}

pub(crate) fn apply(txn: &WriteTransaction, record: &CourseActivityRecord) -> CollectorResult<()> {
    let course = record.course.to_string();
    let user = record.user_id.as_str();

    let visit_key = (user, course.as_str());
    let last: Option<LastCourseVisitByUser> = get_json(txn, LAST_COURSE_VISIT, visit_key)?;
    if last.map_or(true, |visit| record.log_time > visit.log_time) {
        let visit = LastCourseVisitByUser {
            user_id: record.user_id.clone(),
            course: course.clone(),
            log_time: record.log_time,
        };
        put_json(txn, LAST_COURSE_VISIT, visit_key, &visit)?;
    }

    let day = record.log_time.date_naive();
    let day_row_key = (course.as_str(), day_key(day));
    let mut visits: CourseVisitsByDay = get_json(txn, COURSE_VISITS_BY_DAY, day_row_key)?
        .unwrap_or_else(|| CourseVisitsByDay {
            course: course.clone(),
            day,
            user_ids: BTreeSet::new(),
            total: 0,
        });

    if visits.user_ids.insert(record.user_id.clone()) {
        visits.total += 1;
        put_json(txn, COURSE_VISITS_BY_DAY, day_row_key, &visits)?;
    }
    Ok(())
}

/// Latest activity of a learner in a course
///
/// # Errors
///
/// Returns error if the table cannot be read
pub fn last_course_visit(
    store: &Store,
    user_id: &str,
    course: &str,
) -> CollectorResult<Option<LastCourseVisitByUser>> {
    fetch_json(store, LAST_COURSE_VISIT, (user_id, course))
}

/// Distinct active learners of a course per day, oldest day first
///
/// # Errors
///
/// Returns error if the table cannot be read
pub fn course_visits_by_day(store: &Store, course: &str) -> CollectorResult<Vec<CourseVisitsByDay>> {
    let txn = store.begin_read()?;
    scan_json(&txn, COURSE_VISITS_BY_DAY, (course, i32::MIN)..=(course, i32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::envelope;
    use serde_json::json;

    const COURSE: &str = "MITx/6.002x/2012_Fall";

    fn activity(event_type: &str, time: &str, user: u64) -> EventEnvelope {
        envelope(
            event_type,
            time,
            json!({"context": {"user_id": user, "course_id": COURSE}, "event": {}}),
        )
    }

    fn apply_all(store: &Store, events: &[EventEnvelope]) -> CollectorResult<()> {
        for event in events {
            if let Some(record) = format(event) {
                store.write("apply", |txn| apply(txn, &record))?;
            }
        }
        Ok(())
    }

    #[test]
    fn test_last_visit_keeps_latest_time() -> CollectorResult<()> {
        let store = Store::in_memory()?;
        apply_all(
            &store,
            &[
                activity("problem_check", "2020-01-02T10:00:00Z", 1),
                activity("seq_next", "2020-01-01T10:00:00Z", 1),
            ],
        )?;

        let visit = last_course_visit(&store, "1", COURSE)?;
        assert_eq!(
            visit.map(|v| v.log_time.to_rfc3339()),
            Some("2020-01-02T10:00:00+00:00".to_string())
        );
        Ok(())
    }

    #[test]
    fn test_daily_visitors_are_distinct() -> CollectorResult<()> {
        let store = Store::in_memory()?;
        apply_all(
            &store,
            &[
                activity("problem_check", "2020-01-01T10:00:00Z", 1),
                activity("play_video", "2020-01-01T11:00:00Z", 1),
                activity("seq_goto", "2020-01-01T12:00:00Z", 2),
                activity("seq_goto", "2020-01-02T12:00:00Z", 2),
            ],
        )?;

        let days: Vec<u64> = course_visits_by_day(&store, COURSE)?
            .into_iter()
            .map(|d| d.total)
            .collect();
        assert_eq!(days, vec![2, 1]);
        Ok(())
    }
}
