//! Discussion pipeline
//!
//! Records each forum post once and counts new posts per course and day.

use chrono::{DateTime, Utc};
use garde::Validate;
use redb::{TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};

use super::{
    course_key, day_key, increment_daily_total, insert_fact, scalar_string, time_key, validated,
    DailyTotal,
};
use crate::{
    error::CollectorResult,
    storage::{db_err, fetch_json, scan_json, Store},
    types::{CourseKey, EventEnvelope},
};

pub(crate) const EVENT_TYPES: &[&str] = &[
    "edx.forum.thread.created",
    "edx.forum.response.created",
    "edx.forum.comment.created",
];

/// Facts keyed by (course, discussion id, user id, event type, log time micros)
const DISCUSSION_ACTIVITY: TableDefinition<(&str, &str, &str, &str, i64), &[u8]> =
    TableDefinition::new("discussion_activity");
const DISCUSSION_ACTIVITY_BY_DAY: TableDefinition<(&str, i32), &[u8]> =
    TableDefinition::new("discussion_activity_by_day");

/// Formatted forum event
#[derive(Debug, Clone, PartialEq, Validate)]
pub struct DiscussionRecord {
    /// Forum event type
    #[garde(length(min = 1))]
    pub event_type: String,
    /// Author
    #[garde(length(min = 1))]
    pub user_id: String,
    /// Course
    #[garde(skip)]
    pub course: CourseKey,
    /// Discussion category, if any
    #[garde(skip)]
    pub category_id: Option<String>,
    /// Commentable (topic) identifier
    #[garde(length(min = 1))]
    pub commentable_id: String,
    /// Post identifier
    #[garde(length(min = 1))]
    pub discussion_id: String,
    /// Thread type (`discussion`, `question`), if any
    #[garde(skip)]
    pub thread_type: Option<String>,
    /// Event time
    #[garde(skip)]
    pub log_time: DateTime<Utc>,
}

/// Stored forum post fact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscussionActivity {
    /// Forum event type
    pub event_type: String,
    /// Author
    pub user_id: String,
    /// Course identifier
    pub course: String,
    /// Discussion category, if any
    pub category_id: Option<String>,
    /// Commentable (topic) identifier
    pub commentable_id: String,
    /// Post identifier
    pub discussion_id: String,
    /// Thread type, if any
    pub thread_type: Option<String>,
    /// Event time
    pub log_time: DateTime<Utc>,
}

pub(crate) fn format(event: &EventEnvelope) -> Option<DiscussionRecord> {
    let payload = event.payload()?;

    validated(DiscussionRecord {
        event_type: event.message_type.clone(),
        user_id: scalar_string(event.context("user_id"))?,
        course: course_key(event.context("course_id"))?,
        category_id: scalar_string(payload.get("category_id")),
        commentable_id: scalar_string(payload.get("commentable_id"))?,
        discussion_id: scalar_string(payload.get("id"))?,
        thread_type: scalar_string(payload.get("thread_type")),
        log_time: event.log_time,
    })
}

pub(crate) fn create_tables(txn: &WriteTransaction) -> CollectorResult<()> {
    txn.open_table(DISCUSSION_ACTIVITY)
        .map_err(db_err("open_discussion_activity"))?;
    txn.open_table(DISCUSSION_ACTIVITY_BY_DAY)
        .map_err(db_err("open_discussion_activity_by_day"))?;
    Ok(())
}

pub(crate) fn apply(txn: &WriteTransaction, record: &DiscussionRecord) -> CollectorResult<()> {
    let course = record.course.to_string();
    let fact = DiscussionActivity {
        event_type: record.event_type.clone(),
        user_id: record.user_id.clone(),
        course: course.clone(),
        category_id: record.category_id.clone(),
        commentable_id: record.commentable_id.clone(),
        discussion_id: record.discussion_id.clone(),
        thread_type: record.thread_type.clone(),
        log_time: record.log_time,
    };

    let key = (
        course.as_str(),
        record.discussion_id.as_str(),
        record.user_id.as_str(),
        record.event_type.as_str(),
        time_key(record.log_time),
    );

    if insert_fact(txn, DISCUSSION_ACTIVITY, key, &fact)? {
        increment_daily_total(
            txn,
            DISCUSSION_ACTIVITY_BY_DAY,
            &course,
            record.log_time.date_naive(),
        )?;
    }
    Ok(())
}

/// Daily forum post totals of a course, oldest day first
///
/// # Errors
///
/// Returns error if the table cannot be read
pub fn discussion_activity_by_day(store: &Store, course: &str) -> CollectorResult<Vec<DailyTotal>> {
    let txn = store.begin_read()?;
    scan_json(
        &txn,
        DISCUSSION_ACTIVITY_BY_DAY,
        (course, i32::MIN)..=(course, i32::MAX),
    )
}

/// Forum post facts of one discussion, oldest first
///
/// # Errors
///
/// Returns error if the table cannot be read
pub fn discussion_activity(
    store: &Store,
    course: &str,
    discussion_id: &str,
) -> CollectorResult<Vec<DiscussionActivity>> {
    let txn = store.begin_read()?;
    let mut facts: Vec<DiscussionActivity> = scan_json(
        &txn,
        DISCUSSION_ACTIVITY,
        (course, discussion_id, "", "", i64::MIN)..(course, discussion_id, "\u{10FFFF}", "", i64::MIN),
    )?;
    facts.sort_by_key(|fact| fact.log_time);
    Ok(facts)
}

/// Forum post total of a course on one day
///
/// # Errors
///
/// Returns error if the table cannot be read
pub fn discussion_total_on(
    store: &Store,
    course: &str,
    day: chrono::NaiveDate,
) -> CollectorResult<u64> {
    let row: Option<DailyTotal> = fetch_json(store, DISCUSSION_ACTIVITY_BY_DAY, (course, day_key(day)))?;
    Ok(row.map_or(0, |r| r.total))
}
