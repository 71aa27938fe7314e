//! Enrollment pipeline
//!
//! Keeps one bucket per (course, day) with the day's enrollments,
//! unenrollments and the course's running total at the end of that day. A
//! change to day `d` shifts the total of every later bucket of the course by
//! the same delta, so totals stay a prefix sum regardless of arrival order.

use chrono::{DateTime, NaiveDate, Utc};
use redb::{ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};

use super::{course_key, day_key};
use crate::{
    error::CollectorResult,
    storage::{db_err, scan_json, Store},
    types::{CourseKey, EventEnvelope},
};

/// User enrolled in a course
pub const USER_ENROLLED: &str = "edx.course.enrollment.activated";
/// User left a course
pub const USER_UNENROLLED: &str = "edx.course.enrollment.deactivated";

pub(crate) const EVENT_TYPES: &[&str] = &[USER_ENROLLED, USER_UNENROLLED];

const ENROLLMENT_BY_DAY: TableDefinition<(&str, i32), &[u8]> =
    TableDefinition::new("enrollment_by_day");

/// Formatted enrollment event
///
/// Carries no free-form fields: a parsed course key is the only requirement.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrollmentRecord {
    /// Course
    pub course: CourseKey,
    /// `true` for an enrollment, `false` for an unenrollment
    pub is_enrolled: bool,
    /// Event time
    pub log_time: DateTime<Utc>,
}

/// Enrollment bucket of one course and day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentByDay {
    /// Course identifier
    pub course: String,
    /// Calendar day (UTC)
    pub day: NaiveDate,
    /// Enrollments that day
    pub enrolled: u64,
    /// Unenrollments that day
    pub unenrolled: u64,
    /// Enrolled learners at the end of the day
    pub total: i64,
    /// Processing date of the last write to this bucket
    pub last_updated: NaiveDate,
}

impl EnrollmentByDay {
    fn empty(course: &str, day: NaiveDate) -> Self {
        Self {
            course: course.to_string(),
            day,
            enrolled: 0,
            unenrolled: 0,
            total: 0,
            last_updated: Utc::now().date_naive(),
        }
    }

    fn net(&self) -> i64 {
        i64::try_from(self.enrolled).unwrap_or(i64::MAX)
            - i64::try_from(self.unenrolled).unwrap_or(i64::MAX)
    }
}

pub(crate) fn format(event: &EventEnvelope) -> Option<EnrollmentRecord> {
    let payload = event.payload()?;
    let course = course_key(payload.get("course_id"))?;

    Some(EnrollmentRecord {
        course,
        is_enrolled: event.message_type == USER_ENROLLED,
        log_time: event.log_time,
    })
}

pub(crate) fn create_tables(txn: &WriteTransaction) -> CollectorResult<()> {
    txn.open_table(ENROLLMENT_BY_DAY)
        .map_err(db_err("open_enrollment_by_day"))?;
    Ok(())
}

pub(crate) fn apply(txn: &WriteTransaction, record: &EnrollmentRecord) -> CollectorResult<()> {
    let course = record.course.to_string();
    let day = record.log_time.date_naive();
    let key = day_key(day);
    let delta: i64 = if record.is_enrolled { 1 } else { -1 };

    let mut table = txn
        .open_table(ENROLLMENT_BY_DAY)
        .map_err(db_err("open_enrollment_by_day"))?;

    let mut bucket = match table
        .get((course.as_str(), key))
        .map_err(db_err("get_enrollment_day"))?
    {
        Some(value) => serde_json::from_slice(value.value())?,
        None => EnrollmentByDay::empty(&course, day),
    };

    let previous_total = match table
        .range((course.as_str(), i32::MIN)..(course.as_str(), key))
        .map_err(db_err("scan_enrollment_days"))?
        .next_back()
    {
        Some(entry) => {
            let (_, value) = entry.map_err(db_err("scan_enrollment_days"))?;
            serde_json::from_slice::<EnrollmentByDay>(value.value())?.total
        }
        None => 0,
    };

    if record.is_enrolled {
        bucket.enrolled += 1;
    } else {
        bucket.unenrolled += 1;
    }
    bucket.total = previous_total + bucket.net();
    bucket.last_updated = Utc::now().date_naive();

    let bytes = serde_json::to_vec(&bucket)?;
    table
        .insert((course.as_str(), key), bytes.as_slice())
        .map_err(db_err("put_enrollment_day"))?;

    let mut later: Vec<EnrollmentByDay> = Vec::new();
    for entry in table
        .range((course.as_str(), key.saturating_add(1))..=(course.as_str(), i32::MAX))
        .map_err(db_err("scan_enrollment_days"))?
    {
        let (_, value) = entry.map_err(db_err("scan_enrollment_days"))?;
        later.push(serde_json::from_slice(value.value())?);
    }

    for mut row in later {
        row.total += delta;
        let bytes = serde_json::to_vec(&row)?;
        table
            .insert((course.as_str(), day_key(row.day)), bytes.as_slice())
            .map_err(db_err("shift_enrollment_day"))?;
    }

    Ok(())
}

/// Enrollment buckets of a course, most recent day first
///
/// # Errors
///
/// Returns error if the table cannot be read
pub fn enrollment_by_day(store: &Store, course: &str) -> CollectorResult<Vec<EnrollmentByDay>> {
    let txn = store.begin_read()?;
    let mut rows: Vec<EnrollmentByDay> =
        scan_json(&txn, ENROLLMENT_BY_DAY, (course, i32::MIN)..=(course, i32::MAX))?;
    rows.reverse();
    Ok(rows)
}
