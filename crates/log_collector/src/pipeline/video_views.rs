//! Video views pipeline
//!
//! Three aggregates per course and video block: daily views with distinct
//! viewers, per-user progress and per-block completion counters. A user's
//! progress only grows and freezes once the video is completed.

use chrono::{DateTime, NaiveDate, Utc};
use garde::Validate;
use redb::{TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use super::{course_key, day_key, scalar_string, validated};
use crate::{
    error::CollectorResult,
    storage::{db_err, fetch_json, get_json, put_json, scan_json, Store},
    types::{CourseKey, EventEnvelope},
};

pub(crate) const EVENT_TYPES: &[&str] = &[
    "play_video",
    "pause_video",
    "seek_video",
    "stop_video",
    "edx.video.played",
    "edx.video.paused",
    "edx.video.position.changed",
    "edx.video.stopped",
];

/// Event types that mark a video as watched to the end
pub const COMPLETION_TYPES: &[&str] = &["stop_video", "edx.video.stopped"];

const VIDEO_VIEWS_BY_DAY: TableDefinition<(&str, &str, i32), &[u8]> =
    TableDefinition::new("video_views_by_day");
const VIDEO_VIEWS_BY_USER: TableDefinition<(&str, &str, &str), &[u8]> =
    TableDefinition::new("video_views_by_user");
const VIDEO_VIEWS_BY_BLOCK: TableDefinition<(&str, &str), &[u8]> =
    TableDefinition::new("video_views_by_block");

/// Formatted video player event
#[derive(Debug, Clone, PartialEq, Validate)]
pub struct VideoViewRecord {
    /// Player event type
    #[garde(length(min = 1))]
    pub event_type: String,
    /// Viewer
    #[garde(length(min = 1))]
    pub user_id: String,
    /// Course
    #[garde(skip)]
    pub course: CourseKey,
    /// Video block identifier
    #[garde(length(min = 1))]
    pub video_block_id: String,
    /// Player position in whole seconds
    #[garde(skip)]
    pub viewed_time: u64,
    /// Whether this event completes the video
    #[garde(skip)]
    pub is_completed: bool,
    /// Event time
    #[garde(skip)]
    pub log_time: DateTime<Utc>,
}

/// Views of one video block on one day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoViewsByDay {
    /// Course identifier
    pub course: String,
    /// Video block identifier
    pub video_block_id: String,
    /// Calendar day (UTC)
    pub day: NaiveDate,
    /// Distinct viewers that day
    pub total: u64,
    /// Viewers seen that day
    pub user_ids: BTreeSet<String>,
}

/// Progress of one user on one video block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoViewsByUser {
    /// Course identifier
    pub course: String,
    /// Viewer
    pub user_id: String,
    /// Video block identifier
    pub video_block_id: String,
    /// Whether the user watched to the end
    pub is_completed: bool,
    /// Furthest position reached, in seconds
    pub viewed_time: u64,
}

/// Completion counters of one video block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoViewsByBlock {
    /// Course identifier
    pub course: String,
    /// Video block identifier
    pub video_block_id: String,
    /// Users who completed the video
    pub count_full_viewed: u64,
    /// Users who started but have not completed it
    pub count_part_viewed: u64,
    /// Viewed time of the most recent completion, in seconds
    pub video_duration: u64,
}

/// Whole seconds of a `currentTime` value; unusable values count as zero
fn whole_seconds(value: Option<&Value>) -> u64 {
    let seconds = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match seconds {
        Some(s) if s.is_finite() && s > 0.0 => s.trunc() as u64,
        _ => 0,
    }
}

pub(crate) fn format(event: &EventEnvelope) -> Option<VideoViewRecord> {
    let payload = event.payload()?;

    validated(VideoViewRecord {
        event_type: event.message_type.clone(),
        user_id: scalar_string(event.context("user_id"))?,
        course: course_key(event.context("course_id"))?,
        video_block_id: scalar_string(payload.get("id"))?,
        viewed_time: whole_seconds(payload.get("currentTime")),
        is_completed: COMPLETION_TYPES.contains(&event.message_type.as_str()),
        log_time: event.log_time,
    })
}

pub(crate) fn create_tables(txn: &WriteTransaction) -> CollectorResult<()> {
    txn.open_table(VIDEO_VIEWS_BY_DAY)
        .map_err(db_err("open_video_views_by_day"))?;
    txn.open_table(VIDEO_VIEWS_BY_USER)
        .map_err(db_err("open_video_views_by_user"))?;
    txn.open_table(VIDEO_VIEWS_BY_BLOCK)
        .map_err(db_err("open_video_views_by_block"))?;
    Ok(())
}

pub(crate) fn apply(txn: &WriteTransaction, record: &VideoViewRecord) -> CollectorResult<()> {
    let course = record.course.to_string();
    let block = record.video_block_id.as_str();
    let user = record.user_id.as_str();
    let day = record.log_time.date_naive();

    let day_row_key = (course.as_str(), block, day_key(day));
    let day_row = match get_json::<_, VideoViewsByDay>(txn, VIDEO_VIEWS_BY_DAY, day_row_key)? {
        Some(mut row) => {
            if row.user_ids.insert(record.user_id.clone()) {
                row.total += 1;
            }
            row
        }
        None => VideoViewsByDay {
            course: course.clone(),
            video_block_id: record.video_block_id.clone(),
            day,
            total: 1,
            user_ids: BTreeSet::from([record.user_id.clone()]),
        },
    };
    put_json(txn, VIDEO_VIEWS_BY_DAY, day_row_key, &day_row)?;

    let block_key = (course.as_str(), block);
    let mut block_row = get_json::<_, VideoViewsByBlock>(txn, VIDEO_VIEWS_BY_BLOCK, block_key)?
        .unwrap_or_else(|| VideoViewsByBlock {
            course: course.clone(),
            video_block_id: record.video_block_id.clone(),
            count_full_viewed: 0,
            count_part_viewed: 0,
            video_duration: 0,
        });

    let user_key = (course.as_str(), user, block);
    let mut user_row = match get_json::<_, VideoViewsByUser>(txn, VIDEO_VIEWS_BY_USER, user_key)? {
        Some(row) => row,
        None => {
            block_row.count_part_viewed += 1;
            VideoViewsByUser {
                course: course.clone(),
                user_id: record.user_id.clone(),
                video_block_id: record.video_block_id.clone(),
                is_completed: false,
                viewed_time: 0,
            }
        }
    };

    if !user_row.is_completed && record.viewed_time >= user_row.viewed_time {
        user_row.viewed_time = record.viewed_time;
        if record.is_completed {
            user_row.is_completed = true;
            block_row.count_full_viewed += 1;
            block_row.count_part_viewed = block_row.count_part_viewed.saturating_sub(1);
            block_row.video_duration = user_row.viewed_time;
        }
    }

    put_json(txn, VIDEO_VIEWS_BY_USER, user_key, &user_row)?;
    put_json(txn, VIDEO_VIEWS_BY_BLOCK, block_key, &block_row)
}

/// Daily views of a video block, oldest day first
///
/// # Errors
///
/// Returns error if the table cannot be read
pub fn video_views_by_day(
    store: &Store,
    course: &str,
    video_block_id: &str,
) -> CollectorResult<Vec<VideoViewsByDay>> {
    let txn = store.begin_read()?;
    scan_json(
        &txn,
        VIDEO_VIEWS_BY_DAY,
        (course, video_block_id, i32::MIN)..=(course, video_block_id, i32::MAX),
    )
}

/// Progress of one user on a video block
///
/// # Errors
///
/// Returns error if the table cannot be read
pub fn video_views_by_user(
    store: &Store,
    course: &str,
    user_id: &str,
    video_block_id: &str,
) -> CollectorResult<Option<VideoViewsByUser>> {
    fetch_json(store, VIDEO_VIEWS_BY_USER, (course, user_id, video_block_id))
}

/// Completion counters of a video block
///
/// # Errors
///
/// Returns error if the table cannot be read
pub fn video_views_by_block(
    store: &Store,
    course: &str,
    video_block_id: &str,
) -> CollectorResult<Option<VideoViewsByBlock>> {
    fetch_json(store, VIDEO_VIEWS_BY_BLOCK, (course, video_block_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::envelope;
    use serde_json::json;

    const COURSE: &str = "course-v1:edX+DemoX+Demo";
    const BLOCK: &str = "block-v1:edX+DemoX+Demo+type@video+block@intro";

    fn event(event_type: &str, time: &str, user: u64, current_time: Value) -> EventEnvelope {
        let payload = json!({"id": BLOCK, "currentTime": current_time}).to_string();
        envelope(
            event_type,
            time,
            json!({
                "context": {"user_id": user, "course_id": COURSE},
                "event": payload
            }),
        )
    }

    fn apply_event(store: &Store, event: &EventEnvelope) -> CollectorResult<()> {
        if let Some(record) = format(event) {
            store.write("apply", |txn| apply(txn, &record))?;
        }
        Ok(())
    }

    #[test]
    fn test_format_truncates_current_time() {
        let record = format(&event("play_video", "2020-01-01T00:00:00Z", 7, json!(12.9)));
        assert_eq!(record.as_ref().map(|r| r.viewed_time), Some(12));
        assert_eq!(record.as_ref().map(|r| r.user_id.as_str()), Some("7"));

        let textual = format(&event("pause_video", "2020-01-01T00:00:00Z", 7, json!("30.5")));
        assert_eq!(textual.map(|r| r.viewed_time), Some(30));

        let garbage = format(&event("seek_video", "2020-01-01T00:00:00Z", 7, json!("n/a")));
        assert_eq!(garbage.map(|r| r.viewed_time), Some(0));
    }

    #[test]
    fn test_format_requires_context() {
        let missing_user = envelope(
            "play_video",
            "2020-01-01T00:00:00Z",
            json!({"context": {"course_id": COURSE}, "event": {"id": BLOCK}}),
        );
        assert!(format(&missing_user).is_none());
    }

    #[test]
    fn test_distinct_users_per_day() -> CollectorResult<()> {
        let store = Store::in_memory()?;
        apply_event(&store, &event("play_video", "2020-01-01T10:00:00Z", 1, json!(1)))?;
        apply_event(&store, &event("pause_video", "2020-01-01T10:01:00Z", 1, json!(5)))?;
        apply_event(&store, &event("play_video", "2020-01-01T11:00:00Z", 2, json!(0)))?;

        let days = video_views_by_day(&store, COURSE, BLOCK)?;
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].total, 2);
        assert_eq!(days[0].user_ids.len(), 2);

        let block = video_views_by_block(&store, COURSE, BLOCK)?;
        assert_eq!(block.map(|b| b.count_part_viewed), Some(2));
        Ok(())
    }

    #[test]
    fn test_repeat_viewer_counted_once_per_day() -> CollectorResult<()> {
        let store = Store::in_memory()?;
        apply_event(&store, &event("play_video", "2020-01-01T10:00:00Z", 1, json!(0)))?;
        apply_event(&store, &event("play_video", "2020-01-01T10:01:00Z", 1, json!(4)))?;

        let days = video_views_by_day(&store, COURSE, BLOCK)?;
        assert_eq!(days.len(), 1);
        assert_eq!((days[0].total, days[0].user_ids.len()), (1, 1));

        apply_event(&store, &event("play_video", "2020-01-02T08:00:00Z", 1, json!(9)))?;
        let days = video_views_by_day(&store, COURSE, BLOCK)?;
        assert_eq!(days.iter().map(|d| d.total).collect::<Vec<_>>(), vec![1, 1]);
        Ok(())
    }

    #[test]
    fn test_completion_is_monotonic() -> CollectorResult<()> {
        let store = Store::in_memory()?;
        apply_event(&store, &event("play_video", "2020-01-01T10:00:00Z", 1, json!(40)))?;
        apply_event(&store, &event("seek_video", "2020-01-01T10:01:00Z", 1, json!(10)))?;

        let progress = video_views_by_user(&store, COURSE, "1", BLOCK)?;
        assert_eq!(progress.as_ref().map(|p| p.viewed_time), Some(40));

        apply_event(&store, &event("stop_video", "2020-01-01T10:05:00Z", 1, json!(120)))?;
        apply_event(&store, &event("play_video", "2020-01-02T09:00:00Z", 1, json!(300)))?;

        let progress = video_views_by_user(&store, COURSE, "1", BLOCK)?;
        assert_eq!(
            progress.map(|p| (p.is_completed, p.viewed_time)),
            Some((true, 120))
        );

        let block = video_views_by_block(&store, COURSE, BLOCK)?;
        assert_eq!(
            block.map(|b| (b.count_full_viewed, b.count_part_viewed, b.video_duration)),
            Some((1, 0, 120))
        );
        Ok(())
    }
}
