//! Integration tests for the log collector
//!
//! Drive whole collection cycles through the public API: sources, raw event
//! store, pipelines and cleanup.

#![allow(clippy::unwrap_used)] // Tests are allowed to use unwrap for simplicity
#![allow(clippy::expect_used)] // Tests are allowed to use expect for simplicity
#![allow(clippy::panic)] // Tests are allowed to panic

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use object_store::{memory::InMemory, path::Path as ObjectPath, ObjectStore, PutPayload};
use proptest::prelude::*;
use serde_json::{json, Value};

use log_collector::{
    pipeline::{
        course_activity::last_course_visit,
        discussion::discussion_activity_by_day,
        enrollment::{enrollment_by_day, USER_ENROLLED, USER_UNENROLLED},
        student_step::student_step_by_day,
        video_views::{video_views_by_block, video_views_by_day, video_views_by_user},
    },
    CollectorConfig, CollectorResult, FileSystemBackend, LogCollector, ObjectStoreBackend,
    PipelineKind, SourceBackend,
};

const COURSE: &str = "course-v1:edX+DemoX+Demo";
const VIDEO: &str = "block-v1:edX+DemoX+Demo+type@video+block@intro";

fn enrollment(event_type: &str, time: &str, user: &str) -> String {
    json!({
        "event_type": event_type,
        "time": time,
        "username": user,
        "event": {"course_id": COURSE}
    })
    .to_string()
}

fn video(event_type: &str, time: &str, user_id: u64, position: f64) -> String {
    json!({
        "event_type": event_type,
        "time": time,
        "username": format!("user{user_id}"),
        "context": {"user_id": user_id, "course_id": COURSE},
        "event": json!({"id": VIDEO, "currentTime": position}).to_string()
    })
    .to_string()
}

fn write_gz(path: &Path, lines: &[String]) {
    let file = std::fs::File::create(path).unwrap();
    let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    for line in lines {
        writeln!(encoder, "{line}").unwrap();
    }
    encoder.finish().unwrap();
}

fn gz_bytes(lines: &[String]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    for line in lines {
        writeln!(encoder, "{line}").unwrap();
    }
    encoder.finish().unwrap()
}

fn collector() -> LogCollector {
    LogCollector::open(CollectorConfig::in_memory()).unwrap()
}

fn day(text: &str) -> NaiveDate {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").unwrap()
}

/// One archive with enrollment and video events, consumed end to end
#[tokio::test]
async fn test_archived_unit_end_to_end() -> CollectorResult<()> {
    let dir = tempfile::tempdir()?;
    write_gz(
        &dir.path().join("tracking.log-20200102.gz"),
        &[
            enrollment(USER_ENROLLED, "2020-01-01T08:00:00Z", "alice"),
            enrollment(USER_ENROLLED, "2020-01-01T09:00:00Z", "bob"),
            enrollment(USER_UNENROLLED, "2020-01-02T10:00:00Z", "alice"),
            video("play_video", "2020-01-01T10:00:00Z", 1, 3.0),
            video("pause_video", "2020-01-01T10:05:00Z", 1, 42.7),
        ],
    );

    let collector = collector();
    let backend: Arc<dyn SourceBackend> = Arc::new(FileSystemBackend::new(dir.path()));

    let report = collector.load_and_process(Arc::clone(&backend)).await?;
    assert_eq!(report.units, 1);
    assert_eq!(report.ingest.stored, 5);
    assert_eq!(report.failed_pipeline_runs, 0);

    let days = enrollment_by_day(collector.store(), COURSE)?;
    assert_eq!(days.len(), 2);
    assert_eq!((days[0].day, days[0].total), (day("2020-01-02"), 1));
    assert_eq!((days[1].day, days[1].total), (day("2020-01-01"), 2));

    let block = video_views_by_block(collector.store(), COURSE, VIDEO)?.unwrap();
    assert_eq!(block.count_part_viewed, 1);
    assert_eq!(block.count_full_viewed, 0);

    let progress = video_views_by_user(collector.store(), COURSE, "1", VIDEO)?.unwrap();
    assert_eq!(progress.viewed_time, 42);

    assert!(collector
        .repository()
        .is_unit_processed("tracking.log-20200102.gz")?);

    let again = collector.load_and_process(backend).await?;
    assert_eq!(again.units, 0);
    assert_eq!(again.ingest.stored, 0);
    Ok(())
}

/// Reloading the same archive stores nothing new and leaves aggregates alone
#[tokio::test]
async fn test_reload_is_idempotent() -> CollectorResult<()> {
    let dir = tempfile::tempdir()?;
    write_gz(
        &dir.path().join("tracking.log-1.gz"),
        &[
            enrollment(USER_ENROLLED, "2020-03-01T08:00:00Z", "alice"),
            enrollment(USER_ENROLLED, "2020-03-01T08:00:00Z", "alice"),
        ],
    );

    let mut config = CollectorConfig::in_memory();
    config.scheduler.reload_logs = true;
    let collector = LogCollector::open(config)?;
    let backend: Arc<dyn SourceBackend> = Arc::new(FileSystemBackend::new(dir.path()));

    let first = collector.load_and_process(Arc::clone(&backend)).await?;
    assert_eq!(first.ingest.stored, 1);
    assert_eq!(first.ingest.duplicates, 1);

    let second = collector.load_and_process(backend).await?;
    assert_eq!(second.units, 1);
    assert_eq!(second.ingest.stored, 0);
    assert_eq!(second.applied, 0);

    let days = enrollment_by_day(collector.store(), COURSE)?;
    assert_eq!(days.len(), 1);
    assert_eq!(days[0].total, 1);
    Ok(())
}

/// Late events ripple through every later day's running total
#[test]
fn test_enrollment_cascade_through_live_events() -> CollectorResult<()> {
    let collector = collector();
    let live = collector.live_backend();

    for (event_type, time) in [
        (USER_ENROLLED, "2020-01-01T10:00:00Z"),
        (USER_ENROLLED, "2020-01-03T10:00:00Z"),
        (USER_ENROLLED, "2020-01-02T10:00:00Z"),
        (USER_UNENROLLED, "2020-01-02T11:00:00Z"),
        (USER_ENROLLED, "2020-01-01T12:00:00Z"),
    ] {
        let event: Value = serde_json::from_str(&enrollment(event_type, time, "x"))?;
        live.send(event)?;
    }

    let rows: Vec<(NaiveDate, i64)> = enrollment_by_day(collector.store(), COURSE)?
        .into_iter()
        .map(|row| (row.day, row.total))
        .collect();
    assert_eq!(
        rows,
        vec![
            (day("2020-01-03"), 3),
            (day("2020-01-02"), 2),
            (day("2020-01-01"), 2),
        ]
    );
    Ok(())
}

proptest! {
    /// Every running total equals the prefix sum of the daily nets,
    /// whatever order the events arrive in
    #[test]
    fn prop_enrollment_totals_are_prefix_sums(
        events in prop::collection::vec((1u32..=9, any::<bool>()), 1..30)
    ) {
        let collector = collector();
        let live = collector.live_backend();

        let mut net: BTreeMap<u32, i64> = BTreeMap::new();
        for (index, (day_of_month, enrolled)) in events.iter().enumerate() {
            let time = format!("2021-05-0{day_of_month}T00:00:{:02}Z", index % 60);
            let event_type = if *enrolled { USER_ENROLLED } else { USER_UNENROLLED };
            let event: Value = serde_json::from_str(&enrollment(event_type, &time, "p")).unwrap();
            live.send(event).unwrap();
            *net.entry(*day_of_month).or_default() += if *enrolled { 1 } else { -1 };
        }

        let mut expected = Vec::new();
        let mut running = 0;
        for (day_of_month, delta) in &net {
            running += delta;
            expected.push((day(&format!("2021-05-0{day_of_month}")), running));
        }
        expected.reverse();

        let actual: Vec<(NaiveDate, i64)> = enrollment_by_day(collector.store(), COURSE)
            .unwrap()
            .into_iter()
            .map(|row| (row.day, row.total))
            .collect();
        prop_assert_eq!(actual, expected);
    }
}

/// Completion never regresses and distinct viewers are counted once per day
#[tokio::test]
async fn test_video_progress_from_object_store() -> CollectorResult<()> {
    let store = Arc::new(InMemory::new());
    store
        .put(
            &ObjectPath::from("logs/tracking.log-1.gz"),
            PutPayload::from(gz_bytes(&[
                video("play_video", "2020-02-01T10:00:00Z", 1, 5.0),
                video("stop_video", "2020-02-01T10:10:00Z", 1, 120.0),
                video("seek_video", "2020-02-01T10:11:00Z", 1, 30.0),
                video("play_video", "2020-02-01T11:00:00Z", 2, 0.0),
                video("play_video", "2020-02-01T11:00:30Z", 2, 8.0),
            ])),
        )
        .await?;

    let collector = collector();
    let backend: Arc<dyn SourceBackend> = Arc::new(ObjectStoreBackend::new("memory", store));
    let report = collector.load_and_process(backend).await?;
    assert_eq!(report.units, 1);

    let viewer = video_views_by_user(collector.store(), COURSE, "1", VIDEO)?.unwrap();
    assert!(viewer.is_completed);
    assert_eq!(viewer.viewed_time, 120);

    let block = video_views_by_block(collector.store(), COURSE, VIDEO)?.unwrap();
    assert_eq!(block.count_full_viewed, 1);
    assert_eq!(block.count_part_viewed, 1);
    assert_eq!(block.video_duration, 120);

    let days = video_views_by_day(collector.store(), COURSE, VIDEO)?;
    assert_eq!(days.len(), 1);
    assert_eq!(days[0].total, 2);
    assert_eq!(days[0].user_ids.len(), 2);
    Ok(())
}

/// Raw events go once every pipeline has consumed them
#[tokio::test]
async fn test_delete_logs_after_every_pipeline_consumed() -> CollectorResult<()> {
    let time = "2020-04-01T09:00:00Z";
    let context = json!({"user_id": 3, "course_id": COURSE});
    let lines = vec![
        enrollment(USER_ENROLLED, time, "carol"),
        video("play_video", time, 3, 1.0),
        json!({
            "event_type": "edx.forum.thread.created",
            "time": time,
            "username": "carol",
            "context": context.clone(),
            "event": {"id": "thread-1", "commentable_id": "general", "category_id": "general"}
        })
        .to_string(),
        json!({
            "event_type": "seq_goto",
            "time": time,
            "username": "carol",
            "context": context.clone(),
            "event": json!({"id": "sequential-1", "old": 1, "new": 2}).to_string()
        })
        .to_string(),
    ];

    let dir = tempfile::tempdir()?;
    write_gz(&dir.path().join("tracking.log-1.gz"), &lines);

    let mut config = CollectorConfig::in_memory();
    config.scheduler.delete_logs = true;
    let collector = LogCollector::open(config)?;
    let backend: Arc<dyn SourceBackend> = Arc::new(FileSystemBackend::new(dir.path()));

    let report = collector.load_and_process(backend).await?;
    assert_eq!(report.ingest.stored, 4);
    assert_eq!(report.deleted, 4);
    assert_eq!(collector.repository().count()?, 0);

    let checkpoints = collector.processor().checkpoints().all()?;
    assert_eq!(checkpoints.len(), PipelineKind::ALL.len());

    let store = collector.store();
    assert_eq!(discussion_activity_by_day(store, COURSE)?.len(), 1);
    assert_eq!(student_step_by_day(store, COURSE)?.len(), 1);
    assert!(last_course_visit(store, "3", COURSE)?.is_some());
    Ok(())
}

/// Raw events stay while some pipeline has never run over anything
#[tokio::test]
async fn test_delete_logs_waits_for_missing_checkpoints() -> CollectorResult<()> {
    let dir = tempfile::tempdir()?;
    write_gz(
        &dir.path().join("tracking.log-1.gz"),
        &[enrollment(USER_ENROLLED, "2020-04-01T09:00:00Z", "dave")],
    );

    let mut config = CollectorConfig::in_memory();
    config.scheduler.delete_logs = true;
    let collector = LogCollector::open(config)?;
    let backend: Arc<dyn SourceBackend> = Arc::new(FileSystemBackend::new(dir.path()));

    let report = collector.load_and_process(backend).await?;
    assert_eq!(report.deleted, 0);
    assert_eq!(collector.repository().count()?, 1);
    Ok(())
}

/// Live units are read on every cycle and never marked processed
#[tokio::test]
async fn test_live_unit_is_never_marked_processed() -> CollectorResult<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(
        dir.path().join("tracking.log"),
        format!(
            "{}\r\n\n{}\n",
            enrollment(USER_ENROLLED, "2020-05-01T08:00:00Z", "erin"),
            "not json at all"
        ),
    )?;

    let collector = collector();
    let backend: Arc<dyn SourceBackend> = Arc::new(FileSystemBackend::new(dir.path()));

    let first = collector.load_and_process(Arc::clone(&backend)).await?;
    assert_eq!(first.units, 1);
    assert_eq!(first.ingest.stored, 1);
    assert_eq!(first.ingest.malformed, 1);
    assert!(!collector.repository().is_unit_processed("tracking.log")?);

    let second = collector.load_and_process(backend).await?;
    assert_eq!(second.units, 1);
    assert_eq!(second.ingest.duplicates, 1);
    assert_eq!(second.applied, 0);
    Ok(())
}
