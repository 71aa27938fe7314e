//! Log Collector Types
//!
//! Core records shared by the repository, the pipelines and the source
//! backends: raw events, processed-source markers, checkpoints and course keys.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{CollectorError, CollectorResult};

/// One ingested tracking-log line
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawEvent {
    /// SHA-256 of `message_type`, hex encoded
    pub message_type_hash: String,

    /// Event type (`event_type`, or `name` when absent)
    pub message_type: String,

    /// Authoritative event time
    pub log_time: DateTime<Utc>,

    /// Username of the actor, if any
    pub user_name: Option<String>,

    /// Original line text
    pub raw_payload: String,

    /// Ingestion timestamp
    pub created_at: DateTime<Utc>,
}

/// Dedup key of a raw event: (log time in microseconds, type hash, user name)
pub type RawEventKey<'a> = (i64, &'a str, &'a str);

impl RawEvent {
    /// Parse one raw tracking-log line
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the line is not JSON and `Validation` if the
    /// event type or time is missing.
    pub fn parse(line: &str) -> CollectorResult<Self> {
        let json: Value = serde_json::from_str(line)?;
        let (message_type, log_time) = extract_header(&json)?;

        let user_name = json
            .get("username")
            .and_then(Value::as_str)
            .or_else(|| {
                json.get("context")
                    .and_then(|c| c.get("username"))
                    .and_then(Value::as_str)
            })
            .map(str::to_string);

        Ok(Self {
            message_type_hash: message_type_hash(&message_type),
            message_type,
            log_time,
            user_name,
            raw_payload: line.to_string(),
            created_at: Utc::now(),
        })
    }

    /// Dedup key; an absent user name and an empty one share a key
    #[must_use]
    pub fn key(&self) -> RawEventKey<'_> {
        (
            self.log_time.timestamp_micros(),
            self.message_type_hash.as_str(),
            self.user_name.as_deref().unwrap_or(""),
        )
    }

    /// Decode the payload into an envelope for pipeline formatting
    ///
    /// # Errors
    ///
    /// Returns error if the stored payload is no longer valid JSON
    pub fn envelope(&self) -> CollectorResult<EventEnvelope> {
        Ok(EventEnvelope {
            message_type: self.message_type.clone(),
            log_time: self.log_time,
            body: serde_json::from_str(&self.raw_payload)?,
        })
    }
}

/// Event as seen by a pipeline's `format` step
///
/// Built from a stored [`RawEvent`] during batch replay, or directly from a
/// live event object.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    /// Event type
    pub message_type: String,
    /// Event time
    pub log_time: DateTime<Utc>,
    /// Full event object
    pub body: Value,
}

impl EventEnvelope {
    /// Build an envelope from a live event object
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the event type or time is missing
    pub fn from_event(event: Value) -> CollectorResult<Self> {
        let (message_type, log_time) = extract_header(&event)?;
        Ok(Self {
            message_type,
            log_time,
            body: event,
        })
    }

    /// Field from the `context` object
    #[must_use]
    pub fn context(&self, field: &str) -> Option<&Value> {
        self.body.get("context").and_then(|c| c.get(field))
    }

    /// The `event` payload, decoding it when it is a JSON-encoded string
    #[must_use]
    pub fn payload(&self) -> Option<Value> {
        match self.body.get("event")? {
            Value::String(text) => serde_json::from_str(text).ok(),
            other => Some(other.clone()),
        }
    }
}

/// Marker for a fully ingested source unit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessedSource {
    /// Unit name (file or object key)
    pub source_name: String,
    /// When the unit was marked processed
    pub processed_at: DateTime<Utc>,
}

/// High-water mark of one pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineCheckpoint {
    /// Stable pipeline identifier
    pub pipeline_id: String,
    /// `log_time` of the most recently applied raw event
    pub last_event_time: DateTime<Utc>,
}

/// Parsed course identifier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CourseKey {
    /// Organisation
    pub org: String,
    /// Course number
    pub course: String,
    /// Course run
    pub run: String,
    /// Whether the key uses the legacy `Org/Course/Run` form
    pub legacy: bool,
}

impl CourseKey {
    /// Parse `course-v1:Org+Course+Run` or legacy `Org/Course/Run`
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the identifier is in neither form
    pub fn parse(raw: &str) -> CollectorResult<Self> {
        let raw = raw.trim();
        let (parts, legacy): (Vec<&str>, bool) = match raw.strip_prefix("course-v1:") {
            Some(rest) => (rest.split('+').collect(), false),
            None => (raw.split('/').collect(), true),
        };

        match parts.as_slice() {
            [org, course, run]
                if [org, course, run].iter().all(|p| is_key_component(p)) =>
            {
                Ok(Self {
                    org: (*org).to_string(),
                    course: (*course).to_string(),
                    run: (*run).to_string(),
                    legacy,
                })
            }
            _ => Err(CollectorError::validation(
                "course_id",
                format!("cannot parse course key '{raw}'"),
            )),
        }
    }
}

impl fmt::Display for CourseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.legacy {
            write!(f, "{}/{}/{}", self.org, self.course, self.run)
        } else {
            write!(f, "course-v1:{}+{}+{}", self.org, self.course, self.run)
        }
    }
}

fn is_key_component(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~' | '%'))
}

/// Stable hash of an event type
#[must_use]
pub fn message_type_hash(message_type: &str) -> String {
    hex::encode(Sha256::digest(message_type.as_bytes()))
}

/// Parse a tracking-log timestamp (RFC 3339, or naive ISO-8601 taken as UTC)
#[must_use]
pub fn parse_log_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

/// Microseconds since the epoch back to a timestamp
#[must_use]
pub fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}

fn non_empty_str<'a>(json: &'a Value, field: &str) -> Option<&'a str> {
    json.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Event type and time of an event object, with the `name`/`timestamp` fallbacks
fn extract_header(json: &Value) -> CollectorResult<(String, DateTime<Utc>)> {
    let message_type = non_empty_str(json, "event_type")
        .or_else(|| non_empty_str(json, "name"))
        .ok_or_else(|| CollectorError::validation("event_type", "missing event_type and name"))?;

    let raw_time = non_empty_str(json, "time")
        .or_else(|| non_empty_str(json, "timestamp"))
        .ok_or_else(|| CollectorError::validation("time", "missing time and timestamp"))?;

    let log_time = parse_log_time(raw_time)
        .ok_or_else(|| CollectorError::validation("time", format!("unparseable '{raw_time}'")))?;

    Ok((message_type.to_string(), log_time))
}
