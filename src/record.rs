//! The crash record and its timestamp format.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The single persisted description of the most recent captured failure.
///
/// Stored as a flat JSON object with the string fields `error`, `timestamp`
/// and `stackTrace`. Unknown fields are ignored when reading, so later
/// versions may add fields without breaking older readers. Any other shape,
/// including a JSON array, is rejected.
///
/// Records are only created by the crate's capture paths; applications read
/// the one returned by [`get_last_crash`](crate::get_last_crash).
///
/// ```compile_fail
/// let record = flux_crash_handler::CrashRecord {
///     error: String::new(),
///     timestamp: "not a time".into(),
///     stack_trace: String::new(),
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "Map<String, Value>")]
pub struct CrashRecord {
    error: String,
    timestamp: String,
    stack_trace: String,
}

/// Field layout accepted from disk. Only ever fed a JSON object.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredFields {
    error: String,
    timestamp: String,
    stack_trace: String,
}

impl TryFrom<Map<String, Value>> for CrashRecord {
    type Error = serde_json::Error;

    fn try_from(object: Map<String, Value>) -> Result<Self, Self::Error> {
        let fields: StoredFields = serde_json::from_value(Value::Object(object))?;
        Ok(Self::with_timestamp(fields.error, fields.timestamp, fields.stack_trace))
    }
}

impl CrashRecord {
    /// Build a record stamped with the current time.
    pub(crate) fn new(error: String, stack_trace: String) -> Self {
        Self::with_timestamp(error, timestamp_now(), stack_trace)
    }

    pub(crate) fn with_timestamp(error: String, timestamp: String, stack_trace: String) -> Self {
        Self {
            error,
            timestamp,
            stack_trace,
        }
    }

    /// Human-readable failure description. Never empty for captured records.
    pub fn error(&self) -> &str {
        &self.error
    }

    /// Capture time, `YYYY-MM-DDTHH:MM:SS.mmmZ`.
    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// Best-effort stack trace. May be empty.
    pub fn stack_trace(&self) -> &str {
        &self.stack_trace
    }

    /// Parse the capture time.
    pub fn captured_at(&self) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(&self.timestamp).map(|t| t.with_timezone(&Utc))
    }
}

/// Current UTC time at millisecond precision with a literal `Z`.
pub(crate) fn timestamp_now() -> String {
    format_timestamp(Utc::now())
}

pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
