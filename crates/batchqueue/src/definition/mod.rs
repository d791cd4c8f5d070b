//! Value types describing batches and their jobs.

mod batch;
mod job;

pub use batch::{BatchDefinition, BatchOptions, BatchStatus, BatchType, CallbackSpec};
pub use job::{JobFailure, JobPayload, JobRecord, JobSpec, JobStatus};

use crate::error::{BatchQueueError, Result};
use chrono::{DateTime, TimeZone, Timelike, Utc};

/// JSON object map used for job args, batch context and wire envelopes
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Wire format for persisted timestamps, shared by both storage backends
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current time truncated to whole seconds, the precision both backends persist
pub(crate) fn now_second() -> DateTime<Utc> {
    let now = Utc::now();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Format a timestamp in the shared wire format
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp from the shared wire format
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let naive = chrono::NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map_err(|e| BatchQueueError::storage(format!("bad timestamp {raw:?}: {e}")))?;
    Ok(Utc.from_utc_datetime(&naive))
}
