//! Job records and the input shapes they are normalized from.

use crate::definition::{format_timestamp, parse_timestamp, BatchType, JsonMap};
use crate::error::{BatchQueueError, Result};
use crate::handler::JobRegistry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle state of a single job row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Persisted, not yet picked up
    Pending,
    /// Picked up by a worker
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
}

impl JobStatus {
    /// Wire representation of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Parse the wire representation
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(BatchQueueError::storage(format!(
                "unknown job status {other:?}"
            ))),
        }
    }

    /// Check if the status is completed or failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// User-facing description of one job to run.
///
/// Covers the accepted input shapes: a bare class name, a `(class,
/// compensation)` pair, or a full spec with args. Compensation partners are
/// only legal on sequential chains; normalization enforces that.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    /// Registered class name of the job
    pub class: String,
    /// Arguments handed to the job on execution
    pub args: JsonMap,
    /// Registered class name of the compensation partner, if any
    pub compensation: Option<String>,
}

impl JobSpec {
    /// Start a spec from a class name
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            args: JsonMap::new(),
            compensation: None,
        }
    }

    /// Replace the whole argument map
    pub fn with_args(mut self, args: JsonMap) -> Self {
        self.args = args;
        self
    }

    /// Add a single argument
    pub fn arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    /// Attach a compensation partner class
    pub fn with_compensation(mut self, class: impl Into<String>) -> Self {
        self.compensation = Some(class.into());
        self
    }
}

impl From<&str> for JobSpec {
    fn from(class: &str) -> Self {
        JobSpec::new(class)
    }
}

impl From<String> for JobSpec {
    fn from(class: String) -> Self {
        JobSpec::new(class)
    }
}

impl From<(&str, &str)> for JobSpec {
    fn from((class, compensation): (&str, &str)) -> Self {
        JobSpec::new(class).with_compensation(compensation)
    }
}

impl From<(String, String)> for JobSpec {
    fn from((class, compensation): (String, String)) -> Self {
        JobSpec::new(class).with_compensation(compensation)
    }
}

/// Canonical job descriptor persisted on each row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Registered class name
    pub class: String,
    /// Compensation partner class, sequential batches only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<String>,
    /// Job arguments
    #[serde(default)]
    pub args: JsonMap,
}

/// Error record captured from a failed execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Human-readable failure message
    pub message: String,
    /// Source file, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Source line, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// Backtrace or additional detail, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl JobFailure {
    /// Build a failure record from a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            file: None,
            line: None,
            trace: None,
        }
    }
}

impl From<&BatchQueueError> for JobFailure {
    fn from(err: &BatchQueueError) -> Self {
        JobFailure::new(err.to_string())
    }
}

/// One job attempt-slot inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Row identifier
    pub id: Uuid,
    /// Owning batch
    pub batch_id: Uuid,
    /// Queue-provided message id, stamped when a worker first picks the job up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Zero-based execution index, unique within the batch
    pub position: u32,
    /// Lifecycle state
    pub status: JobStatus,
    /// Canonical job descriptor
    pub payload: JobPayload,
    /// Result reported by a `ResultAware` job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error record of a failed execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    /// Set when the row reaches `completed` or `failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl JobRecord {
    /// Normalize a user-provided spec into a pending row.
    ///
    /// Validates class and compensation existence against the registry and
    /// rejects compensation partners on parallel batches.
    pub fn from_spec(
        spec: JobSpec,
        batch_id: Uuid,
        position: u32,
        batch_type: BatchType,
        registry: &JobRegistry,
    ) -> Result<Self> {
        if !registry.contains(&spec.class) {
            return Err(BatchQueueError::InvalidJob(format!(
                "unknown job class {:?}",
                spec.class
            )));
        }

        if let Some(compensation) = &spec.compensation {
            if batch_type == BatchType::Parallel {
                return Err(BatchQueueError::InvalidJob(format!(
                    "job {:?} declares compensation {:?} but parallel batches cannot be compensated",
                    spec.class, compensation
                )));
            }
            if !registry.contains(compensation) {
                return Err(BatchQueueError::InvalidJob(format!(
                    "unknown compensation class {:?}",
                    compensation
                )));
            }
        }

        Ok(Self {
            id: Uuid::new_v4(),
            batch_id,
            job_id: None,
            position,
            status: JobStatus::Pending,
            payload: JobPayload {
                class: spec.class,
                compensation: spec.compensation,
                args: spec.args,
            },
            result: None,
            error: None,
            completed_at: None,
        })
    }

    /// Serialize into the flat map persisted by the backends
    pub fn to_map(&self) -> JsonMap {
        let mut map = JsonMap::new();
        map.insert("id".to_string(), Value::String(self.id.to_string()));
        map.insert(
            "batch_id".to_string(),
            Value::String(self.batch_id.to_string()),
        );
        map.insert(
            "job_id".to_string(),
            self.job_id
                .as_ref()
                .map(|id| Value::String(id.clone()))
                .unwrap_or(Value::Null),
        );
        map.insert("position".to_string(), Value::from(self.position));
        map.insert(
            "status".to_string(),
            Value::String(self.status.as_str().to_string()),
        );
        map.insert(
            "payload".to_string(),
            serde_json::to_value(&self.payload).unwrap_or(Value::Null),
        );
        map.insert("result".to_string(), self.result.clone().unwrap_or(Value::Null));
        map.insert(
            "error".to_string(),
            self.error
                .as_ref()
                .and_then(|e| serde_json::to_value(e).ok())
                .unwrap_or(Value::Null),
        );
        map.insert(
            "completed_at".to_string(),
            self.completed_at
                .map(|ts| Value::String(format_timestamp(ts)))
                .unwrap_or(Value::Null),
        );
        map
    }

    /// Hydrate from the flat map persisted by the backends
    pub fn from_map(map: &JsonMap) -> Result<Self> {
        let id = parse_uuid(map, "id")?;
        let batch_id = parse_uuid(map, "batch_id")?;

        let job_id = match map.get("job_id") {
            Some(Value::String(id)) => Some(id.clone()),
            _ => None,
        };

        let position = map
            .get("position")
            .and_then(Value::as_u64)
            .ok_or_else(|| BatchQueueError::storage("job row missing position"))?
            as u32;

        let status = map
            .get("status")
            .and_then(Value::as_str)
            .map(JobStatus::parse)
            .transpose()?
            .ok_or_else(|| BatchQueueError::storage("job row missing status"))?;

        let payload: JobPayload = map
            .get("payload")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .ok_or_else(|| BatchQueueError::storage("job row missing payload"))?;

        let result = match map.get("result") {
            Some(Value::Null) | None => None,
            Some(value) => Some(value.clone()),
        };

        let error = match map.get("error") {
            Some(Value::Null) | None => None,
            Some(value) => Some(serde_json::from_value(value.clone())?),
        };

        let completed_at = match map.get("completed_at") {
            Some(Value::String(raw)) => Some(parse_timestamp(raw)?),
            _ => None,
        };

        Ok(Self {
            id,
            batch_id,
            job_id,
            position,
            status,
            payload,
            result,
            error,
            completed_at,
        })
    }
}

fn parse_uuid(map: &JsonMap, key: &str) -> Result<Uuid> {
    let raw = map
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| BatchQueueError::storage(format!("job row missing {key}")))?;
    Uuid::parse_str(raw).map_err(|e| BatchQueueError::storage(format!("bad {key} {raw:?}: {e}")))
}
