//! Batch definitions: the root entity the orchestrator tracks.

use crate::definition::{
    format_timestamp, now_second, parse_timestamp, JobRecord, JobStatus, JsonMap,
};
use crate::error::{BatchQueueError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Execution shape of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchType {
    /// Independent jobs executed concurrently
    Parallel,
    /// Jobs executed one after another, sharing accumulated context
    Sequential,
}

impl BatchType {
    /// Wire representation of the type
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchType::Parallel => "parallel",
            BatchType::Sequential => "sequential",
        }
    }

    /// Parse the wire representation
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "parallel" => Ok(BatchType::Parallel),
            "sequential" => Ok(BatchType::Sequential),
            other => Err(BatchQueueError::storage(format!(
                "unknown batch type {other:?}"
            ))),
        }
    }
}

/// Lifecycle state of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    /// Persisted, no worker pickup yet
    Pending,
    /// At least one job picked up
    Running,
    /// All jobs completed successfully
    Completed,
    /// At least one job failed
    Failed,
}

impl BatchStatus {
    /// Wire representation of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    /// Parse the wire representation
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(BatchStatus::Pending),
            "running" => Ok(BatchStatus::Running),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(BatchQueueError::storage(format!(
                "unknown batch status {other:?}"
            ))),
        }
    }

    /// Check if the status is completed or failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

/// Serializable callback job specification.
///
/// Callbacks must be queueable job descriptions, never in-process closures:
/// the callback may run on a different worker long after the submitting
/// process exited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackSpec {
    /// Registered class name of the callback job
    pub class: String,
    /// Extra arguments merged into the callback envelope
    #[serde(default)]
    pub args: JsonMap,
}

impl CallbackSpec {
    /// Build a callback spec from a class name
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            args: JsonMap::new(),
        }
    }

    /// Replace the argument map
    pub fn with_args(mut self, args: JsonMap) -> Self {
        self.args = args;
        self
    }

    /// Add a single argument
    pub fn arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }
}

/// Recognized per-batch options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Callback job fired when the batch completes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_complete: Option<CallbackSpec>,
    /// Callback job fired when the batch fails
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<CallbackSpec>,
    /// Per-message retry budget handed to the queue transport
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Delay between transport retries, in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<u64>,
    /// Timeout hint in seconds, consumed by external monitoring
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Fire the failure callback on the first failing job
    pub fail_on_first_error: bool,
    /// Operator-visible batch name, usable as a listing filter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// One submitted group of jobs, parallel or sequential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchDefinition {
    /// Batch identifier
    pub id: Uuid,
    /// Execution shape, immutable
    pub batch_type: BatchType,
    /// Lifecycle state
    pub status: BatchStatus,
    /// Count of job rows; grows when jobs are appended dynamically
    pub total_jobs: u32,
    /// Count of job rows in `completed` status
    pub completed_jobs: u32,
    /// Count of job rows in `failed` status
    pub failed_jobs: u32,
    /// Mutable context shared across all jobs of the batch
    pub context: JsonMap,
    /// Recognized options
    pub options: BatchOptions,
    /// Logical queue name for named routing
    pub queue_name: Option<String>,
    /// Resolved concrete queue used when enqueuing this batch's messages
    pub queue_config: Option<String>,
    /// Creation timestamp
    pub created: DateTime<Utc>,
    /// Last modification timestamp
    pub modified: DateTime<Utc>,
    /// Set once the batch reaches a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// Child job rows, ordered by position
    pub jobs: Vec<JobRecord>,
}

impl BatchDefinition {
    /// Build an empty pending batch of the given type
    pub fn new(batch_type: BatchType) -> Self {
        let now = now_second();
        Self {
            id: Uuid::new_v4(),
            batch_type,
            status: BatchStatus::Pending,
            total_jobs: 0,
            completed_jobs: 0,
            failed_jobs: 0,
            context: JsonMap::new(),
            options: BatchOptions::default(),
            queue_name: None,
            queue_config: None,
            created: now,
            modified: now,
            completed_at: None,
            jobs: Vec::new(),
        }
    }

    /// Attach job rows, setting `total_jobs` accordingly
    pub fn with_jobs(mut self, jobs: Vec<JobRecord>) -> Self {
        self.total_jobs = jobs.len() as u32;
        self.jobs = jobs;
        self
    }

    /// Check if every job completed successfully
    pub fn is_complete(&self) -> bool {
        self.total_jobs > 0 && self.completed_jobs >= self.total_jobs
    }

    /// Check if any job failed or the batch was declared failed
    pub fn has_failed(&self) -> bool {
        self.failed_jobs > 0 || self.status == BatchStatus::Failed
    }

    /// Check if any job carries a compensation partner
    pub fn has_compensation(&self) -> bool {
        self.jobs
            .iter()
            .any(|job| job.payload.compensation.is_some())
    }

    /// Look up a job row by its row id
    pub fn job(&self, id: Uuid) -> Option<&JobRecord> {
        self.jobs.iter().find(|job| job.id == id)
    }

    /// Look up a job row by its position
    pub fn job_at_position(&self, position: u32) -> Option<&JobRecord> {
        self.jobs.iter().find(|job| job.position == position)
    }

    /// All jobs carrying a compensation partner, in position order
    pub fn jobs_with_compensation(&self) -> Vec<&JobRecord> {
        self.jobs
            .iter()
            .filter(|job| job.payload.compensation.is_some())
            .collect()
    }

    /// Completed jobs holding rollback obligations, in reverse position order.
    ///
    /// The failing job itself and pending jobs have no visible side effects
    /// and are excluded.
    pub fn compensation_targets(&self) -> Vec<&JobRecord> {
        let mut targets: Vec<&JobRecord> = self
            .jobs
            .iter()
            .filter(|job| {
                job.status == JobStatus::Completed && job.payload.compensation.is_some()
            })
            .collect();
        targets.sort_by(|a, b| b.position.cmp(&a.position));
        targets
    }

    /// The job to release after the step at `current_position` completed
    pub fn next_sequential_job(&self, current_position: u32) -> Option<&JobRecord> {
        self.job_at_position(current_position + 1)
    }

    /// Serialize into a flat map for storage round-trips
    pub fn to_map(&self) -> JsonMap {
        let mut map = JsonMap::new();
        map.insert("id".to_string(), Value::String(self.id.to_string()));
        map.insert(
            "type".to_string(),
            Value::String(self.batch_type.as_str().to_string()),
        );
        map.insert(
            "status".to_string(),
            Value::String(self.status.as_str().to_string()),
        );
        map.insert("total_jobs".to_string(), Value::from(self.total_jobs));
        map.insert(
            "completed_jobs".to_string(),
            Value::from(self.completed_jobs),
        );
        map.insert("failed_jobs".to_string(), Value::from(self.failed_jobs));
        map.insert("context".to_string(), Value::Object(self.context.clone()));
        map.insert(
            "options".to_string(),
            serde_json::to_value(&self.options).unwrap_or(Value::Null),
        );
        map.insert(
            "queue_name".to_string(),
            self.queue_name
                .as_ref()
                .map(|name| Value::String(name.clone()))
                .unwrap_or(Value::Null),
        );
        map.insert(
            "queue_config".to_string(),
            self.queue_config
                .as_ref()
                .map(|name| Value::String(name.clone()))
                .unwrap_or(Value::Null),
        );
        map.insert(
            "created".to_string(),
            Value::String(format_timestamp(self.created)),
        );
        map.insert(
            "modified".to_string(),
            Value::String(format_timestamp(self.modified)),
        );
        map.insert(
            "completed_at".to_string(),
            self.completed_at
                .map(|ts| Value::String(format_timestamp(ts)))
                .unwrap_or(Value::Null),
        );
        map.insert(
            "jobs".to_string(),
            Value::Array(self.jobs.iter().map(|job| Value::Object(job.to_map())).collect()),
        );
        map
    }

    /// Hydrate from the flat map produced by [`to_map`](Self::to_map)
    pub fn from_map(map: &JsonMap) -> Result<Self> {
        let id = map
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| BatchQueueError::storage("batch row missing id"))
            .and_then(|raw| {
                Uuid::parse_str(raw)
                    .map_err(|e| BatchQueueError::storage(format!("bad batch id {raw:?}: {e}")))
            })?;

        let batch_type = map
            .get("type")
            .and_then(Value::as_str)
            .map(BatchType::parse)
            .transpose()?
            .ok_or_else(|| BatchQueueError::storage("batch row missing type"))?;

        let status = map
            .get("status")
            .and_then(Value::as_str)
            .map(BatchStatus::parse)
            .transpose()?
            .ok_or_else(|| BatchQueueError::storage("batch row missing status"))?;

        let total_jobs = counter(map, "total_jobs")?;
        let completed_jobs = counter(map, "completed_jobs")?;
        let failed_jobs = counter(map, "failed_jobs")?;

        let context = match map.get("context") {
            Some(Value::Object(ctx)) => ctx.clone(),
            _ => JsonMap::new(),
        };

        let options: BatchOptions = match map.get("options") {
            Some(Value::Object(_)) => serde_json::from_value(map["options"].clone())?,
            _ => BatchOptions::default(),
        };

        let queue_name = map
            .get("queue_name")
            .and_then(Value::as_str)
            .map(str::to_string);
        let queue_config = map
            .get("queue_config")
            .and_then(Value::as_str)
            .map(str::to_string);

        let created = required_timestamp(map, "created")?;
        let modified = required_timestamp(map, "modified")?;
        let completed_at = match map.get("completed_at") {
            Some(Value::String(raw)) => Some(parse_timestamp(raw)?),
            _ => None,
        };

        let mut jobs = Vec::new();
        if let Some(Value::Array(raw_jobs)) = map.get("jobs") {
            for raw in raw_jobs {
                let obj = raw
                    .as_object()
                    .ok_or_else(|| BatchQueueError::storage("job entry is not an object"))?;
                jobs.push(JobRecord::from_map(obj)?);
            }
        }
        jobs.sort_by_key(|job| job.position);

        Ok(Self {
            id,
            batch_type,
            status,
            total_jobs,
            completed_jobs,
            failed_jobs,
            context,
            options,
            queue_name,
            queue_config,
            created,
            modified,
            completed_at,
            jobs,
        })
    }
}

fn counter(map: &JsonMap, key: &str) -> Result<u32> {
    map.get(key)
        .and_then(Value::as_u64)
        .map(|n| n as u32)
        .ok_or_else(|| BatchQueueError::storage(format!("batch row missing {key}")))
}

fn required_timestamp(map: &JsonMap, key: &str) -> Result<DateTime<Utc>> {
    let raw = map
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| BatchQueueError::storage(format!("batch row missing {key}")))?;
    parse_timestamp(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::JobPayload;
    use serde_json::json;

    fn job(batch_id: Uuid, position: u32, compensation: Option<&str>) -> JobRecord {
        JobRecord {
            id: Uuid::new_v4(),
            batch_id,
            job_id: None,
            position,
            status: JobStatus::Pending,
            payload: JobPayload {
                class: "Work".to_string(),
                compensation: compensation.map(str::to_string),
                args: JsonMap::new(),
            },
            result: None,
            error: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_predicates() {
        let mut batch = BatchDefinition::new(BatchType::Sequential);
        let id = batch.id;
        batch = batch.with_jobs(vec![job(id, 0, Some("Undo")), job(id, 1, None)]);

        assert_eq!(batch.total_jobs, 2);
        assert!(!batch.is_complete());
        assert!(!batch.has_failed());
        assert!(batch.has_compensation());
        assert_eq!(batch.jobs_with_compensation().len(), 1);
        assert!(batch.job_at_position(1).is_some());
        assert!(batch.job_at_position(2).is_none());

        batch.completed_jobs = 2;
        assert!(batch.is_complete());
    }

    #[test]
    fn test_compensation_targets_reverse_completed_only() {
        let mut batch = BatchDefinition::new(BatchType::Sequential);
        let id = batch.id;
        let mut jobs = vec![
            job(id, 0, Some("UndoA")),
            job(id, 1, Some("UndoB")),
            job(id, 2, Some("UndoC")),
            job(id, 3, None),
        ];
        jobs[0].status = JobStatus::Completed;
        jobs[1].status = JobStatus::Completed;
        jobs[2].status = JobStatus::Pending;
        jobs[3].status = JobStatus::Failed;
        batch = batch.with_jobs(jobs);

        let targets = batch.compensation_targets();
        let positions: Vec<u32> = targets.iter().map(|job| job.position).collect();
        assert_eq!(positions, vec![1, 0]);
    }

    #[test]
    fn test_next_sequential_job() {
        let mut batch = BatchDefinition::new(BatchType::Sequential);
        let id = batch.id;
        batch = batch.with_jobs(vec![job(id, 0, None), job(id, 1, None)]);

        assert_eq!(batch.next_sequential_job(0).map(|j| j.position), Some(1));
        assert!(batch.next_sequential_job(1).is_none());
    }

    #[test]
    fn test_map_round_trip() {
        let mut batch = BatchDefinition::new(BatchType::Parallel);
        let id = batch.id;
        batch = batch.with_jobs(vec![job(id, 0, None), job(id, 1, None)]);
        batch.status = BatchStatus::Running;
        batch.completed_jobs = 1;
        batch.context.insert("tenant".to_string(), json!("acme"));
        batch.options.name = Some("nightly".to_string());
        batch.options.fail_on_first_error = true;
        batch.queue_name = Some("reports".to_string());
        batch.queue_config = Some("reporting".to_string());

        let restored = BatchDefinition::from_map(&batch.to_map()).unwrap();
        assert_eq!(restored, batch);
    }
}
