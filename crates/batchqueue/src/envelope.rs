//! Wire envelope: the marker fields the orchestrator owns inside message args.

use crate::definition::{BatchDefinition, BatchStatus, CallbackSpec, JobRecord, JsonMap};
use crate::error::{BatchQueueError, Result};
use serde_json::Value;
use uuid::Uuid;

/// Marker key: owning batch id
pub const KEY_BATCH_ID: &str = "batch_id";
/// Marker key: job position within the batch
pub const KEY_JOB_POSITION: &str = "job_position";
/// Marker key: compensation partner class, when the job has one
pub const KEY_COMPENSATION: &str = "compensation";
/// Marker key: set on on_complete / on_failure callback messages
pub const KEY_IS_CALLBACK: &str = "is_callback";
/// Marker key: set on compensation chain jobs
pub const KEY_IS_COMPENSATION: &str = "is_compensation";
/// Marker key: compensation metadata object (original batch, class, result, order)
pub const KEY_COMPENSATION_META: &str = "_compensation";
/// Marker key: batch status on callback messages
pub const KEY_STATUS: &str = "status";
/// Marker key: error summary on failure callback messages
pub const KEY_ERROR: &str = "error";

/// Parsed classification of a delivery's args
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// A batch job: has `batch_id` and `job_position`
    Batch(BatchEnvelope),
    /// A completion/failure callback: has `is_callback: true`
    Callback(CallbackEnvelope),
    /// Anything else; acknowledged without touching batch state
    PassThrough,
}

/// Routing fields of a batch job message
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEnvelope {
    /// Owning batch
    pub batch_id: Uuid,
    /// Position of the job row
    pub position: u32,
    /// Compensation partner class, when present
    pub compensation: Option<String>,
}

/// Routing fields of a callback message
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackEnvelope {
    /// Batch the callback reports on
    pub batch_id: Option<Uuid>,
    /// Batch status at callback time
    pub status: Option<String>,
    /// Error summary, failure callbacks only
    pub error: Option<String>,
}

impl Envelope {
    /// Classify message args.
    ///
    /// Marker fields that are present but malformed are an error; the caller
    /// treats that as a poison message.
    pub fn parse(args: &JsonMap) -> Result<Envelope> {
        if args.get(KEY_IS_CALLBACK).and_then(Value::as_bool) == Some(true) {
            let batch_id = match args.get(KEY_BATCH_ID) {
                Some(value) => Some(parse_batch_id(value)?),
                None => None,
            };
            return Ok(Envelope::Callback(CallbackEnvelope {
                batch_id,
                status: args.get(KEY_STATUS).and_then(Value::as_str).map(str::to_string),
                error: args.get(KEY_ERROR).and_then(Value::as_str).map(str::to_string),
            }));
        }

        let Some(raw_batch_id) = args.get(KEY_BATCH_ID) else {
            return Ok(Envelope::PassThrough);
        };
        let Some(raw_position) = args.get(KEY_JOB_POSITION) else {
            return Ok(Envelope::PassThrough);
        };

        let batch_id = parse_batch_id(raw_batch_id)?;
        let position = raw_position.as_u64().ok_or_else(|| {
            BatchQueueError::InvalidJob(format!("bad job_position {raw_position}"))
        })? as u32;

        Ok(Envelope::Batch(BatchEnvelope {
            batch_id,
            position,
            compensation: args
                .get(KEY_COMPENSATION)
                .and_then(Value::as_str)
                .map(str::to_string),
        }))
    }
}

fn parse_batch_id(value: &Value) -> Result<Uuid> {
    let raw = value
        .as_str()
        .ok_or_else(|| BatchQueueError::InvalidJob(format!("bad batch_id {value}")))?;
    Uuid::parse_str(raw)
        .map_err(|e| BatchQueueError::InvalidJob(format!("bad batch_id {raw:?}: {e}")))
}

/// Build the args for a batch job message: job args, then the batch context,
/// then the routing markers. Later sources win on key collisions.
pub fn job_args(batch: &BatchDefinition, job: &JobRecord) -> JsonMap {
    let mut args = job.payload.args.clone();
    for (key, value) in &batch.context {
        args.insert(key.clone(), value.clone());
    }
    args.insert(
        KEY_BATCH_ID.to_string(),
        Value::String(batch.id.to_string()),
    );
    args.insert(KEY_JOB_POSITION.to_string(), Value::from(job.position));
    if let Some(compensation) = &job.payload.compensation {
        args.insert(
            KEY_COMPENSATION.to_string(),
            Value::String(compensation.clone()),
        );
    }
    args
}

/// Build the args for a completion/failure callback message
pub fn callback_args(
    spec: &CallbackSpec,
    batch_id: Uuid,
    status: BatchStatus,
    error: Option<&str>,
) -> JsonMap {
    let mut args = spec.args.clone();
    args.insert(KEY_IS_CALLBACK.to_string(), Value::Bool(true));
    args.insert(KEY_BATCH_ID.to_string(), Value::String(batch_id.to_string()));
    args.insert(
        KEY_STATUS.to_string(),
        Value::String(status.as_str().to_string()),
    );
    if let Some(error) = error {
        args.insert(KEY_ERROR.to_string(), Value::String(error.to_string()));
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{BatchType, JobPayload, JobStatus};
    use serde_json::json;

    #[test]
    fn test_parse_batch_job() {
        let batch_id = Uuid::new_v4();
        let mut args = JsonMap::new();
        args.insert(KEY_BATCH_ID.to_string(), json!(batch_id.to_string()));
        args.insert(KEY_JOB_POSITION.to_string(), json!(2));
        args.insert(KEY_COMPENSATION.to_string(), json!("Undo"));
        args.insert("user_key".to_string(), json!("value"));

        match Envelope::parse(&args).unwrap() {
            Envelope::Batch(env) => {
                assert_eq!(env.batch_id, batch_id);
                assert_eq!(env.position, 2);
                assert_eq!(env.compensation.as_deref(), Some("Undo"));
            }
            other => panic!("expected batch envelope, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_callback() {
        let mut args = JsonMap::new();
        args.insert(KEY_IS_CALLBACK.to_string(), json!(true));
        args.insert(KEY_STATUS.to_string(), json!("failed"));
        args.insert(KEY_ERROR.to_string(), json!("boom"));

        match Envelope::parse(&args).unwrap() {
            Envelope::Callback(env) => {
                assert_eq!(env.status.as_deref(), Some("failed"));
                assert_eq!(env.error.as_deref(), Some("boom"));
                assert!(env.batch_id.is_none());
            }
            other => panic!("expected callback envelope, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_pass_through_and_poison() {
        assert_eq!(
            Envelope::parse(&JsonMap::new()).unwrap(),
            Envelope::PassThrough
        );

        // batch_id without job_position is an unrelated message
        let mut partial = JsonMap::new();
        partial.insert(KEY_BATCH_ID.to_string(), json!(Uuid::new_v4().to_string()));
        assert_eq!(Envelope::parse(&partial).unwrap(), Envelope::PassThrough);

        // malformed batch_id is poison
        let mut poison = JsonMap::new();
        poison.insert(KEY_BATCH_ID.to_string(), json!("not-a-uuid"));
        poison.insert(KEY_JOB_POSITION.to_string(), json!(0));
        assert!(Envelope::parse(&poison).is_err());
    }

    #[test]
    fn test_job_args_merge_order() {
        let mut batch = BatchDefinition::new(BatchType::Sequential);
        batch.context.insert("shared".to_string(), json!("ctx"));
        batch.context.insert("n".to_string(), json!(9));

        let job = JobRecord {
            id: Uuid::new_v4(),
            batch_id: batch.id,
            job_id: None,
            position: 1,
            status: JobStatus::Pending,
            payload: JobPayload {
                class: "Work".to_string(),
                compensation: Some("Undo".to_string()),
                args: {
                    let mut args = JsonMap::new();
                    args.insert("n".to_string(), json!(1));
                    args.insert("own".to_string(), json!(true));
                    args
                },
            },
            result: None,
            error: None,
            completed_at: None,
        };

        let args = job_args(&batch, &job);
        // context wins over job args on collisions
        assert_eq!(args.get("n"), Some(&json!(9)));
        assert_eq!(args.get("own"), Some(&json!(true)));
        assert_eq!(args.get("shared"), Some(&json!("ctx")));
        assert_eq!(args.get(KEY_JOB_POSITION), Some(&json!(1)));
        assert_eq!(args.get(KEY_COMPENSATION), Some(&json!("Undo")));
    }

    #[test]
    fn test_callback_args() {
        let spec = CallbackSpec::new("Notify").arg("channel", json!("ops"));
        let batch_id = Uuid::new_v4();
        let args = callback_args(&spec, batch_id, BatchStatus::Failed, Some("boom"));

        assert_eq!(args.get(KEY_IS_CALLBACK), Some(&json!(true)));
        assert_eq!(args.get(KEY_STATUS), Some(&json!("failed")));
        assert_eq!(args.get(KEY_ERROR), Some(&json!("boom")));
        assert_eq!(args.get("channel"), Some(&json!("ops")));
    }
}
