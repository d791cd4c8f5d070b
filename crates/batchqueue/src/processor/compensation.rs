//! Saga compensation: reverse-order rollback chains and the built-in
//! callbacks that report their outcome onto the original batch.
//!
//! A compensation chain is itself a sequential batch processed by the normal
//! chain processor; its jobs are recognizable by the `_compensation` marker
//! in their args.

use crate::definition::{
    format_timestamp, BatchDefinition, BatchType, CallbackSpec, JobPayload, JobRecord, JobStatus,
    JsonMap,
};
use crate::dispatcher::Dispatcher;
use crate::envelope::{KEY_BATCH_ID, KEY_COMPENSATION_META, KEY_ERROR, KEY_IS_COMPENSATION};
use crate::error::{BatchQueueError, Result};
use crate::handler::{JobHandler, JobRegistry};
use crate::storage::{BatchUpdate, Storage};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Registry name of the built-in completion callback
pub const COMPENSATION_COMPLETE_CALLBACK: &str = "CompensationCompleteCallback";
/// Registry name of the built-in failure callback
pub const COMPENSATION_FAILED_CALLBACK: &str = "CompensationFailedCallback";

/// Original-batch context key: id of the compensation chain
pub const CTX_COMPENSATION_BATCH_ID: &str = "compensation_batch_id";
/// Original-batch context key: `running`, `completed` or `failed`
pub const CTX_COMPENSATION_STATUS: &str = "compensation_status";
/// Original-batch context key: when compensation started
pub const CTX_COMPENSATION_STARTED_AT: &str = "compensation_started_at";
/// Original-batch context key: when compensation finished
pub const CTX_COMPENSATION_COMPLETED_AT: &str = "compensation_completed_at";
/// Original-batch context key: error summary of a failed compensation
pub const CTX_COMPENSATION_ERROR: &str = "compensation_error";

/// Callback-spec args key pointing back at the compensated batch
pub const KEY_ORIGINAL_BATCH_ID: &str = "original_batch_id";

/// Build and dispatch the compensation chain for a batch.
///
/// Walks the jobs in reverse position order and compensates only *completed*
/// jobs carrying a compensation partner; the failing job and pending jobs
/// hold no visible side effects. Returns the compensation batch id, or
/// `None` when there is nothing to roll back.
pub(crate) async fn launch(
    storage: &Arc<dyn Storage>,
    dispatcher: &Dispatcher,
    original: &BatchDefinition,
) -> Result<Option<Uuid>> {
    let targets = original.compensation_targets();
    if targets.is_empty() {
        return Ok(None);
    }

    let mut chain = BatchDefinition::new(BatchType::Sequential);
    chain.context = original.context.clone();
    chain.queue_name = original.queue_name.clone();
    chain.queue_config = original.queue_config.clone();
    chain.options.on_complete = Some(
        CallbackSpec::new(COMPENSATION_COMPLETE_CALLBACK)
            .arg(KEY_ORIGINAL_BATCH_ID, json!(original.id.to_string())),
    );
    chain.options.on_failure = Some(
        CallbackSpec::new(COMPENSATION_FAILED_CALLBACK)
            .arg(KEY_ORIGINAL_BATCH_ID, json!(original.id.to_string())),
    );

    let chain_id = chain.id;
    let mut jobs = Vec::with_capacity(targets.len());
    for (order, target) in targets.iter().enumerate() {
        let Some(compensation_class) = target.payload.compensation.clone() else {
            continue;
        };

        let mut args = target.payload.args.clone();
        args.insert(KEY_IS_COMPENSATION.to_string(), Value::Bool(true));
        args.insert(
            KEY_COMPENSATION_META.to_string(),
            json!({
                "original_batch_id": original.id.to_string(),
                "original_job_class": target.payload.class,
                "original_position": target.position,
                "original_result": target.result.clone().unwrap_or(Value::Null),
                "compensation_order": order,
            }),
        );

        jobs.push(JobRecord {
            id: Uuid::new_v4(),
            batch_id: chain_id,
            job_id: None,
            position: order as u32,
            status: JobStatus::Pending,
            payload: JobPayload {
                class: compensation_class,
                compensation: None,
                args,
            },
            result: None,
            error: None,
            completed_at: None,
        });
    }
    let chain = chain.with_jobs(jobs);

    storage.create_batch(&chain).await?;

    // Bookkeeping on the original so operators can correlate the two.
    if let Some(fresh) = storage.get_batch(original.id).await? {
        let mut context = fresh.context;
        context.insert(
            CTX_COMPENSATION_BATCH_ID.to_string(),
            Value::String(chain_id.to_string()),
        );
        context.insert(
            CTX_COMPENSATION_STATUS.to_string(),
            Value::String("running".to_string()),
        );
        context.insert(
            CTX_COMPENSATION_STARTED_AT.to_string(),
            Value::String(format_timestamp(crate::definition::now_second())),
        );
        storage
            .update_batch(original.id, BatchUpdate::new().context(context))
            .await?;
    }

    dispatcher.dispatch(&chain).await?;

    tracing::info!(
        batch_id = %original.id,
        compensation_batch_id = %chain_id,
        steps = chain.total_jobs,
        "Compensation chain launched"
    );
    Ok(Some(chain_id))
}

/// Register the built-in compensation callbacks; their factories capture the
/// storage handle so the callbacks can write back onto the original batch.
pub fn register_builtin_callbacks(registry: &JobRegistry, storage: Arc<dyn Storage>) {
    let complete_storage = storage.clone();
    registry.register(COMPENSATION_COMPLETE_CALLBACK, move || {
        Box::new(CompensationCompleteCallback {
            storage: complete_storage.clone(),
        })
    });
    registry.register(COMPENSATION_FAILED_CALLBACK, move || {
        Box::new(CompensationFailedCallback {
            storage: storage.clone(),
        })
    });
}

fn original_batch_id(args: &JsonMap) -> Result<Uuid> {
    let raw = args
        .get(KEY_ORIGINAL_BATCH_ID)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            BatchQueueError::InvalidJob("compensation callback without original_batch_id".into())
        })?;
    Uuid::parse_str(raw)
        .map_err(|e| BatchQueueError::InvalidJob(format!("bad original_batch_id {raw:?}: {e}")))
}

fn compensation_batch_id(args: &JsonMap) -> Option<Uuid> {
    args.get(KEY_BATCH_ID)
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
}

/// Reports a finished compensation chain back onto the original batch:
/// merges the chain's accumulated context (the rollback log) and stamps
/// `compensation_status = completed`.
struct CompensationCompleteCallback {
    storage: Arc<dyn Storage>,
}

#[async_trait]
impl JobHandler for CompensationCompleteCallback {
    async fn execute(&mut self, args: &JsonMap) -> Result<()> {
        let original_id = original_batch_id(args)?;
        let Some(original) = self.storage.get_batch(original_id).await? else {
            tracing::warn!(batch_id = %original_id, "Compensated batch no longer exists");
            return Ok(());
        };

        let mut context = original.context;
        if let Some(chain_id) = compensation_batch_id(args) {
            if let Some(chain) = self.storage.get_batch(chain_id).await? {
                for (key, value) in chain.context {
                    context.insert(key, value);
                }
            }
        }
        context.insert(
            CTX_COMPENSATION_STATUS.to_string(),
            Value::String("completed".to_string()),
        );
        context.insert(
            CTX_COMPENSATION_COMPLETED_AT.to_string(),
            Value::String(format_timestamp(crate::definition::now_second())),
        );

        self.storage
            .update_batch(original_id, BatchUpdate::new().context(context))
            .await?;
        tracing::info!(batch_id = %original_id, "Compensation completed");
        Ok(())
    }
}

/// Reports a failed compensation chain back onto the original batch with
/// `compensation_status = failed` and the error summary.
struct CompensationFailedCallback {
    storage: Arc<dyn Storage>,
}

#[async_trait]
impl JobHandler for CompensationFailedCallback {
    async fn execute(&mut self, args: &JsonMap) -> Result<()> {
        let original_id = original_batch_id(args)?;
        let Some(original) = self.storage.get_batch(original_id).await? else {
            tracing::warn!(batch_id = %original_id, "Compensated batch no longer exists");
            return Ok(());
        };

        let mut context = original.context;
        if let Some(chain_id) = compensation_batch_id(args) {
            if let Some(chain) = self.storage.get_batch(chain_id).await? {
                for (key, value) in chain.context {
                    context.insert(key, value);
                }
            }
        }
        context.insert(
            CTX_COMPENSATION_STATUS.to_string(),
            Value::String("failed".to_string()),
        );
        context.insert(
            CTX_COMPENSATION_COMPLETED_AT.to_string(),
            Value::String(format_timestamp(crate::definition::now_second())),
        );
        if let Some(error) = args.get(KEY_ERROR).and_then(Value::as_str) {
            context.insert(
                CTX_COMPENSATION_ERROR.to_string(),
                Value::String(error.to_string()),
            );
        }

        self.storage
            .update_batch(original_id, BatchUpdate::new().context(context))
            .await?;
        tracing::warn!(batch_id = %original_id, "Compensation failed");
        Ok(())
    }
}
