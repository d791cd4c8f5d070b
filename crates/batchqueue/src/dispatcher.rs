//! Translates stored batches into queue messages.
//!
//! Parallel batches enqueue every job up front; sequential chains enqueue
//! only position 0 and rely on the chain processor to release each
//! successor.

use crate::definition::{BatchDefinition, BatchStatus, BatchType, CallbackSpec, JobRecord};
use crate::envelope;
use crate::error::{BatchQueueError, Result};
use crate::queue::{PushOptions, QueueTransport};
use std::sync::Arc;

/// Producer-side enqueue operations shared by the builder and the processors
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn QueueTransport>,
}

impl Dispatcher {
    /// Build a dispatcher over a transport
    pub fn new(transport: Arc<dyn QueueTransport>) -> Self {
        Self { transport }
    }

    /// Enqueue the initial messages for a freshly persisted batch
    pub async fn dispatch(&self, batch: &BatchDefinition) -> Result<()> {
        match batch.batch_type {
            BatchType::Parallel => {
                for job in &batch.jobs {
                    self.enqueue_job(batch, job).await?;
                }
                tracing::info!(
                    batch_id = %batch.id,
                    jobs = batch.jobs.len(),
                    "Parallel batch dispatched"
                );
            }
            BatchType::Sequential => {
                let Some(first) = batch.job_at_position(0) else {
                    return Err(BatchQueueError::EmptyBatch);
                };
                self.enqueue_job(batch, first).await?;
                tracing::info!(
                    batch_id = %batch.id,
                    total_jobs = batch.total_jobs,
                    "Chain dispatched"
                );
            }
        }
        Ok(())
    }

    /// Enqueue one job of a batch, returning the queue message id
    pub async fn enqueue_job(&self, batch: &BatchDefinition, job: &JobRecord) -> Result<String> {
        let queue = resolved_queue(batch)?;
        let args = envelope::job_args(batch, job);
        let options = PushOptions::from(&batch.options);

        let message_id = self
            .transport
            .push(queue, &job.payload.class, args, &options)
            .await?;
        tracing::debug!(
            batch_id = %batch.id,
            position = job.position,
            class = %job.payload.class,
            message_id = %message_id,
            "Job enqueued"
        );
        Ok(message_id)
    }

    /// Enqueue a completion/failure callback job onto the batch's queue
    pub async fn enqueue_callback(
        &self,
        batch: &BatchDefinition,
        spec: &CallbackSpec,
        status: BatchStatus,
        error: Option<&str>,
    ) -> Result<String> {
        let queue = resolved_queue(batch)?;
        let args = envelope::callback_args(spec, batch.id, status, error);

        let message_id = self
            .transport
            .push(queue, &spec.class, args, &PushOptions::default())
            .await?;
        tracing::debug!(
            batch_id = %batch.id,
            class = %spec.class,
            status = %status.as_str(),
            "Callback enqueued"
        );
        Ok(message_id)
    }
}

fn resolved_queue(batch: &BatchDefinition) -> Result<&str> {
    batch.queue_config.as_deref().ok_or_else(|| {
        BatchQueueError::InvalidConfiguration(format!(
            "batch {} has no resolved queue",
            batch.id
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{BatchType, JobPayload, JobStatus, JsonMap};
    use crate::envelope::{KEY_BATCH_ID, KEY_IS_CALLBACK, KEY_JOB_POSITION};
    use crate::queue::memory::InMemoryTransport;
    use serde_json::json;
    use uuid::Uuid;

    fn batch_with_jobs(batch_type: BatchType, count: u32) -> BatchDefinition {
        let mut batch = BatchDefinition::new(batch_type);
        batch.queue_config = Some("work".to_string());
        let batch_id = batch.id;
        let jobs = (0..count)
            .map(|position| JobRecord {
                id: Uuid::new_v4(),
                batch_id,
                job_id: None,
                position,
                status: JobStatus::Pending,
                payload: JobPayload {
                    class: format!("Job{position}"),
                    compensation: None,
                    args: JsonMap::new(),
                },
                result: None,
                error: None,
                completed_at: None,
            })
            .collect();
        batch.with_jobs(jobs)
    }

    #[tokio::test]
    async fn test_parallel_enqueues_every_job() {
        let transport = Arc::new(InMemoryTransport::new());
        let dispatcher = Dispatcher::new(transport.clone());
        let batch = batch_with_jobs(BatchType::Parallel, 3);

        dispatcher.dispatch(&batch).await.unwrap();
        assert_eq!(transport.len("work"), 3);
    }

    #[tokio::test]
    async fn test_sequential_enqueues_first_only() {
        let transport = Arc::new(InMemoryTransport::new());
        let dispatcher = Dispatcher::new(transport.clone());
        let batch = batch_with_jobs(BatchType::Sequential, 3);

        dispatcher.dispatch(&batch).await.unwrap();
        assert_eq!(transport.len("work"), 1);

        let delivery = transport.receive("work").unwrap();
        assert_eq!(delivery.class, "Job0");
        assert_eq!(delivery.args.get(KEY_JOB_POSITION), Some(&json!(0)));
        assert_eq!(
            delivery.args.get(KEY_BATCH_ID),
            Some(&json!(batch.id.to_string()))
        );
    }

    #[tokio::test]
    async fn test_callback_envelope() {
        let transport = Arc::new(InMemoryTransport::new());
        let dispatcher = Dispatcher::new(transport.clone());
        let batch = batch_with_jobs(BatchType::Parallel, 1);

        dispatcher
            .enqueue_callback(
                &batch,
                &CallbackSpec::new("Notify"),
                BatchStatus::Completed,
                None,
            )
            .await
            .unwrap();

        let delivery = transport.receive("work").unwrap();
        assert_eq!(delivery.class, "Notify");
        assert_eq!(delivery.args.get(KEY_IS_CALLBACK), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_unresolved_queue_is_an_error() {
        let transport = Arc::new(InMemoryTransport::new());
        let dispatcher = Dispatcher::new(transport);
        let mut batch = batch_with_jobs(BatchType::Parallel, 1);
        batch.queue_config = None;

        let err = dispatcher.dispatch(&batch).await.unwrap_err();
        assert!(matches!(err, BatchQueueError::InvalidConfiguration(_)));
    }
}
