//! Worker-side handler for parallel batch queues.

use crate::config::DefaultsConfig;
use crate::definition::{BatchStatus, JobFailure, JobStatus};
use crate::dispatcher::Dispatcher;
use crate::envelope::{BatchEnvelope, Envelope};
use crate::error::Result;
use crate::handler::JobRegistry;
use crate::processor::{
    finalize_batch, is_cancelled, mark_running, response_for_error, run_callback,
};
use crate::queue::{Delivery, DeliveryResponse, QueueTransport};
use crate::storage::Storage;
use std::sync::Arc;

/// Processes one parallel job per delivery: run it, update the counters, and
/// detect batch completion. Counter updates recount from row state, so queue
/// redeliveries never double-count.
pub struct ParallelProcessor {
    storage: Arc<dyn Storage>,
    dispatcher: Dispatcher,
    registry: JobRegistry,
    defaults: DefaultsConfig,
}

impl ParallelProcessor {
    /// Build a processor over the shared collaborators
    pub fn new(
        storage: Arc<dyn Storage>,
        transport: Arc<dyn QueueTransport>,
        registry: JobRegistry,
        defaults: DefaultsConfig,
    ) -> Self {
        Self {
            storage,
            dispatcher: Dispatcher::new(transport),
            registry,
            defaults,
        }
    }

    /// Process one delivery
    pub async fn process(&self, delivery: &Delivery) -> DeliveryResponse {
        let envelope = match Envelope::parse(&delivery.args) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    message_id = %delivery.message_id,
                    error = %e,
                    "Poison envelope"
                );
                return DeliveryResponse::Reject;
            }
        };

        match envelope {
            Envelope::Callback(_) => run_callback(&self.registry, delivery).await,
            Envelope::PassThrough => {
                tracing::debug!(class = %delivery.class, "Pass-through message acknowledged");
                DeliveryResponse::Ack
            }
            Envelope::Batch(env) => match self.process_job(delivery, &env).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(
                        batch_id = %env.batch_id,
                        position = env.position,
                        error = %e,
                        "Parallel processing error"
                    );
                    response_for_error(&e)
                }
            },
        }
    }

    async fn process_job(
        &self,
        delivery: &Delivery,
        env: &BatchEnvelope,
    ) -> Result<DeliveryResponse> {
        let Some(batch) = self.storage.get_batch(env.batch_id).await? else {
            tracing::warn!(batch_id = %env.batch_id, "Delivery for unknown batch");
            return Ok(DeliveryResponse::Reject);
        };
        if is_cancelled(&batch) {
            tracing::debug!(batch_id = %batch.id, "Delivery for cancelled batch");
            return Ok(DeliveryResponse::Reject);
        }

        let Some(row) = self
            .storage
            .get_job_by_position(env.batch_id, env.position)
            .await?
        else {
            tracing::warn!(
                batch_id = %env.batch_id,
                position = env.position,
                "Delivery for unknown job position"
            );
            return Ok(DeliveryResponse::Reject);
        };
        if row.status == JobStatus::Completed {
            // Redelivery of an already handled message.
            return Ok(DeliveryResponse::Ack);
        }

        self.storage
            .update_job_id(env.batch_id, env.position, &delivery.message_id)
            .await?;
        self.storage
            .update_job_status(
                env.batch_id,
                &delivery.message_id,
                JobStatus::Running,
                None,
                None,
            )
            .await?;
        mark_running(&self.storage, &batch).await?;

        let mut handler = match self.registry.create(&delivery.class) {
            Ok(handler) => handler,
            Err(e) => {
                tracing::warn!(class = %delivery.class, error = %e, "Unknown job class");
                return Ok(DeliveryResponse::Reject);
            }
        };

        match handler.execute(&delivery.args).await {
            Ok(()) => {
                self.storage
                    .update_job_status(
                        env.batch_id,
                        &delivery.message_id,
                        JobStatus::Completed,
                        handler.result(),
                        None,
                    )
                    .await?;
                let completed = self.storage.increment_completed_jobs(env.batch_id).await?;

                let Some(fresh) = self.storage.get_batch(env.batch_id).await? else {
                    return Ok(DeliveryResponse::Reject);
                };

                if completed >= fresh.total_jobs && fresh.failed_jobs == 0 {
                    let owned = finalize_batch(
                        &self.storage,
                        &fresh,
                        batch.status,
                        BatchStatus::Completed,
                        self.defaults.sticky_terminal,
                    )
                    .await?;
                    if owned {
                        if let Some(callback) = &fresh.options.on_complete {
                            self.dispatcher
                                .enqueue_callback(&fresh, callback, BatchStatus::Completed, None)
                                .await?;
                        }
                    }
                } else if fresh.status == BatchStatus::Failed
                    && completed + fresh.failed_jobs >= fresh.total_jobs
                    && !fresh.options.fail_on_first_error
                {
                    // A batch that failed earlier just drained: fire the late
                    // failure callback now that the survivors finished.
                    if let Some(callback) = &fresh.options.on_failure {
                        let error = first_error_message(&fresh);
                        self.dispatcher
                            .enqueue_callback(
                                &fresh,
                                callback,
                                BatchStatus::Failed,
                                error.as_deref(),
                            )
                            .await?;
                    }
                }

                Ok(DeliveryResponse::Ack)
            }
            Err(e) => {
                tracing::warn!(
                    batch_id = %env.batch_id,
                    position = env.position,
                    class = %delivery.class,
                    error = %e,
                    "Parallel job failed"
                );
                let failure = JobFailure::from(&e);
                let message = failure.message.clone();

                self.storage
                    .update_job_status(
                        env.batch_id,
                        &delivery.message_id,
                        JobStatus::Failed,
                        None,
                        Some(failure),
                    )
                    .await?;
                let failed = self.storage.increment_failed_jobs(env.batch_id).await?;

                let Some(fresh) = self.storage.get_batch(env.batch_id).await? else {
                    return Ok(DeliveryResponse::Reject);
                };

                let owned = finalize_batch(
                    &self.storage,
                    &fresh,
                    batch.status,
                    BatchStatus::Failed,
                    self.defaults.sticky_terminal,
                )
                .await?;

                if let Some(callback) = &fresh.options.on_failure {
                    let drained = fresh.completed_jobs + failed >= fresh.total_jobs;
                    let fire = if fresh.options.fail_on_first_error {
                        owned
                    } else {
                        drained
                    };
                    if fire {
                        self.dispatcher
                            .enqueue_callback(&fresh, callback, BatchStatus::Failed, Some(&message))
                            .await?;
                    }
                }

                // The failure is durably recorded and counted; redelivering
                // it would re-run the job against already-committed counters.
                Ok(DeliveryResponse::Ack)
            }
        }
    }
}

fn first_error_message(batch: &crate::definition::BatchDefinition) -> Option<String> {
    batch
        .jobs
        .iter()
        .filter(|job| job.status == JobStatus::Failed)
        .find_map(|job| job.error.as_ref().map(|error| error.message.clone()))
}
