//! Worker-side handler for sequential chain queues.
//!
//! One chain step is in the queue per batch at any moment: each successful
//! step enqueues exactly its successor after committing, which gives strict
//! position order even across a worker fleet. A failing step stops the
//! advance, marks the batch failed and launches the compensation chain.

use crate::config::DefaultsConfig;
use crate::definition::{BatchStatus, JobFailure, JobStatus};
use crate::dispatcher::Dispatcher;
use crate::envelope::{BatchEnvelope, Envelope};
use crate::error::Result;
use crate::handler::JobRegistry;
use crate::processor::{
    compensation, finalize_batch, is_cancelled, mark_running, response_for_error, run_callback,
};
use crate::queue::{Delivery, DeliveryResponse, QueueTransport};
use crate::storage::Storage;
use std::sync::Arc;

/// Processes one chain step per delivery: run it with the accumulated
/// context, persist context changes, then either release the next position or
/// finish the batch.
pub struct ChainProcessor {
    storage: Arc<dyn Storage>,
    dispatcher: Dispatcher,
    registry: JobRegistry,
    defaults: DefaultsConfig,
}

impl ChainProcessor {
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
            Envelope::Batch(env) => match self.process_step(delivery, &env).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(
                        batch_id = %env.batch_id,
                        position = env.position,
                        error = %e,
                        "Chain processing error"
                    );
                    response_for_error(&e)
                }
            },
        }
    }

    async fn process_step(
        &self,
        delivery: &Delivery,
        env: &BatchEnvelope,
    ) -> Result<DeliveryResponse> {
        // Fresh read: picks up context updates and total_jobs growth from
        // earlier steps and dynamic appends.
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
            // Redelivery of a committed step; the successor is already queued.
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

        handler.set_context(&batch.context);

        match handler.execute(&delivery.args).await {
            Ok(()) => {
                if let Some(new_context) = handler.context() {
                    if new_context != batch.context {
                        self.storage
                            .update_batch(
                                batch.id,
                                crate::storage::BatchUpdate::new().context(new_context),
                            )
                            .await?;
                    }
                }

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

                // Reload for the advance: the step may have grown the chain
                // or rewritten the context.
                let Some(fresh) = self.storage.get_batch(env.batch_id).await? else {
                    return Ok(DeliveryResponse::Reject);
                };

                if completed >= fresh.total_jobs {
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
                } else {
                    match fresh.next_sequential_job(env.position) {
                        Some(next) => {
                            self.dispatcher.enqueue_job(&fresh, next).await?;
                        }
                        None => {
                            tracing::warn!(
                                batch_id = %fresh.id,
                                position = env.position,
                                total_jobs = fresh.total_jobs,
                                "Gap in chain positions, cannot advance"
                            );
                        }
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
                    "Chain step failed"
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
                self.storage.increment_failed_jobs(env.batch_id).await?;

                let Some(fresh) = self.storage.get_batch(env.batch_id).await? else {
                    return Ok(DeliveryResponse::Reject);
                };

                // Stop advancing: positions above the failed step stay pending.
                let owned = finalize_batch(
                    &self.storage,
                    &fresh,
                    batch.status,
                    BatchStatus::Failed,
                    self.defaults.sticky_terminal,
                )
                .await?;

                if owned {
                    if let Some(callback) = &fresh.options.on_failure {
                        self.dispatcher
                            .enqueue_callback(&fresh, callback, BatchStatus::Failed, Some(&message))
                            .await?;
                    }

                    if !fresh
                        .context
                        .contains_key(compensation::CTX_COMPENSATION_BATCH_ID)
                    {
                        compensation::launch(&self.storage, &self.dispatcher, &fresh).await?;
                    }
                }

                // The failure is fully recorded and compensation is on its
                // way; retrying the step would fork the saga.
                Ok(DeliveryResponse::Ack)
            }
        }
    }
}
