//! Worker-side message processors.
//!
//! Each worker is configured with the processor variant matching the queue it
//! consumes; the variant is a tagged enum, not a trait hierarchy. Both
//! variants share the envelope routing, callback execution and terminal
//! transition logic below.

pub mod compensation;

mod chain;
mod parallel;

pub use chain::ChainProcessor;
pub use parallel::ParallelProcessor;

use crate::definition::{BatchDefinition, BatchStatus};
use crate::error::{BatchQueueError, Result};
use crate::handler::JobRegistry;
use crate::manager::CTX_CANCELLED;
use crate::queue::{Delivery, DeliveryResponse};
use crate::storage::{BatchUpdate, Storage};
use serde_json::Value;
use std::sync::Arc;

/// Processor variant a worker dispatches deliveries through
pub enum Processor {
    /// Handles parallel batch queues
    Parallel(ParallelProcessor),
    /// Handles sequential chain queues
    Chain(ChainProcessor),
}

impl Processor {
    /// Process one delivery and produce the transport response
    pub async fn process(&self, delivery: &Delivery) -> DeliveryResponse {
        match self {
            Processor::Parallel(processor) => processor.process(delivery).await,
            Processor::Chain(processor) => processor.process(delivery).await,
        }
    }
}

/// Map an error to the transport response: transient problems redeliver,
/// everything else is poison.
pub(crate) fn response_for_error(err: &BatchQueueError) -> DeliveryResponse {
    if err.is_retryable() {
        DeliveryResponse::Requeue
    } else {
        DeliveryResponse::Reject
    }
}

/// Execute a callback delivery. Callbacks never touch batch counters.
pub(crate) async fn run_callback(registry: &JobRegistry, delivery: &Delivery) -> DeliveryResponse {
    let mut handler = match registry.create(&delivery.class) {
        Ok(handler) => handler,
        Err(e) => {
            tracing::warn!(class = %delivery.class, error = %e, "Unknown callback class");
            return DeliveryResponse::Reject;
        }
    };

    match handler.execute(&delivery.args).await {
        Ok(()) => DeliveryResponse::Ack,
        Err(e) => {
            tracing::warn!(class = %delivery.class, error = %e, "Callback execution failed");
            response_for_error(&e)
        }
    }
}

/// Check the cancelled tombstone a batch carries after `cancel_batch`
pub(crate) fn is_cancelled(batch: &BatchDefinition) -> bool {
    batch.context.get(CTX_CANCELLED).and_then(Value::as_bool) == Some(true)
}

/// Transition a pending batch to running on first pickup
pub(crate) async fn mark_running(storage: &Arc<dyn Storage>, batch: &BatchDefinition) -> Result<()> {
    if batch.status == BatchStatus::Pending {
        storage
            .update_batch(batch.id, BatchUpdate::new().status(BatchStatus::Running))
            .await?;
    }
    Ok(())
}

/// Drive a batch to a terminal status.
///
/// Returns `true` when the batch ends up in `to` and the caller's entry
/// snapshot was not yet terminal, i.e. this delivery owns the transition and
/// must fire its callbacks. With `sticky` the first terminal state wins; a
/// `completed` write additionally requires `failed_jobs == 0` so the batch
/// invariants hold on every commit.
pub(crate) async fn finalize_batch(
    storage: &Arc<dyn Storage>,
    fresh: &BatchDefinition,
    entry_status: BatchStatus,
    to: BatchStatus,
    sticky: bool,
) -> Result<bool> {
    if to == BatchStatus::Completed && fresh.failed_jobs > 0 {
        return Ok(false);
    }

    if fresh.status != to {
        if sticky && fresh.status.is_terminal() {
            tracing::debug!(
                batch_id = %fresh.id,
                current = %fresh.status.as_str(),
                requested = %to.as_str(),
                "Terminal status is sticky, keeping current"
            );
            return Ok(false);
        }
        storage
            .update_batch(
                fresh.id,
                BatchUpdate::new()
                    .status(to)
                    .completed_at(crate::definition::now_second()),
            )
            .await?;
        tracing::info!(batch_id = %fresh.id, status = %to.as_str(), "Batch finished");
    }

    Ok(!entry_status.is_terminal())
}
