//! Single-message worker loop over the in-memory transport.
//!
//! Production deployments consume queues with the host's worker tooling and
//! hand each delivery to a [`Processor`]; this loop provides the same
//! behavior for local development and integration tests. One message is
//! processed at a time, matching the delivery model the processors assume.

use crate::processor::Processor;
use crate::queue::memory::InMemoryTransport;
use crate::queue::DeliveryResponse;
use std::sync::Arc;

/// Pulls messages from one queue and routes them through a processor
pub struct Worker {
    transport: Arc<InMemoryTransport>,
    queue: String,
    processor: Processor,
}

impl Worker {
    /// Bind a worker to a queue and its processor variant
    pub fn new(
        transport: Arc<InMemoryTransport>,
        queue: impl Into<String>,
        processor: Processor,
    ) -> Self {
        Self {
            transport,
            queue: queue.into(),
            processor,
        }
    }

    /// The queue this worker consumes
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Process at most one message; `None` when the queue is idle
    pub async fn run_once(&self) -> Option<DeliveryResponse> {
        let delivery = self.transport.receive(&self.queue)?;
        tracing::debug!(
            queue = %self.queue,
            class = %delivery.class,
            message_id = %delivery.message_id,
            "Processing delivery"
        );

        let response = self.processor.process(&delivery).await;
        self.transport.settle(&self.queue, &delivery, response);
        Some(response)
    }

    /// Process messages until the queue is idle, returning how many ran
    pub async fn drain(&self) -> u64 {
        let mut processed = 0;
        while self.run_once().await.is_some() {
            processed += 1;
        }
        processed
    }
}

/// Drain several workers together until every queue is idle.
///
/// Needed when processing one queue enqueues follow-up work on another, like
/// a chain firing callbacks or compensation onto its own queue while a
/// parallel queue still holds jobs.
pub async fn drain_all(workers: &[Worker]) -> u64 {
    let mut processed = 0;
    loop {
        let mut idle = true;
        for worker in workers {
            if worker.run_once().await.is_some() {
                processed += 1;
                idle = false;
            }
        }
        if idle {
            return processed;
        }
    }
}
