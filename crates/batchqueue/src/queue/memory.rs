//! In-memory queue transport for local development and integration tests.

use crate::definition::JsonMap;
use crate::error::Result;
use crate::queue::{Delivery, DeliveryResponse, PushOptions, QueueTransport};
use async_trait::async_trait;
use crossbeam_queue::SegQueue;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

struct QueuedMessage {
    delivery: Delivery,
    attempts: u32,
    max_retries: u32,
}

/// In-memory named FIFO queues with at-least-once semantics.
///
/// Each named queue is a lock-free `crossbeam` [`SegQueue`]; the queue map
/// and the in-flight/retry bookkeeping sit behind `parking_lot` locks.
/// `Requeue` re-delivers the same message id until its retry budget
/// (`PushOptions::max_retries`, default 0) is exhausted, then the message is
/// dropped with a warning. One message per queue is in flight at a time,
/// matching the delivery guarantee the processors rely on.
#[derive(Default)]
pub struct InMemoryTransport {
    queues: RwLock<HashMap<String, Arc<SegQueue<QueuedMessage>>>>,
    in_flight: RwLock<HashMap<String, QueuedMessage>>,
}

impl InMemoryTransport {
    /// Create an empty transport
    pub fn new() -> Self {
        Self::default()
    }

    fn queue_handle(&self, queue: &str) -> Arc<SegQueue<QueuedMessage>> {
        if let Some(existing) = self.queues.read().get(queue) {
            return existing.clone();
        }
        self.queues
            .write()
            .entry(queue.to_string())
            .or_default()
            .clone()
    }

    /// Pull the next message off a queue, marking it in flight
    pub fn receive(&self, queue: &str) -> Option<Delivery> {
        let handle = self.queues.read().get(queue)?.clone();
        let message = handle.pop()?;
        let delivery = message.delivery.clone();
        self.in_flight
            .write()
            .insert(delivery.message_id.clone(), message);
        tracing::debug!(queue = %queue, message_id = %delivery.message_id, "Message received");
        Some(delivery)
    }

    /// Apply a processor response to an in-flight message
    pub fn settle(&self, queue: &str, delivery: &Delivery, response: DeliveryResponse) {
        let Some(mut message) = self.in_flight.write().remove(&delivery.message_id) else {
            tracing::warn!(message_id = %delivery.message_id, "Settle for unknown message");
            return;
        };

        match response {
            DeliveryResponse::Ack => {}
            DeliveryResponse::Reject => {
                tracing::debug!(
                    queue = %queue,
                    message_id = %delivery.message_id,
                    "Message rejected"
                );
            }
            DeliveryResponse::Requeue => {
                message.attempts += 1;
                if message.attempts > message.max_retries {
                    tracing::warn!(
                        queue = %queue,
                        message_id = %delivery.message_id,
                        attempts = message.attempts,
                        "Retry budget exhausted, dropping message"
                    );
                } else {
                    self.queue_handle(queue).push(message);
                }
            }
        }
    }

    /// Number of queued (not in-flight) messages on one queue
    pub fn len(&self, queue: &str) -> usize {
        self.queues
            .read()
            .get(queue)
            .map(|handle| handle.len())
            .unwrap_or(0)
    }

    /// Check if a queue has no pending messages
    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Total queued messages across all queues
    pub fn total_len(&self) -> usize {
        self.queues
            .read()
            .values()
            .map(|handle| handle.len())
            .sum()
    }

    /// Names of queues that have seen at least one push
    pub fn queue_names(&self) -> Vec<String> {
        self.queues.read().keys().cloned().collect()
    }
}

#[async_trait]
impl QueueTransport for InMemoryTransport {
    async fn push(
        &self,
        queue: &str,
        class: &str,
        args: JsonMap,
        options: &PushOptions,
    ) -> Result<String> {
        let message_id = Uuid::new_v4().to_string();
        let message = QueuedMessage {
            delivery: Delivery {
                message_id: message_id.clone(),
                class: class.to_string(),
                args,
            },
            attempts: 0,
            max_retries: options.max_retries.unwrap_or(0),
        };

        self.queue_handle(queue).push(message);

        tracing::debug!(
            queue = %queue,
            class = %class,
            message_id = %message_id,
            "Message pushed"
        );
        Ok(message_id)
    }
}
