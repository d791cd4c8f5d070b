//! Queue transport contract and delivery types.

pub mod memory;

use crate::definition::{BatchOptions, JsonMap};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Durable FIFO transport with at-least-once, per-named-queue delivery.
///
/// The orchestrator only needs the producer side; consuming is owned by the
/// host's worker tooling. Redeliveries are permitted and the processors are
/// idempotent under them.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Durably enqueue a message, returning the queue-provided message id
    async fn push(
        &self,
        queue: &str,
        class: &str,
        args: JsonMap,
        options: &PushOptions,
    ) -> Result<String>;
}

/// Per-message transport options derived from batch options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushOptions {
    /// Redeliveries granted before the transport drops the message
    pub max_retries: Option<u32>,
    /// Delay between redeliveries, in seconds
    pub retry_delay: Option<u64>,
    /// Timeout hint in seconds
    pub timeout: Option<u64>,
}

impl From<&BatchOptions> for PushOptions {
    fn from(options: &BatchOptions) -> Self {
        Self {
            max_retries: options.max_retries,
            retry_delay: options.retry_delay,
            timeout: options.timeout,
        }
    }
}

/// One message handed to a processor
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Queue-provided message id, stable across redeliveries
    pub message_id: String,
    /// Job class name
    pub class: String,
    /// Message args: user args merged with context and routing markers
    pub args: JsonMap,
}

/// Processor verdict on a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResponse {
    /// Done, delete the message
    Ack,
    /// Poison message, discard without redelivery
    Reject,
    /// Transient problem, redeliver per the transport's retry policy
    Requeue,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::BatchOptions;

    #[test]
    fn test_push_options_from_batch_options() {
        let mut options = BatchOptions::default();
        options.max_retries = Some(3);
        options.timeout = Some(120);

        let push = PushOptions::from(&options);
        assert_eq!(push.max_retries, Some(3));
        assert_eq!(push.retry_delay, None);
        assert_eq!(push.timeout, Some(120));
    }
}
