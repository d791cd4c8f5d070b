//! Resolution of logical batch types and named queues to concrete queue names.

use crate::config::{
    ProcessorKind, QueuesConfig, DEFAULT_PARALLEL_QUEUE, DEFAULT_SEQUENTIAL_QUEUE,
};
use crate::definition::BatchType;

/// Maps a batch's logical routing inputs to the concrete queue its messages
/// land on, and queues back to the processor variant that consumes them.
#[derive(Debug, Clone, Default)]
pub struct QueueRouter {
    queues: QueuesConfig,
}

impl QueueRouter {
    /// Build a router from the routing table
    pub fn new(queues: QueuesConfig) -> Self {
        Self { queues }
    }

    /// Resolve the concrete queue for a batch.
    ///
    /// Priority: explicit `queue_config` from the builder, then the
    /// `named.<queue_name>` entry, then the per-type override, then the hard
    /// defaults.
    pub fn resolve(
        &self,
        batch_type: BatchType,
        queue_name: Option<&str>,
        explicit: Option<&str>,
    ) -> String {
        if let Some(explicit) = explicit {
            return explicit.to_string();
        }

        if let Some(name) = queue_name {
            if let Some(entry) = self.queues.named.get(name) {
                if let Some(queue_config) = &entry.queue_config {
                    return queue_config.clone();
                }
            }
        }

        let type_default = match batch_type {
            BatchType::Parallel => self.queues.default.parallel.as_deref(),
            BatchType::Sequential => self.queues.default.sequential.as_deref(),
        };
        if let Some(queue) = type_default {
            return queue.to_string();
        }

        match batch_type {
            BatchType::Parallel => DEFAULT_PARALLEL_QUEUE.to_string(),
            BatchType::Sequential => DEFAULT_SEQUENTIAL_QUEUE.to_string(),
        }
    }

    /// Which processor variant consumes a concrete queue.
    ///
    /// Consults named entries, then type entries, then falls back to matching
    /// the per-type defaults; unknown queues are assumed parallel.
    pub fn processor_for(&self, queue: &str) -> ProcessorKind {
        for entry in self.queues.named.values() {
            if entry.queue_config.as_deref() == Some(queue) {
                if let Some(kind) = entry.processor {
                    return kind;
                }
            }
        }

        for entry in self.queues.types.values() {
            if entry.queue_config.as_deref() == Some(queue) {
                if let Some(kind) = entry.processor {
                    return kind;
                }
            }
        }

        let sequential_default = self
            .queues
            .default
            .sequential
            .as_deref()
            .unwrap_or(DEFAULT_SEQUENTIAL_QUEUE);
        if queue == sequential_default {
            ProcessorKind::Sequential
        } else {
            ProcessorKind::Parallel
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NamedQueueConfig;

    fn router_with_named() -> QueueRouter {
        let mut queues = QueuesConfig::default();
        queues.named.insert(
            "reports".to_string(),
            NamedQueueConfig {
                queue_config: Some("reporting".to_string()),
                processor: Some(ProcessorKind::Sequential),
            },
        );
        queues.default.parallel = Some("fast-lane".to_string());
        QueueRouter::new(queues)
    }

    #[test]
    fn test_explicit_queue_config_wins() {
        let router = router_with_named();
        assert_eq!(
            router.resolve(BatchType::Parallel, Some("reports"), Some("pinned")),
            "pinned"
        );
    }

    #[test]
    fn test_named_entry_before_type_default() {
        let router = router_with_named();
        assert_eq!(
            router.resolve(BatchType::Parallel, Some("reports"), None),
            "reporting"
        );
    }

    #[test]
    fn test_type_default_before_hard_default() {
        let router = router_with_named();
        assert_eq!(
            router.resolve(BatchType::Parallel, None, None),
            "fast-lane"
        );
        assert_eq!(
            router.resolve(BatchType::Sequential, None, None),
            DEFAULT_SEQUENTIAL_QUEUE
        );
    }

    #[test]
    fn test_unknown_queue_name_falls_through() {
        let router = router_with_named();
        assert_eq!(
            router.resolve(BatchType::Sequential, Some("unlisted"), None),
            DEFAULT_SEQUENTIAL_QUEUE
        );
    }

    #[test]
    fn test_processor_for() {
        let router = router_with_named();
        assert_eq!(router.processor_for("reporting"), ProcessorKind::Sequential);
        assert_eq!(
            router.processor_for(DEFAULT_SEQUENTIAL_QUEUE),
            ProcessorKind::Sequential
        );
        assert_eq!(router.processor_for("fast-lane"), ProcessorKind::Parallel);
        assert_eq!(router.processor_for("anything-else"), ProcessorKind::Parallel);
    }
}
