//! The job capability trait and the class-name registry workers dispatch through.
//!
//! Queue payloads carry job classes as plain strings so the envelope stays
//! language-agnostic; the registry maps those strings to factory closures
//! producing fresh handler instances. Factories may capture shared state
//! (storage handles, managers) — the built-in compensation callbacks rely on
//! exactly that.

use crate::definition::JsonMap;
use crate::error::{BatchQueueError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A user job executed by a worker.
///
/// `execute` receives the full message args: the job's own arguments merged
/// with the batch context and the routing markers. Returning `Err` is the
/// failure signal; the processor records it and drives the batch failure
/// path.
///
/// The optional capabilities default to "not aware": a handler that never
/// overrides `context` keeps the batch context untouched, one that never
/// overrides `result` reports no result.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job
    async fn execute(&mut self, args: &JsonMap) -> Result<()>;

    /// Receive the batch context before execution (`ContextAware` opt-in)
    fn set_context(&mut self, _context: &JsonMap) {}

    /// Report the possibly-mutated context after execution (`ContextAware` opt-in)
    fn context(&self) -> Option<JsonMap> {
        None
    }

    /// Report a structured result after execution (`ResultAware` opt-in)
    fn result(&self) -> Option<Value> {
        None
    }
}

impl std::fmt::Debug for dyn JobHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn JobHandler")
    }
}

/// Factory producing a fresh handler per delivery
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn JobHandler> + Send + Sync>;

/// Registry mapping job class names to handler factories
#[derive(Clone, Default)]
pub struct JobRegistry {
    factories: Arc<RwLock<HashMap<String, HandlerFactory>>>,
}

impl JobRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler factory under a class name.
    ///
    /// Re-registering a name replaces the previous factory.
    pub fn register<F>(&self, class: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn JobHandler> + Send + Sync + 'static,
    {
        let class = class.into();
        tracing::debug!(class = %class, "Registering job handler");
        self.factories.write().insert(class, Arc::new(factory));
    }

    /// Check whether a class name is registered
    pub fn contains(&self, class: &str) -> bool {
        self.factories.read().contains_key(class)
    }

    /// Instantiate a fresh handler for a class name
    pub fn create(&self, class: &str) -> Result<Box<dyn JobHandler>> {
        let factories = self.factories.read();
        let factory = factories.get(class).ok_or_else(|| {
            BatchQueueError::InvalidJob(format!("unknown job class {class:?}"))
        })?;
        Ok(factory())
    }

    /// Registered class names, unordered
    pub fn names(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }

    /// Number of registered classes
    pub fn len(&self) -> usize {
        self.factories.read().len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.factories.read().is_empty()
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("classes", &self.names())
            .finish()
    }
}
