//! Fluent construction and dispatch of batches.

use crate::definition::{
    BatchDefinition, BatchOptions, BatchType, CallbackSpec, JobRecord, JobSpec, JsonMap,
};
use crate::error::{BatchQueueError, Result};
use crate::manager::ManagerInner;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Accumulates context, options, callbacks and queue selection, then
/// persists and enqueues the batch in one `dispatch` call.
pub struct BatchBuilder {
    inner: Arc<ManagerInner>,
    batch_type: BatchType,
    specs: Vec<JobSpec>,
    context: JsonMap,
    options: BatchOptions,
    fail_on_first_error: Option<bool>,
    queue_name: Option<String>,
    queue_config: Option<String>,
}

impl BatchBuilder {
    pub(crate) fn new(
        inner: Arc<ManagerInner>,
        batch_type: BatchType,
        specs: Vec<JobSpec>,
    ) -> Self {
        Self {
            inner,
            batch_type,
            specs,
            context: JsonMap::new(),
            options: BatchOptions::default(),
            fail_on_first_error: None,
            queue_name: None,
            queue_config: None,
        }
    }

    /// Append another job
    pub fn add_job(mut self, spec: impl Into<JobSpec>) -> Self {
        self.specs.push(spec.into());
        self
    }

    /// Replace the initial context map
    pub fn set_context(mut self, context: JsonMap) -> Self {
        self.context = context;
        self
    }

    /// Set a single context key
    pub fn context_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Callback job fired when the batch completes
    pub fn on_complete(mut self, callback: CallbackSpec) -> Self {
        self.options.on_complete = Some(callback);
        self
    }

    /// Callback job fired when the batch fails
    pub fn on_failure(mut self, callback: CallbackSpec) -> Self {
        self.options.on_failure = Some(callback);
        self
    }

    /// Operator-visible batch name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = Some(name.into());
        self
    }

    /// Per-message retry budget
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.options.max_retries = Some(max_retries);
        self
    }

    /// Delay between transport retries, seconds
    pub fn retry_delay(mut self, retry_delay: u64) -> Self {
        self.options.retry_delay = Some(retry_delay);
        self
    }

    /// Timeout hint, seconds
    pub fn timeout(mut self, timeout: u64) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Fire the failure callback on the first failing job
    pub fn fail_on_first_error(mut self, fail_on_first_error: bool) -> Self {
        self.fail_on_first_error = Some(fail_on_first_error);
        self
    }

    /// Route through a logical queue name
    pub fn queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    /// Pin the concrete queue, bypassing named and type routing
    pub fn queue_config(mut self, queue_config: impl Into<String>) -> Self {
        self.queue_config = Some(queue_config.into());
        self
    }

    /// Validate, persist and enqueue the batch, returning its id.
    ///
    /// Persists the batch and its full initial job set atomically, then
    /// enqueues the initial messages (every job for parallel batches, the
    /// first job for chains).
    pub async fn dispatch(self) -> Result<Uuid> {
        if self.specs.is_empty() {
            return Err(BatchQueueError::EmptyBatch);
        }

        for callback in [&self.options.on_complete, &self.options.on_failure]
            .into_iter()
            .flatten()
        {
            if !self.inner.registry.contains(&callback.class) {
                return Err(BatchQueueError::InvalidCallback(format!(
                    "unknown callback class {:?}",
                    callback.class
                )));
            }
        }

        let defaults = &self.inner.config.defaults;
        let mut options = self.options;
        options.fail_on_first_error = self
            .fail_on_first_error
            .unwrap_or(defaults.fail_on_first_error);
        if options.max_retries.is_none() && defaults.max_retries > 0 {
            options.max_retries = Some(defaults.max_retries);
        }
        if options.timeout.is_none() {
            options.timeout = defaults.timeout;
        }

        let queue_name = self
            .queue_name
            .or_else(|| self.inner.config.queue.name.clone());
        let resolved = self.inner.router.resolve(
            self.batch_type,
            queue_name.as_deref(),
            self.queue_config.as_deref(),
        );

        let mut batch = BatchDefinition::new(self.batch_type);
        batch.context = self.context;
        batch.options = options;
        batch.queue_name = queue_name;
        batch.queue_config = Some(resolved);

        let batch_id = batch.id;
        let mut jobs = Vec::with_capacity(self.specs.len());
        for (position, spec) in self.specs.into_iter().enumerate() {
            jobs.push(JobRecord::from_spec(
                spec,
                batch_id,
                position as u32,
                self.batch_type,
                &self.inner.registry,
            )?);
        }
        batch = batch.with_jobs(jobs);

        self.inner.storage.create_batch(&batch).await?;
        self.inner.dispatcher.dispatch(&batch).await?;

        tracing::info!(
            batch_id = %batch.id,
            batch_type = %batch.batch_type.as_str(),
            total_jobs = batch.total_jobs,
            queue = batch.queue_config.as_deref().unwrap_or_default(),
            "Batch dispatched"
        );
        Ok(batch.id)
    }
}
