//! The public entry point binding storage, transport, registry and config.

use crate::builder::BatchBuilder;
use crate::config::BatchQueueConfig;
use crate::definition::{BatchDefinition, BatchStatus, BatchType, JobRecord, JobSpec};
use crate::dispatcher::Dispatcher;
use crate::error::{BatchQueueError, Result};
use crate::handler::JobRegistry;
use crate::processor::{compensation, ChainProcessor, ParallelProcessor};
use crate::queue::QueueTransport;
use crate::routing::QueueRouter;
use crate::storage::{BatchFilter, BatchUpdate, Storage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Context key marking a cancelled batch tombstone
pub const CTX_CANCELLED: &str = "cancelled";

pub(crate) struct ManagerInner {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) transport: Arc<dyn QueueTransport>,
    pub(crate) registry: JobRegistry,
    pub(crate) router: QueueRouter,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) config: BatchQueueConfig,
}

/// Orchestration facade: builds, dispatches, inspects, extends, cancels and
/// cleans up batches. Cheap to clone; all clones share the same backends.
#[derive(Clone)]
pub struct BatchManager {
    inner: Arc<ManagerInner>,
}

impl BatchManager {
    /// Bind a manager to its collaborators.
    ///
    /// Registers the built-in compensation callbacks into the registry.
    pub fn new(
        storage: Arc<dyn Storage>,
        transport: Arc<dyn QueueTransport>,
        registry: JobRegistry,
        config: BatchQueueConfig,
    ) -> Self {
        compensation::register_builtin_callbacks(&registry, storage.clone());

        let inner = Arc::new(ManagerInner {
            router: QueueRouter::new(config.queues.clone()),
            dispatcher: Dispatcher::new(transport.clone()),
            storage,
            transport,
            registry,
            config,
        });
        Self { inner }
    }

    /// Start building a parallel batch
    pub fn batch(&self, jobs: Vec<JobSpec>) -> BatchBuilder {
        BatchBuilder::new(self.inner.clone(), BatchType::Parallel, jobs)
    }

    /// Start building a sequential chain
    pub fn chain(&self, jobs: Vec<JobSpec>) -> BatchBuilder {
        BatchBuilder::new(self.inner.clone(), BatchType::Sequential, jobs)
    }

    /// The job class registry
    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    /// The queue router
    pub fn router(&self) -> &QueueRouter {
        &self.inner.router
    }

    /// The configuration the manager was built with
    pub fn config(&self) -> &BatchQueueConfig {
        &self.inner.config
    }

    /// The storage backend
    pub fn storage(&self) -> Arc<dyn Storage> {
        self.inner.storage.clone()
    }

    /// A worker-side processor for parallel queues
    pub fn parallel_processor(&self) -> ParallelProcessor {
        ParallelProcessor::new(
            self.inner.storage.clone(),
            self.inner.transport.clone(),
            self.inner.registry.clone(),
            self.inner.config.defaults.clone(),
        )
    }

    /// A worker-side processor for sequential queues
    pub fn chain_processor(&self) -> ChainProcessor {
        ChainProcessor::new(
            self.inner.storage.clone(),
            self.inner.transport.clone(),
            self.inner.registry.clone(),
            self.inner.config.defaults.clone(),
        )
    }

    /// Load a batch with its jobs
    pub async fn get_batch(&self, batch_id: Uuid) -> Result<Option<BatchDefinition>> {
        self.inner.storage.get_batch(batch_id).await
    }

    /// Progress counters for a batch
    pub async fn get_progress(&self, batch_id: Uuid) -> Result<BatchProgress> {
        let batch = self
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| BatchQueueError::BatchNotFound {
                batch_id: batch_id.to_string(),
            })?;
        Ok(BatchProgress::from(&batch))
    }

    /// List batches matching a filter, newest first
    pub async fn get_batches(
        &self,
        filter: &BatchFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<BatchDefinition>> {
        self.inner.storage.get_batches(filter, limit, offset).await
    }

    /// Count batches matching a filter
    pub async fn count_batches(&self, filter: &BatchFilter) -> Result<u64> {
        self.inner.storage.count_batches(filter).await
    }

    /// Append jobs to a non-terminal batch.
    ///
    /// Parallel batches enqueue the appended jobs immediately so the new work
    /// runs promptly; a running chain picks the new positions up through its
    /// normal step-advance reload.
    pub async fn add_jobs(
        &self,
        batch_id: Uuid,
        jobs: Vec<JobSpec>,
    ) -> Result<BatchDefinition> {
        let batch = self
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| BatchQueueError::BatchNotFound {
                batch_id: batch_id.to_string(),
            })?;

        if batch.status.is_terminal() {
            return Err(BatchQueueError::BatchClosed {
                batch_id: batch_id.to_string(),
            });
        }
        if jobs.is_empty() {
            return Ok(batch);
        }

        let mut records = Vec::with_capacity(jobs.len());
        for (index, spec) in jobs.into_iter().enumerate() {
            records.push(JobRecord::from_spec(
                spec,
                batch_id,
                batch.total_jobs + index as u32,
                batch.batch_type,
                &self.inner.registry,
            )?);
        }

        let added = self
            .inner
            .storage
            .add_jobs_to_batch(batch_id, &records)
            .await?;
        tracing::info!(batch_id = %batch_id, added, "Batch extended");

        let fresh = self
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| BatchQueueError::BatchNotFound {
                batch_id: batch_id.to_string(),
            })?;

        if fresh.batch_type == BatchType::Parallel {
            for record in &records {
                let job = fresh.job(record.id).unwrap_or(record);
                self.inner.dispatcher.enqueue_job(&fresh, job).await?;
            }
        }

        Ok(fresh)
    }

    /// Cancel a batch: compensate completed side effects when warranted, then
    /// tombstone the batch as `failed` with `context.cancelled = true`.
    ///
    /// Rows stay behind for auditing until [`cleanup`](Self::cleanup) removes
    /// them; in-flight deliveries observe the terminal status and reject.
    pub async fn cancel_batch(&self, batch_id: Uuid) -> Result<()> {
        let batch = self
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| BatchQueueError::BatchNotFound {
                batch_id: batch_id.to_string(),
            })?;

        if !batch.context.contains_key(compensation::CTX_COMPENSATION_BATCH_ID) {
            compensation::launch(&self.inner.storage, &self.inner.dispatcher, &batch).await?;
        }

        // Reload to keep any compensation bookkeeping the launch just wrote.
        let fresh = self
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| BatchQueueError::BatchNotFound {
                batch_id: batch_id.to_string(),
            })?;

        let mut context = fresh.context;
        context.insert(CTX_CANCELLED.to_string(), Value::Bool(true));
        self.inner
            .storage
            .update_batch(
                batch_id,
                BatchUpdate::new()
                    .status(BatchStatus::Failed)
                    .context(context)
                    .completed_at(crate::definition::now_second()),
            )
            .await?;

        tracing::info!(batch_id = %batch_id, "Batch cancelled");
        Ok(())
    }

    /// Manually trigger compensation for a batch holding completed
    /// compensation-bearing jobs. Returns the compensation batch id, or
    /// `None` when there is nothing to roll back.
    pub async fn compensate(&self, batch_id: Uuid) -> Result<Option<Uuid>> {
        let batch = self
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| BatchQueueError::BatchNotFound {
                batch_id: batch_id.to_string(),
            })?;

        if let Some(existing) = batch
            .context
            .get(compensation::CTX_COMPENSATION_BATCH_ID)
            .and_then(Value::as_str)
        {
            let existing = Uuid::parse_str(existing)
                .map_err(|e| BatchQueueError::storage(format!("bad compensation id: {e}")))?;
            return Ok(Some(existing));
        }

        compensation::launch(&self.inner.storage, &self.inner.dispatcher, &batch).await
    }

    /// Remove completed and failed batches older than the cut-off
    pub async fn cleanup(&self, older_than_days: i64) -> Result<u64> {
        self.inner.storage.cleanup_old_batches(older_than_days).await
    }

    /// Probe the storage backend
    pub async fn health_check(&self) -> bool {
        self.inner.storage.health_check().await
    }

    /// Spawn the periodic cleanup sweep when `cleanup.enabled` is set.
    ///
    /// The returned handle keeps running until aborted by the host.
    pub fn spawn_cleanup_task(&self) -> Option<tokio::task::JoinHandle<()>> {
        let cleanup = self.inner.config.cleanup.clone();
        if !cleanup.enabled {
            return None;
        }

        let storage = self.inner.storage.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(cleanup.run_interval));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match storage.cleanup_old_batches(cleanup.older_than_days).await {
                    Ok(removed) => {
                        tracing::debug!(removed, "Cleanup sweep finished");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Cleanup sweep failed");
                    }
                }
            }
        }))
    }
}

impl std::fmt::Debug for BatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchManager")
            .field("storage", &self.inner.config.storage)
            .field("registered_classes", &self.inner.registry.len())
            .finish()
    }
}

/// Progress counters of one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Batch identifier
    pub batch_id: Uuid,
    /// Lifecycle status
    pub status: BatchStatus,
    /// Total job rows
    pub total_jobs: u32,
    /// Jobs in `completed` status
    pub completed_jobs: u32,
    /// Jobs in `failed` status
    pub failed_jobs: u32,
    /// Jobs still pending or running
    pub pending_jobs: u32,
    /// Finished share in percent
    pub percentage: f64,
}

impl From<&BatchDefinition> for BatchProgress {
    fn from(batch: &BatchDefinition) -> Self {
        let finished = batch.completed_jobs + batch.failed_jobs;
        let percentage = if batch.total_jobs > 0 {
            (finished as f64 / batch.total_jobs as f64) * 100.0
        } else {
            0.0
        };
        Self {
            batch_id: batch.id,
            status: batch.status,
            total_jobs: batch.total_jobs,
            completed_jobs: batch.completed_jobs,
            failed_jobs: batch.failed_jobs,
            pending_jobs: batch.total_jobs.saturating_sub(finished),
            percentage,
        }
    }
}
