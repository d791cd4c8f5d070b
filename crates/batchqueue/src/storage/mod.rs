//! Durable batch state: the storage contract and its two backends.

pub mod redis;
pub mod sql;

use crate::definition::{
    BatchDefinition, BatchStatus, BatchType, JobFailure, JobRecord, JobStatus, JsonMap,
};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Field set for a partial batch update
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchUpdate {
    /// New lifecycle status
    pub status: Option<BatchStatus>,
    /// Replacement context map
    pub context: Option<JsonMap>,
    /// New job count after dynamic appends
    pub total_jobs: Option<u32>,
    /// Replacement resolved queue
    pub queue_config: Option<String>,
    /// Terminal timestamp
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchUpdate {
    /// Start an empty update
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the status field
    pub fn status(mut self, status: BatchStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the context field
    pub fn context(mut self, context: JsonMap) -> Self {
        self.context = Some(context);
        self
    }

    /// Set the total_jobs field
    pub fn total_jobs(mut self, total_jobs: u32) -> Self {
        self.total_jobs = Some(total_jobs);
        self
    }

    /// Set the queue_config field
    pub fn queue_config(mut self, queue_config: impl Into<String>) -> Self {
        self.queue_config = Some(queue_config.into());
        self
    }

    /// Set the completed_at field
    pub fn completed_at(mut self, completed_at: DateTime<Utc>) -> Self {
        self.completed_at = Some(completed_at);
        self
    }

    /// Check if the update carries no fields
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Filters for batch listing and counting
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchFilter {
    /// Only batches in this status
    pub status: Option<BatchStatus>,
    /// Only batches of this type
    pub batch_type: Option<BatchType>,
    /// Only batches whose `options.name` matches
    pub name: Option<String>,
    /// Only batches with (or without) compensation-bearing jobs
    pub has_compensation: Option<bool>,
}

impl BatchFilter {
    /// Check whether a loaded batch passes the filter
    pub fn matches(&self, batch: &BatchDefinition) -> bool {
        if let Some(status) = self.status {
            if batch.status != status {
                return false;
            }
        }
        if let Some(batch_type) = self.batch_type {
            if batch.batch_type != batch_type {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if batch.options.name.as_deref() != Some(name.as_str()) {
                return false;
            }
        }
        if let Some(has_compensation) = self.has_compensation {
            if batch.has_compensation() != has_compensation {
                return false;
            }
        }
        true
    }
}

/// Filter for job listing within a batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    /// Only jobs in this status
    pub status: Option<JobStatus>,
}

/// Storage contract both backends implement.
///
/// Counter updates recount from authoritative row state so that queue
/// redeliveries never double-count; status transitions are idempotent.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist a batch with its full initial job set, atomically
    async fn create_batch(&self, batch: &BatchDefinition) -> Result<Uuid>;

    /// Apply a partial update; errors with `BatchNotFound` on unknown ids
    async fn update_batch(&self, batch_id: Uuid, update: BatchUpdate) -> Result<()>;

    /// Load a batch with its jobs, `None` when unknown
    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<BatchDefinition>>;

    /// Append job rows to a non-terminal batch, returning the added count.
    ///
    /// The terminal check runs inside the same transaction as the insert.
    async fn add_jobs_to_batch(&self, batch_id: Uuid, jobs: &[JobRecord]) -> Result<u32>;

    /// Load one job row by position
    async fn get_job_by_position(&self, batch_id: Uuid, position: u32)
        -> Result<Option<JobRecord>>;

    /// Load one job row by its queue message id
    async fn get_job_by_id(&self, batch_id: Uuid, job_id: &str) -> Result<Option<JobRecord>>;

    /// Stamp the queue message id on the row at `position`
    async fn update_job_id(&self, batch_id: Uuid, position: u32, job_id: &str) -> Result<()>;

    /// Transition a job row, persisting result and error alongside
    async fn update_job_status(
        &self,
        batch_id: Uuid,
        job_id: &str,
        status: JobStatus,
        result: Option<Value>,
        error: Option<JobFailure>,
    ) -> Result<()>;

    /// Recount completed jobs from row state, returning the new counter
    async fn increment_completed_jobs(&self, batch_id: Uuid) -> Result<u32>;

    /// Recount failed jobs from row state, returning the new counter
    async fn increment_failed_jobs(&self, batch_id: Uuid) -> Result<u32>;

    /// Results reported by the batch's jobs, keyed by queue message id
    async fn get_batch_results(&self, batch_id: Uuid) -> Result<HashMap<String, Value>>;

    /// Job rows of a batch in position order, optionally filtered
    async fn get_all_jobs(&self, batch_id: Uuid, filter: &JobFilter) -> Result<Vec<JobRecord>>;

    /// Batches matching a filter, newest first
    async fn get_batches(
        &self,
        filter: &BatchFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<BatchDefinition>>;

    /// Count of batches matching a filter
    async fn count_batches(&self, filter: &BatchFilter) -> Result<u64>;

    /// Remove a batch and its jobs; `false` when the batch was unknown
    async fn delete_batch(&self, batch_id: Uuid) -> Result<bool>;

    /// Remove terminal batches older than the cut-off, returning the count
    async fn cleanup_old_batches(&self, older_than_days: i64) -> Result<u64>;

    /// Probe backend availability
    async fn health_check(&self) -> bool;
}
