//! Orchestration of batched background jobs over queue-backed worker fleets.
//!
//! A client submits either a **parallel batch** (independent jobs executed
//! concurrently) or a **sequential chain** (jobs executed in position order,
//! each seeing the context accumulated by its predecessors). The
//! orchestrator tracks every job's lifecycle in a durable store (SQL or
//! Redis), supports appending jobs to a running batch, drives Saga-style
//! compensation when a chain fails, and fires user-supplied completion and
//! failure callback jobs.
//!
//! # Example
//!
//! ```rust,no_run
//! use batchqueue::prelude::*;
//! use std::sync::Arc;
//!
//! # #[derive(Debug, Default)]
//! # struct ResizeImage;
//! # #[async_trait::async_trait]
//! # impl JobHandler for ResizeImage {
//! #     async fn execute(&mut self, _args: &JsonMap) -> batchqueue::Result<()> { Ok(()) }
//! # }
//! # async fn example() -> batchqueue::Result<()> {
//! let registry = JobRegistry::new();
//! registry.register("ResizeImage", || Box::new(ResizeImage));
//!
//! let storage = Arc::new(SqlStorage::connect("sqlite://batches.db").await?);
//! let transport = Arc::new(InMemoryTransport::new());
//! let manager = BatchManager::new(storage, transport, registry, BatchQueueConfig::default());
//!
//! let batch_id = manager
//!     .batch(vec![JobSpec::from("ResizeImage"); 3])
//!     .context_value("quality", serde_json::json!(80))
//!     .dispatch()
//!     .await?;
//!
//! let progress = manager.get_progress(batch_id).await?;
//! println!("{} of {} done", progress.completed_jobs, progress.total_jobs);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod builder;
pub mod config;
pub mod definition;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod manager;
pub mod processor;
pub mod queue;
pub mod routing;
pub mod storage;
pub mod worker;

pub use error::{BatchQueueError, Result};

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports of commonly used types

    pub use crate::builder::BatchBuilder;
    pub use crate::config::{
        BatchQueueConfig, DefaultsConfig, ProcessorKind, RedisConfig, StorageKind,
    };
    pub use crate::definition::{
        BatchDefinition, BatchOptions, BatchStatus, BatchType, CallbackSpec, JobFailure,
        JobPayload, JobRecord, JobSpec, JobStatus, JsonMap,
    };
    pub use crate::dispatcher::Dispatcher;
    pub use crate::envelope::Envelope;
    pub use crate::error::{BatchQueueError, Result};
    pub use crate::handler::{JobHandler, JobRegistry};
    pub use crate::manager::{BatchManager, BatchProgress};
    pub use crate::processor::{ChainProcessor, ParallelProcessor, Processor};
    pub use crate::queue::{
        memory::InMemoryTransport, Delivery, DeliveryResponse, PushOptions, QueueTransport,
    };
    pub use crate::routing::QueueRouter;
    pub use crate::storage::{
        redis::RedisStorage, sql::SqlStorage, BatchFilter, BatchUpdate, JobFilter, Storage,
    };
    pub use crate::worker::Worker;
}

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
