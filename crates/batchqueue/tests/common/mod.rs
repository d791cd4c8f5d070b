//! Shared harness and job handlers for the end-to-end tests.

#![allow(dead_code)]

use async_trait::async_trait;
use batchqueue::config::{DEFAULT_PARALLEL_QUEUE, DEFAULT_SEQUENTIAL_QUEUE};
use batchqueue::prelude::*;
use batchqueue::worker::drain_all;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

/// Everything a scenario needs: manager, backends and a worker pair
pub struct Harness {
    pub manager: BatchManager,
    pub storage: Arc<SqlStorage>,
    pub transport: Arc<InMemoryTransport>,
    pub registry: JobRegistry,
}

pub async fn harness() -> Harness {
    harness_with(BatchQueueConfig::default()).await
}

pub async fn harness_with(config: BatchQueueConfig) -> Harness {
    let storage = Arc::new(SqlStorage::in_memory().await.unwrap());
    let transport = Arc::new(InMemoryTransport::new());
    let registry = JobRegistry::new();
    register_base_jobs(&registry);

    let manager = BatchManager::new(
        storage.clone(),
        transport.clone(),
        registry.clone(),
        config,
    );

    Harness {
        manager,
        storage,
        transport,
        registry,
    }
}

impl Harness {
    /// One worker per default queue, parallel and sequential
    pub fn workers(&self) -> Vec<Worker> {
        vec![
            Worker::new(
                self.transport.clone(),
                DEFAULT_PARALLEL_QUEUE,
                Processor::Parallel(self.manager.parallel_processor()),
            ),
            Worker::new(
                self.transport.clone(),
                DEFAULT_SEQUENTIAL_QUEUE,
                Processor::Chain(self.manager.chain_processor()),
            ),
        ]
    }

    /// Drain both default queues until everything is idle
    pub async fn drain(&self) -> u64 {
        drain_all(&self.workers()).await
    }
}

fn register_base_jobs(registry: &JobRegistry) {
    registry.register("ReportValue", || Box::new(ReportValue::default()));
    registry.register("AccumStep", || Box::new(AccumStep::default()));
    registry.register("Fail", || Box::new(FailJob));
    registry.register("Op", || Box::new(OpJob::default()));
    registry.register("Undo", || Box::new(UndoJob::default()));
    registry.register("UndoFail", || Box::new(UndoFailJob));
}

/// Reports `{"value": <args.value>}` as its result
#[derive(Debug, Default)]
pub struct ReportValue {
    value: Option<Value>,
}

#[async_trait]
impl JobHandler for ReportValue {
    async fn execute(&mut self, args: &JsonMap) -> batchqueue::Result<()> {
        self.value = Some(args.get("value").cloned().unwrap_or(json!(1)));
        Ok(())
    }

    fn result(&self) -> Option<Value> {
        self.value.as_ref().map(|value| json!({ "value": value }))
    }
}

/// Chain step that appends `args.v` to `context.results` and reports it
#[derive(Debug, Default)]
pub struct AccumStep {
    context: JsonMap,
    value: Option<Value>,
}

#[async_trait]
impl JobHandler for AccumStep {
    async fn execute(&mut self, args: &JsonMap) -> batchqueue::Result<()> {
        let value = args.get("v").cloned().unwrap_or(Value::Null);
        let results = self
            .context
            .entry("results".to_string())
            .or_insert_with(|| json!([]));
        if let Some(items) = results.as_array_mut() {
            items.push(value.clone());
        }
        self.value = Some(value);
        Ok(())
    }

    fn set_context(&mut self, context: &JsonMap) {
        self.context = context.clone();
    }

    fn context(&self) -> Option<JsonMap> {
        Some(self.context.clone())
    }

    fn result(&self) -> Option<Value> {
        self.value.clone()
    }
}

/// Always fails
#[derive(Debug)]
pub struct FailJob;

#[async_trait]
impl JobHandler for FailJob {
    async fn execute(&mut self, _args: &JsonMap) -> batchqueue::Result<()> {
        Err(BatchQueueError::execution("boom"))
    }
}

/// Side-effecting step; reports `{"action": <args.action>}` for compensation
#[derive(Debug, Default)]
pub struct OpJob {
    action: Option<Value>,
}

#[async_trait]
impl JobHandler for OpJob {
    async fn execute(&mut self, args: &JsonMap) -> batchqueue::Result<()> {
        self.action = args.get("action").cloned();
        Ok(())
    }

    fn result(&self) -> Option<Value> {
        self.action
            .as_ref()
            .map(|action| json!({ "action": action }))
    }
}

/// Rollback partner: appends `{"action": <args.action>}` to `context.compensations`
#[derive(Debug, Default)]
pub struct UndoJob {
    context: JsonMap,
}

#[async_trait]
impl JobHandler for UndoJob {
    async fn execute(&mut self, args: &JsonMap) -> batchqueue::Result<()> {
        let action = args.get("action").cloned().unwrap_or(Value::Null);
        let log = self
            .context
            .entry("compensations".to_string())
            .or_insert_with(|| json!([]));
        if let Some(items) = log.as_array_mut() {
            items.push(json!({ "action": action }));
        }
        Ok(())
    }

    fn set_context(&mut self, context: &JsonMap) {
        self.context = context.clone();
    }

    fn context(&self) -> Option<JsonMap> {
        Some(self.context.clone())
    }
}

/// Rollback partner that itself fails
#[derive(Debug)]
pub struct UndoFailJob;

#[async_trait]
impl JobHandler for UndoFailJob {
    async fn execute(&mut self, _args: &JsonMap) -> batchqueue::Result<()> {
        Err(BatchQueueError::execution("rollback impossible"))
    }
}

/// Shared counter for callback-observed events
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Register a callback class that only records its invocation
pub fn register_logging_callback(registry: &JobRegistry, class: &str, log: CallLog) {
    let class_name = class.to_string();
    registry.register(class, move || {
        Box::new(LoggingCallback {
            class: class_name.clone(),
            log: log.clone(),
        })
    });
}

#[derive(Debug)]
struct LoggingCallback {
    class: String,
    log: CallLog,
}

#[async_trait]
impl JobHandler for LoggingCallback {
    async fn execute(&mut self, args: &JsonMap) -> batchqueue::Result<()> {
        let status = args
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        self.log.push(format!("{}:{}", self.class, status));
        Ok(())
    }
}
