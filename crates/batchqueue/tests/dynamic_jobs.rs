//! End-to-end flows for dynamic job appends into running chains.

mod common;

use async_trait::async_trait;
use batchqueue::prelude::*;
use common::{harness, CallLog};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

fn batch_id_from(args: &JsonMap) -> batchqueue::Result<Uuid> {
    args.get("batch_id")
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .ok_or_else(|| BatchQueueError::InvalidJob("message without batch_id".into()))
}

/// Chain step that records its label, then appends more jobs mid-execution
struct AdderJob {
    manager: BatchManager,
    log: CallLog,
}

#[async_trait]
impl JobHandler for AdderJob {
    async fn execute(&mut self, args: &JsonMap) -> batchqueue::Result<()> {
        self.log.push("adder");

        let batch_id = batch_id_from(args)?;
        let to_add: Vec<JobSpec> = args
            .get("add")
            .and_then(Value::as_array)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|label| JobSpec::new("RecordOrder").arg("label", json!(label)))
                    .collect()
            })
            .unwrap_or_default();

        self.manager.add_jobs(batch_id, to_add).await?;
        Ok(())
    }
}

/// Chain step that records its `label` argument into a shared log
struct RecordOrderJob {
    log: CallLog,
}

#[async_trait]
impl JobHandler for RecordOrderJob {
    async fn execute(&mut self, args: &JsonMap) -> batchqueue::Result<()> {
        let label = args
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or("unlabeled");
        self.log.push(label);
        Ok(())
    }
}

/// Chain step that rewrites the context and appends a receiver job
struct UpdaterJob {
    manager: BatchManager,
    context: JsonMap,
}

#[async_trait]
impl JobHandler for UpdaterJob {
    async fn execute(&mut self, args: &JsonMap) -> batchqueue::Result<()> {
        let batch_id = batch_id_from(args)?;
        self.manager
            .add_jobs(batch_id, vec![JobSpec::from("Receiver")])
            .await?;

        let mut context = JsonMap::new();
        context.insert("step".to_string(), json!(2));
        context.insert("data".to_string(), json!("value"));
        self.context = context;
        Ok(())
    }

    fn set_context(&mut self, context: &JsonMap) {
        self.context = context.clone();
    }

    fn context(&self) -> Option<JsonMap> {
        Some(self.context.clone())
    }
}

/// Chain step that records the context it was handed
struct ReceiverJob {
    seen: Arc<Mutex<Option<JsonMap>>>,
}

#[async_trait]
impl JobHandler for ReceiverJob {
    async fn execute(&mut self, _args: &JsonMap) -> batchqueue::Result<()> {
        Ok(())
    }

    fn set_context(&mut self, context: &JsonMap) {
        *self.seen.lock() = Some(context.clone());
    }
}

#[tokio::test]
async fn chain_extended_mid_execution_runs_in_order() {
    let h = harness().await;
    let log = CallLog::new();

    let manager = h.manager.clone();
    let adder_log = log.clone();
    h.registry.register("Adder", move || {
        Box::new(AdderJob {
            manager: manager.clone(),
            log: adder_log.clone(),
        })
    });
    let record_log = log.clone();
    h.registry.register("RecordOrder", move || {
        Box::new(RecordOrderJob {
            log: record_log.clone(),
        })
    });

    let batch_id = h
        .manager
        .chain(vec![
            JobSpec::new("Adder").arg("add", json!(["j3", "j4"])),
            JobSpec::new("RecordOrder").arg("label", json!("j2")),
        ])
        .dispatch()
        .await
        .unwrap();

    h.drain().await;

    let batch = h.manager.get_batch(batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.total_jobs, 4);
    assert_eq!(batch.completed_jobs, 4);

    let positions: Vec<u32> = batch.jobs.iter().map(|job| job.position).collect();
    assert_eq!(positions, vec![0, 1, 2, 3]);

    // The appended jobs ran after the original tail, in append order.
    assert_eq!(log.entries(), vec!["adder", "j2", "j3", "j4"]);
}

#[tokio::test]
async fn context_mutations_reach_jobs_appended_by_a_running_step() {
    let h = harness().await;
    let seen: Arc<Mutex<Option<JsonMap>>> = Arc::new(Mutex::new(None));

    let manager = h.manager.clone();
    h.registry.register("Updater", move || {
        Box::new(UpdaterJob {
            manager: manager.clone(),
            context: JsonMap::new(),
        })
    });
    let receiver_seen = seen.clone();
    h.registry.register("Receiver", move || {
        Box::new(ReceiverJob {
            seen: receiver_seen.clone(),
        })
    });

    let batch_id = h
        .manager
        .chain(vec![JobSpec::from("Updater")])
        .context_value("step", json!(1))
        .dispatch()
        .await
        .unwrap();

    h.drain().await;

    let mut expected = JsonMap::new();
    expected.insert("step".to_string(), json!(2));
    expected.insert("data".to_string(), json!("value"));

    // The receiver, appended while the updater was running, saw the mutated
    // context.
    assert_eq!(seen.lock().clone(), Some(expected.clone()));

    let batch = h.manager.get_batch(batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.completed_jobs, 2);
    assert_eq!(batch.context, expected);
}

#[tokio::test]
async fn appended_chain_jobs_are_not_enqueued_eagerly() {
    let h = harness().await;
    let log = CallLog::new();
    let record_log = log.clone();
    h.registry.register("RecordOrder", move || {
        Box::new(RecordOrderJob {
            log: record_log.clone(),
        })
    });

    let batch_id = h
        .manager
        .chain(vec![JobSpec::new("RecordOrder").arg("label", json!("j1"))])
        .dispatch()
        .await
        .unwrap();

    // Appending to a chain before it runs queues nothing extra; the advance
    // protocol releases the new position.
    h.manager
        .add_jobs(
            batch_id,
            vec![JobSpec::new("RecordOrder").arg("label", json!("j2"))],
        )
        .await
        .unwrap();
    assert_eq!(
        h.transport.len(batchqueue::config::DEFAULT_SEQUENTIAL_QUEUE),
        1
    );

    h.drain().await;

    let batch = h.manager.get_batch(batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.total_jobs, 2);
    assert_eq!(log.entries(), vec!["j1", "j2"]);
}
