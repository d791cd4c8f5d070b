//! End-to-end flows for sequential chains.

mod common;

use async_trait::async_trait;
use batchqueue::config::DEFAULT_SEQUENTIAL_QUEUE;
use batchqueue::prelude::*;
use common::harness;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// `on_complete` callback that sums all job results into
/// `context.accumulated_sum` on the finished chain.
struct SumResults {
    storage: Arc<SqlStorage>,
}

#[async_trait]
impl JobHandler for SumResults {
    async fn execute(&mut self, args: &JsonMap) -> batchqueue::Result<()> {
        let batch_id = args
            .get("batch_id")
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| BatchQueueError::InvalidJob("callback without batch_id".into()))?;

        let results = self.storage.get_batch_results(batch_id).await?;
        let sum: i64 = results.values().filter_map(Value::as_i64).sum();

        let Some(batch) = self.storage.get_batch(batch_id).await? else {
            return Ok(());
        };
        let mut context = batch.context;
        context.insert("accumulated_sum".to_string(), json!(sum));
        self.storage
            .update_batch(batch_id, BatchUpdate::new().context(context))
            .await
    }
}

#[tokio::test]
async fn chain_of_three_accumulates_context_and_results() {
    let h = harness().await;
    let storage = h.storage.clone();
    h.registry.register("AccumCB", move || {
        Box::new(SumResults {
            storage: storage.clone(),
        })
    });

    let batch_id = h
        .manager
        .chain(vec![
            JobSpec::new("AccumStep").arg("v", json!(1)),
            JobSpec::new("AccumStep").arg("v", json!(2)),
            JobSpec::new("AccumStep").arg("v", json!(3)),
        ])
        .on_complete(CallbackSpec::new("AccumCB"))
        .dispatch()
        .await
        .unwrap();

    // Strict serial release: only the first step is ever queued up front.
    assert_eq!(h.transport.len(DEFAULT_SEQUENTIAL_QUEUE), 1);

    h.drain().await;

    let batch = h.manager.get_batch(batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.completed_jobs, 3);
    assert_eq!(batch.context.get("accumulated_sum"), Some(&json!(6)));
    assert_eq!(
        batch.context.get("results"),
        Some(&json!([1, 2, 3]))
    );
}

#[tokio::test]
async fn single_job_chain_completes_without_next_enqueue() {
    let h = harness().await;

    let batch_id = h
        .manager
        .chain(vec![JobSpec::new("AccumStep").arg("v", json!(7))])
        .dispatch()
        .await
        .unwrap();

    h.drain().await;

    let batch = h.manager.get_batch(batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.completed_jobs, 1);
    assert!(h.transport.is_empty(DEFAULT_SEQUENTIAL_QUEUE));
}

#[tokio::test]
async fn redelivered_step_does_not_double_advance() {
    let h = harness().await;

    h.manager
        .chain(vec![
            JobSpec::new("AccumStep").arg("v", json!(1)),
            JobSpec::new("AccumStep").arg("v", json!(2)),
        ])
        .dispatch()
        .await
        .unwrap();

    let processor = h.manager.chain_processor();
    let delivery = h.transport.receive(DEFAULT_SEQUENTIAL_QUEUE).unwrap();

    assert_eq!(processor.process(&delivery).await, DeliveryResponse::Ack);
    // Redelivery of the committed step: the successor is already queued and
    // must not be enqueued a second time.
    assert_eq!(processor.process(&delivery).await, DeliveryResponse::Ack);
    h.transport
        .settle(DEFAULT_SEQUENTIAL_QUEUE, &delivery, DeliveryResponse::Ack);

    assert_eq!(h.transport.len(DEFAULT_SEQUENTIAL_QUEUE), 1);
}

#[tokio::test]
async fn chain_failure_stops_the_advance() {
    let h = harness().await;

    let batch_id = h
        .manager
        .chain(vec![
            JobSpec::new("AccumStep").arg("v", json!(1)),
            JobSpec::from("Fail"),
            JobSpec::new("AccumStep").arg("v", json!(3)),
        ])
        .dispatch()
        .await
        .unwrap();

    h.drain().await;

    let batch = h.manager.get_batch(batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.completed_jobs, 1);
    assert_eq!(batch.failed_jobs, 1);

    // Every position above the failed one is still pending.
    let last = batch.job_at_position(2).unwrap();
    assert_eq!(last.status, JobStatus::Pending);
    assert!(h.transport.is_empty(DEFAULT_SEQUENTIAL_QUEUE));
}

#[tokio::test]
async fn cancelled_chain_rejects_in_flight_messages() {
    let h = harness().await;

    let batch_id = h
        .manager
        .chain(vec![
            JobSpec::new("AccumStep").arg("v", json!(1)),
            JobSpec::new("AccumStep").arg("v", json!(2)),
        ])
        .dispatch()
        .await
        .unwrap();

    h.manager.cancel_batch(batch_id).await.unwrap();

    let batch = h.manager.get_batch(batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.context.get("cancelled"), Some(&json!(true)));

    // The already queued first step is rejected, nothing runs.
    h.drain().await;
    let batch = h.manager.get_batch(batch_id).await.unwrap().unwrap();
    assert_eq!(batch.completed_jobs, 0);
    assert!(batch
        .jobs
        .iter()
        .all(|job| job.status == JobStatus::Pending));

    // Cancelled batches are swept once they age past the cut-off.
    h.storage
        .update_batch(
            batch_id,
            BatchUpdate::new().completed_at(chrono::Utc::now() - chrono::Duration::days(2)),
        )
        .await
        .unwrap();
    assert_eq!(h.manager.cleanup(1).await.unwrap(), 1);
    assert!(h.manager.get_batch(batch_id).await.unwrap().is_none());
}

#[tokio::test]
async fn chain_jobs_can_carry_batch_options() {
    let h = harness().await;

    let batch_id = h
        .manager
        .chain(vec![JobSpec::new("AccumStep").arg("v", json!(1))])
        .name("nightly-sync")
        .timeout(120)
        .dispatch()
        .await
        .unwrap();

    let batch = h.manager.get_batch(batch_id).await.unwrap().unwrap();
    assert_eq!(batch.options.name.as_deref(), Some("nightly-sync"));
    assert_eq!(batch.options.timeout, Some(120));

    let by_name = BatchFilter {
        name: Some("nightly-sync".to_string()),
        ..BatchFilter::default()
    };
    assert_eq!(h.manager.count_batches(&by_name).await.unwrap(), 1);
}
