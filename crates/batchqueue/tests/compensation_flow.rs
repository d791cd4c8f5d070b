//! End-to-end flows for Saga compensation on failed chains.

mod common;

use batchqueue::prelude::*;
use batchqueue::processor::compensation::{
    CTX_COMPENSATION_BATCH_ID, CTX_COMPENSATION_ERROR, CTX_COMPENSATION_STATUS,
};
use common::harness;
use serde_json::{json, Value};
use uuid::Uuid;

fn compensation_id(batch: &BatchDefinition) -> Uuid {
    batch
        .context
        .get(CTX_COMPENSATION_BATCH_ID)
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .expect("compensation batch id in context")
}

#[tokio::test]
async fn failed_chain_compensates_completed_job() {
    let h = harness().await;

    let batch_id = h
        .manager
        .chain(vec![
            JobSpec::new("Op")
                .arg("action", json!("create_order"))
                .with_compensation("Undo"),
            JobSpec::from("Fail"),
        ])
        .dispatch()
        .await
        .unwrap();

    h.drain().await;

    let original = h.manager.get_batch(batch_id).await.unwrap().unwrap();
    assert_eq!(original.status, BatchStatus::Failed);
    assert_eq!(original.completed_jobs, 1);
    assert_eq!(original.failed_jobs, 1);

    let comp_id = compensation_id(&original);
    let comp = h.manager.get_batch(comp_id).await.unwrap().unwrap();
    assert_eq!(comp.status, BatchStatus::Completed);
    assert_eq!(comp.total_jobs, 1);
    assert_eq!(
        comp.context.get("compensations"),
        Some(&json!([{"action": "create_order"}]))
    );

    // The completion callback reported back onto the original context.
    assert_eq!(
        original.context.get(CTX_COMPENSATION_STATUS),
        Some(&json!("completed"))
    );
    assert_eq!(
        original.context.get("compensations"),
        Some(&json!([{"action": "create_order"}]))
    );
}

#[tokio::test]
async fn multi_step_compensation_runs_in_reverse_order() {
    let h = harness().await;

    let batch_id = h
        .manager
        .chain(vec![
            JobSpec::new("Op").arg("action", json!("A")).with_compensation("Undo"),
            JobSpec::new("Op").arg("action", json!("B")).with_compensation("Undo"),
            JobSpec::new("Op").arg("action", json!("C")).with_compensation("Undo"),
            JobSpec::from("Fail"),
        ])
        .dispatch()
        .await
        .unwrap();

    h.drain().await;

    let original = h.manager.get_batch(batch_id).await.unwrap().unwrap();
    assert_eq!(original.status, BatchStatus::Failed);
    assert_eq!(original.completed_jobs, 3);

    let comp = h
        .manager
        .get_batch(compensation_id(&original))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(comp.status, BatchStatus::Completed);
    assert_eq!(comp.total_jobs, 3);

    // Rollback happened in reverse position order; the failing job itself has
    // no entry.
    assert_eq!(
        original.context.get("compensations"),
        Some(&json!([
            {"action": "C"},
            {"action": "B"},
            {"action": "A"},
        ]))
    );
}

#[tokio::test]
async fn compensation_failure_is_reported_on_the_original() {
    let h = harness().await;

    let batch_id = h
        .manager
        .chain(vec![
            JobSpec::new("Op")
                .arg("action", json!("charge_card"))
                .with_compensation("UndoFail"),
            JobSpec::from("Fail"),
        ])
        .dispatch()
        .await
        .unwrap();

    h.drain().await;

    let original = h.manager.get_batch(batch_id).await.unwrap().unwrap();
    let comp = h
        .manager
        .get_batch(compensation_id(&original))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(comp.status, BatchStatus::Failed);

    assert_eq!(
        original.context.get(CTX_COMPENSATION_STATUS),
        Some(&json!("failed"))
    );
    assert_eq!(
        original.context.get(CTX_COMPENSATION_ERROR),
        Some(&json!("job execution failed: rollback impossible"))
    );
}

#[tokio::test]
async fn manual_compensation_of_a_completed_chain() {
    let h = harness().await;

    let batch_id = h
        .manager
        .chain(vec![JobSpec::new("Op")
            .arg("action", json!("provision"))
            .with_compensation("Undo")])
        .dispatch()
        .await
        .unwrap();
    h.drain().await;

    let batch = h.manager.get_batch(batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);

    let comp_id = h.manager.compensate(batch_id).await.unwrap().unwrap();
    // A second trigger returns the chain already launched.
    assert_eq!(h.manager.compensate(batch_id).await.unwrap(), Some(comp_id));

    h.drain().await;

    let comp = h.manager.get_batch(comp_id).await.unwrap().unwrap();
    assert_eq!(comp.status, BatchStatus::Completed);

    let original = h.manager.get_batch(batch_id).await.unwrap().unwrap();
    assert_eq!(
        original.context.get("compensations"),
        Some(&json!([{"action": "provision"}]))
    );
}

#[tokio::test]
async fn chain_without_compensation_fails_without_rollback() {
    let h = harness().await;

    let batch_id = h
        .manager
        .chain(vec![
            JobSpec::new("Op").arg("action", json!("noop")),
            JobSpec::from("Fail"),
        ])
        .dispatch()
        .await
        .unwrap();

    h.drain().await;

    let original = h.manager.get_batch(batch_id).await.unwrap().unwrap();
    assert_eq!(original.status, BatchStatus::Failed);
    assert!(!original.context.contains_key(CTX_COMPENSATION_BATCH_ID));
    assert_eq!(h.manager.compensate(batch_id).await.unwrap(), None);
}
