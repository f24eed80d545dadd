//! Integration tests for reconciliation batches.
//!
//! These tests drive the engine against an in-process grid and store and
//! check per-record isolation, idempotence and the duration policy.

mod common;

use common::*;
use rulewatch_sync::{
    DataId, ReconciliationEngine, RecordStore, RuleRecord, RuleState, RuleStatus, RuleSubmitter,
    Selection, SkipReason, SyncError, UnitOutcome, UploadOutcome,
};
use serde_json::json;
use std::sync::Arc;
use tracing::Span;

fn engine(grid: &Arc<MockGrid>, store: &Arc<FlakyStore>) -> ReconciliationEngine {
    ReconciliationEngine::new(grid.clone(), store.clone(), INDEX, Span::none())
}

fn pending() -> Selection {
    Selection::for_task(TASK)
}

fn replicating(id: &str) -> RuleStatus {
    rule_status(id, RuleState::Replicating, "2024-03-14T09:05:00")
}

fn snapshot(store: &FlakyStore, id: &str) -> String {
    let docs = store.inner.documents(INDEX);
    let doc = docs
        .iter()
        .find(|(doc_id, _)| doc_id == id)
        .map(|(_, doc)| doc.clone())
        .unwrap();
    serde_json::to_string(&doc).unwrap()
}

#[tokio::test]
async fn test_batch_with_missing_rules_updates_the_rest() {
    let (grid, store) = grid_and_store();
    for i in 0..10 {
        seed_record(store.as_ref(), &replicating(&format!("r{i}"))).await;
        if i >= 3 {
            grid.set_rule(rule_status(&format!("r{i}"), RuleState::Ok, "2024-03-14T09:10:00"))
                .await;
        }
    }
    let before: Vec<String> = (0..3).map(|i| snapshot(&store, &format!("r{i}"))).collect();

    let summary = engine(&grid, &store)
        .reconcile(&pending().to_filter(), 100, 4)
        .await
        .unwrap();

    assert_eq!(summary.selected, 10);
    assert_eq!(summary.updated, 7);
    assert_eq!(summary.skipped, 3);
    for i in 0..3 {
        assert_eq!(snapshot(&store, &format!("r{i}")), before[i]);
    }
    for i in 3..10 {
        let record = stored(store.as_ref(), &format!("r{i}")).await;
        assert_eq!(record.state, Some(RuleState::Ok));
        assert_eq!(record.flags.is_done, 1);
        assert_eq!(record.replication_duration_seconds, Some(300.0));
    }
}

#[tokio::test]
async fn test_done_records_drop_out_of_default_selection() {
    let (grid, store) = grid_and_store();
    seed_record(store.as_ref(), &replicating("r1")).await;
    grid.set_rule(rule_status("r1", RuleState::Ok, "2024-03-14T09:06:00")).await;

    let engine = engine(&grid, &store);
    engine.reconcile(&pending().to_filter(), 100, 2).await.unwrap();
    let second = engine.reconcile(&pending().to_filter(), 100, 2).await.unwrap();
    assert_eq!(second.selected, 0);
    assert_eq!(grid.status_calls(), 1);

    let refresh = engine
        .reconcile(&pending().refresh_all(true).to_filter(), 100, 2)
        .await
        .unwrap();
    assert_eq!(refresh.selected, 1);
}

#[tokio::test]
async fn test_second_reconciliation_is_byte_identical() {
    let (grid, store) = grid_and_store();
    let dataset = DataId::new("test", "r1.dat");
    seed_record(store.as_ref(), &replicating("r1")).await;
    seed_record(store.as_ref(), &replicating("r2")).await;
    grid.set_rule(rule_status("r1", RuleState::Ok, "2024-03-14T09:07:00")).await;
    let mut stuck = rule_status("r2", RuleState::Stuck, "2024-03-14T09:07:00");
    stuck.error = Some("NO_SOURCES".to_string());
    grid.set_rule(stuck).await;
    grid.set_job(dataset, "job-1").await;

    let fts = MockFts::default().with_job("job-1", vec![12.5, 7.5]);
    let engine = engine(&grid, &store).with_throughput_source(Arc::new(fts));
    let everything = pending().refresh_all(true).to_filter();

    engine.reconcile(&everything, 100, 2).await.unwrap();
    let first = (snapshot(&store, "r1"), snapshot(&store, "r2"));
    engine.reconcile(&everything, 100, 2).await.unwrap();
    let second = (snapshot(&store, "r1"), snapshot(&store, "r2"));

    assert_eq!(first, second);
    let r1 = stored(store.as_ref(), "r1").await;
    assert_eq!(r1.replication_duration_seconds, Some(120.0));
    assert_eq!(r1.throughput_mean, Some(10.0));
}

#[tokio::test]
async fn test_duration_only_on_replicating_to_ok() {
    let (grid, store) = grid_and_store();
    seed_record(store.as_ref(), &replicating("r1")).await;
    let engine = engine(&grid, &store);
    let everything = pending().refresh_all(true).to_filter();

    grid.set_rule(rule_status("r1", RuleState::Stuck, "2024-03-14T09:06:00")).await;
    engine.reconcile(&everything, 100, 1).await.unwrap();
    assert!(stored(store.as_ref(), "r1").await.replication_duration_seconds.is_none());

    // STUCK -> OK skips the duration: the persisted state is not REPLICATING
    grid.set_rule(rule_status("r1", RuleState::Ok, "2024-03-14T09:08:00")).await;
    engine.reconcile(&everything, 100, 1).await.unwrap();
    let record = stored(store.as_ref(), "r1").await;
    assert_eq!(record.state, Some(RuleState::Ok));
    assert!(record.replication_duration_seconds.is_none());
}

#[tokio::test]
async fn test_selection_failure_aborts_before_updates() {
    let (grid, store) = grid_and_store();
    seed_record(store.as_ref(), &replicating("r1")).await;
    grid.set_rule(rule_status("r1", RuleState::Ok, "2024-03-14T09:06:00")).await;
    store.fail_searches().await;

    let err = engine(&grid, &store)
        .reconcile(&pending().to_filter(), 100, 2)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Selection(_)));
    assert_eq!(grid.status_calls(), 0);
    let record = stored(store.as_ref(), "r1").await;
    assert_eq!(record.state, Some(RuleState::Replicating));
}

#[tokio::test]
async fn test_failed_upsert_leaves_record_stale() {
    let (grid, store) = grid_and_store();
    for id in ["r1", "r2"] {
        seed_record(store.as_ref(), &replicating(id)).await;
        grid.set_rule(rule_status(id, RuleState::Ok, "2024-03-14T09:06:00")).await;
    }
    store.fail_upserts_for("r1").await;
    let before = snapshot(&store, "r1");

    let summary = engine(&grid, &store)
        .reconcile(&pending().to_filter(), 100, 2)
        .await
        .unwrap();
    assert_eq!((summary.updated, summary.skipped), (1, 1));
    assert_eq!(snapshot(&store, "r1"), before);
    assert_eq!(stored(store.as_ref(), "r2").await.flags.is_done, 1);
}

#[tokio::test]
async fn test_panicking_unit_does_not_affect_siblings() {
    let (grid, store) = grid_and_store();
    for id in ["r1", "r2", "r3"] {
        seed_record(store.as_ref(), &replicating(id)).await;
        grid.set_rule(rule_status(id, RuleState::Stuck, "2024-03-14T09:06:00")).await;
    }
    grid.panic_on("r2").await;

    let summary = engine(&grid, &store)
        .reconcile(&pending().to_filter(), 100, 3)
        .await
        .unwrap();
    assert_eq!(summary.updated, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(stored(store.as_ref(), "r1").await.flags.is_stuck, 1);
    assert_eq!(stored(store.as_ref(), "r2").await.flags.is_replicating, 1);
    assert_eq!(stored(store.as_ref(), "r3").await.flags.is_stuck, 1);
}

#[tokio::test]
async fn test_max_rows_caps_the_batch() {
    let (grid, store) = grid_and_store();
    for i in 0..6 {
        let status = replicating(&format!("r{i}"));
        seed_record(store.as_ref(), &status).await;
        grid.set_rule(status).await;
    }
    let summary = engine(&grid, &store)
        .reconcile(&pending().to_filter(), 4, 8)
        .await
        .unwrap();
    assert_eq!(summary.selected, 4);
    assert_eq!(grid.status_calls(), 4);
}

#[tokio::test]
async fn test_submitted_records_reconcile_to_done() {
    let (grid, store) = grid_and_store();
    let did = DataId::new("test", "r1.dat");
    grid.set_rule(rule_status("r1", RuleState::Replicating, "2024-03-14T09:05:00")).await;

    let submitter = RuleSubmitter::new(grid.clone(), store.clone(), INDEX, Span::none());
    let ids = submitter.push_rules_for_did(&did, task_tags()).await.unwrap();
    assert_eq!(ids, vec!["r1".to_string()]);

    grid.set_rule(rule_status("r1", RuleState::Ok, "2024-03-14T09:05:45")).await;
    engine(&grid, &store)
        .reconcile(&pending().to_filter(), 100, 2)
        .await
        .unwrap();

    let doc = store.get(INDEX, "r1").await.unwrap();
    assert_eq!(doc["is_submitted"], json!(1));
    assert_eq!(doc["is_done"], json!(1));
    assert_eq!(doc["replication_duration"], json!(45.0));
    assert_eq!(doc["task_name"], json!(TASK));
    assert_eq!(doc["protocol"], json!("davs"));
}

#[tokio::test]
async fn test_synthesized_record_stays_pending() {
    let (grid, store) = grid_and_store();
    let submitter = RuleSubmitter::new(grid.clone(), store.clone(), INDEX, Span::none());
    let ids = submitter
        .push_rules_for_did(&DataId::new("test", "orphan.dat"), task_tags())
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);

    let record = stored(store.as_ref(), &ids[0]).await;
    assert_eq!(record.flags.active_count(), 0);
    assert_eq!(record.tags, task_tags());

    let summary = engine(&grid, &store)
        .reconcile(&pending().to_filter(), 100, 2)
        .await
        .unwrap();
    assert_eq!((summary.selected, summary.skipped), (1, 1));
}

#[tokio::test]
async fn test_upload_records_are_not_selected() {
    let (grid, store) = grid_and_store();
    let submitter = RuleSubmitter::new(grid.clone(), store.clone(), INDEX, Span::none());
    let did = DataId::new("test", "upload.dat");
    let outcomes = [
        UploadOutcome::Failed {
            error: "ServiceUnavailable".to_string(),
        },
        UploadOutcome::Succeeded {
            duration_secs: Some(3.0),
        },
    ];
    for outcome in outcomes {
        submitter
            .record_upload(&did, "SITE_A", outcome, task_tags())
            .await
            .unwrap();
    }

    let engine = engine(&grid, &store);
    let summary = engine.reconcile(&pending().to_filter(), 100, 2).await.unwrap();
    assert_eq!(summary.selected, 0);
    assert_eq!(grid.status_calls(), 0);

    let refresh = engine
        .reconcile(&pending().refresh_all(true).to_filter(), 100, 2)
        .await
        .unwrap();
    assert_eq!(refresh.selected, 2);
}

#[tokio::test]
async fn test_duration_survives_failed_persisted_read() {
    let (grid, store) = grid_and_store();
    seed_record(store.as_ref(), &replicating("r1")).await;
    grid.set_rule(rule_status("r1", RuleState::Ok, "2024-03-14T09:06:00")).await;
    store.fail_gets_for("r1").await;

    let summary = engine(&grid, &store)
        .reconcile(&pending().to_filter(), 100, 1)
        .await
        .unwrap();
    assert_eq!(summary.updated, 1);

    let record = RuleRecord::from_document(store.inner.get(INDEX, "r1").await.unwrap()).unwrap();
    assert_eq!(record.state, Some(RuleState::Ok));
    assert_eq!(record.replication_duration_seconds, Some(60.0));
}

#[tokio::test]
async fn test_unreadable_record_is_skipped_as_store_failure() {
    let (grid, store) = grid_and_store();
    seed_record(store.as_ref(), &replicating("r1")).await;
    grid.set_rule(rule_status("r1", RuleState::Ok, "2024-03-14T09:06:00")).await;
    store.fail_gets_for("r1").await;
    let before = snapshot(&store, "r1");

    let outcome = engine(&grid, &store).reconcile_rule("r1").await;
    assert_eq!(outcome, UnitOutcome::Skipped(SkipReason::StoreUnavailable));
    assert_eq!(grid.status_calls(), 0);
    assert_eq!(snapshot(&store, "r1"), before);
}

#[tokio::test]
async fn test_failed_replica_lookup_clears_endpoint() {
    let (grid, store) = grid_and_store();
    let did = DataId::new("test", "r1.dat");
    grid.set_rule(replicating("r1")).await;
    let submitter = RuleSubmitter::new(grid.clone(), store.clone(), INDEX, Span::none());
    submitter.push_rules_for_did(&did, task_tags()).await.unwrap();
    let doc = store.get(INDEX, "r1").await.unwrap();
    assert_eq!(doc["endpoint"], json!("davs://site_b.example.org:443/test/r1.dat"));
    assert_eq!(doc["protocol"], json!("davs"));

    grid.set_rule(rule_status("r1", RuleState::Stuck, "2024-03-14T09:06:00")).await;
    grid.fail_replicas().await;
    let summary = engine(&grid, &store)
        .reconcile(&pending().to_filter(), 100, 1)
        .await
        .unwrap();
    assert_eq!(summary.updated, 1);

    let doc = store.get(INDEX, "r1").await.unwrap();
    assert_eq!(doc["state"], json!("STUCK"));
    assert_eq!(doc["endpoint"], json!(null));
    assert_eq!(doc["protocol"], json!(null));
}
