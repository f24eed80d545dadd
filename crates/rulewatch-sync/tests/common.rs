//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use rulewatch_sync::grid_time::parse_grid_time;
use rulewatch_sync::{
    DataId, Document, Filter, GridClient, GridError, GridResult, MemoryRecordStore, RecordStore,
    ReplicaLocation, RuleRecord, RuleState, RuleStatus, StoreError, StoreResult, Tags,
    ThroughputSource, TransferRequest,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

pub const INDEX: &str = "rules";
pub const TASK: &str = "nightly-replication";

/// In-process grid whose rule states can be changed between runs
#[derive(Default)]
pub struct MockGrid {
    rules: RwLock<HashMap<String, RuleStatus>>,
    children: RwLock<HashMap<DataId, Vec<DataId>>>,
    jobs: RwLock<HashMap<DataId, String>>,
    panic_on: RwLock<HashSet<String>>,
    fail_replicas: RwLock<bool>,
    status_calls: AtomicUsize,
}

impl MockGrid {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_rule(&self, status: RuleStatus) {
        self.rules.write().await.insert(status.id.clone(), status);
    }

    pub async fn set_children(&self, parent: DataId, children: Vec<DataId>) {
        self.children.write().await.insert(parent, children);
    }

    pub async fn set_job(&self, did: DataId, job: &str) {
        self.jobs.write().await.insert(did, job.to_string());
    }

    /// Make `rule_status` panic for this id
    pub async fn panic_on(&self, rule_id: &str) {
        self.panic_on.write().await.insert(rule_id.to_string());
    }

    /// Make every `list_replicas` call fail
    pub async fn fail_replicas(&self) {
        *self.fail_replicas.write().await = true;
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GridClient for MockGrid {
    async fn rule_status(&self, rule_id: &str) -> GridResult<RuleStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on.read().await.contains(rule_id) {
            panic!("grid client crashed on {rule_id}");
        }
        self.rules
            .read()
            .await
            .get(rule_id)
            .cloned()
            .ok_or_else(|| GridError::NotFound {
                rule_id: rule_id.to_string(),
            })
    }

    async fn list_rules(&self, did: &DataId) -> GridResult<Vec<RuleStatus>> {
        let mut rules: Vec<_> = self
            .rules
            .read()
            .await
            .values()
            .filter(|r| r.data_id() == *did)
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rules)
    }

    async fn list_replicas(
        &self,
        did: &DataId,
        dest_expr: &str,
    ) -> GridResult<Vec<ReplicaLocation>> {
        if *self.fail_replicas.read().await {
            return Err(GridError::Transport {
                msg: format!("replica lookup for {did} timed out"),
            });
        }
        Ok(vec![ReplicaLocation::from_pfn(&format!(
            "davs://{}.example.org:443/{}/{}",
            dest_expr.to_lowercase(),
            did.scope,
            did.name
        ))])
    }

    async fn list_child_items(&self, did: &DataId) -> GridResult<Vec<DataId>> {
        Ok(self
            .children
            .read()
            .await
            .get(did)
            .cloned()
            .unwrap_or_default())
    }

    async fn transfer_request(
        &self,
        did: &DataId,
        _dest_expr: &str,
    ) -> GridResult<TransferRequest> {
        self.jobs
            .read()
            .await
            .get(did)
            .map(|job| TransferRequest {
                external_job_id: job.clone(),
            })
            .ok_or_else(|| GridError::Transport {
                msg: format!("no transfer request for {did}"),
            })
    }
}

/// Throughput samples keyed by job id
#[derive(Default)]
pub struct MockFts {
    samples: HashMap<String, Vec<f64>>,
}

impl MockFts {
    pub fn with_job(mut self, job: &str, samples: Vec<f64>) -> Self {
        self.samples.insert(job.to_string(), samples);
        self
    }
}

#[async_trait]
impl ThroughputSource for MockFts {
    async fn throughput_samples(&self, external_job_id: &str) -> GridResult<Vec<f64>> {
        self.samples
            .get(external_job_id)
            .cloned()
            .ok_or_else(|| GridError::Transport {
                msg: format!("unknown job {external_job_id}"),
            })
    }
}

/// Memory store that can be told to fail searches, or reads and upserts of
/// specific ids
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryRecordStore,
    fail_search: RwLock<bool>,
    fail_get: RwLock<HashSet<String>>,
    fail_upsert: RwLock<HashSet<String>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_searches(&self) {
        *self.fail_search.write().await = true;
    }

    pub async fn fail_gets_for(&self, id: &str) {
        self.fail_get.write().await.insert(id.to_string());
    }

    pub async fn fail_upserts_for(&self, id: &str) {
        self.fail_upsert.write().await.insert(id.to_string());
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn get(&self, index: &str, id: &str) -> StoreResult<Document> {
        if self.fail_get.read().await.contains(id) {
            return Err(StoreError::Unavailable {
                msg: "shard not allocated".to_string(),
            });
        }
        self.inner.get(index, id).await
    }

    async fn upsert(&self, index: &str, id: &str, doc: Document) -> StoreResult<()> {
        if self.fail_upsert.read().await.contains(id) {
            return Err(StoreError::Unavailable {
                msg: "index is read-only".to_string(),
            });
        }
        self.inner.upsert(index, id, doc).await
    }

    async fn search(
        &self,
        index: &str,
        filter: &Filter,
        max_rows: usize,
    ) -> StoreResult<Vec<Document>> {
        if *self.fail_search.read().await {
            return Err(StoreError::Unavailable {
                msg: "cluster red".to_string(),
            });
        }
        self.inner.search(index, filter, max_rows).await
    }
}

pub fn rule_status(id: &str, state: RuleState, updated_at: &str) -> RuleStatus {
    RuleStatus {
        id: id.to_string(),
        scope: "test".to_string(),
        name: format!("{id}.dat"),
        rse_expression: "SITE_B".to_string(),
        source_replica_expression: Some("SITE_A".to_string()),
        created_at: parse_grid_time("2024-03-14T09:00:00").unwrap(),
        updated_at: parse_grid_time(updated_at).unwrap(),
        expires_at: None,
        state,
        error: None,
    }
}

pub fn task_tags() -> Tags {
    Tags::from([
        ("task_name".to_string(), json!(TASK)),
        ("file_size".to_string(), json!(1_048_576)),
        ("n_files".to_string(), json!(1)),
        ("type".to_string(), json!("file")),
    ])
}

/// Persist the record a submission would have written for `status`
pub async fn seed_record(store: &dyn RecordStore, status: &RuleStatus) {
    let mut record = RuleRecord::from_status(status, 1_710_406_800_000);
    record.mark_submitted();
    record.merge_tags(task_tags());
    record.refresh_flags();
    store
        .upsert(INDEX, &record.id, record.to_document().unwrap())
        .await
        .unwrap();
}

pub async fn stored(store: &dyn RecordStore, id: &str) -> RuleRecord {
    RuleRecord::from_document(store.get(INDEX, id).await.unwrap()).unwrap()
}

pub fn grid_and_store() -> (Arc<MockGrid>, Arc<FlakyStore>) {
    (Arc::new(MockGrid::new()), Arc::new(FlakyStore::new()))
}
