//! The reconciliation engine that brings rule records up to date with the grid.
//!
//! One invocation selects a batch of records from the store and runs an
//! independent unit of work per record on a bounded pool of tokio tasks. A
//! unit re-reads the rule from the grid, merges the authoritative fields into
//! the record, derives flags, duration, throughput and replica endpoint, and
//! upserts the result. A failing unit is logged and skipped; it never affects
//! its siblings, and the record is picked up again on the next invocation.

use crate::error::{GridError, StoreError, SyncError};
use crate::grid::{DataId, GridClient, ThroughputSource};
use crate::record::RuleRecord;
use crate::state::RuleState;
use crate::store::{Filter, RecordStore};
use crate::throughput::{self, ThroughputEstimate};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{Instrument, Span};

/// Which records a reconciliation pass selects.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Only records tagged with this task name.
    pub task_name: String,
    /// Inclusive lower bound on `created_at`.
    pub created_gte: Option<Value>,
    /// Inclusive upper bound on `created_at`.
    pub created_lte: Option<Value>,
    /// Re-poll every matching record, including terminal ones.
    pub refresh_all: bool,
}

impl Selection {
    /// Select the non-terminal records of a task.
    pub fn for_task(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            created_gte: None,
            created_lte: None,
            refresh_all: false,
        }
    }

    /// Restrict to records created within the inclusive window.
    pub fn created_between(mut self, gte: Option<Value>, lte: Option<Value>) -> Self {
        self.created_gte = gte;
        self.created_lte = lte;
        self
    }

    /// Include records that are already done.
    pub fn refresh_all(mut self, refresh_all: bool) -> Self {
        self.refresh_all = refresh_all;
        self
    }

    /// The store filter for this selection.
    pub fn to_filter(&self) -> Filter {
        let mut filter = Filter::new().term("task_name", self.task_name.as_str());
        if !self.refresh_all {
            filter = filter
                .term("is_done", 0)
                .term("is_upload_failed", 0)
                .term("is_upload_successful", 0);
        }
        if self.created_gte.is_some() || self.created_lte.is_some() {
            filter = filter.range(
                "created_at",
                self.created_gte.clone(),
                self.created_lte.clone(),
            );
        }
        filter
    }
}

/// Why a unit of work did not update its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The selected document could not be decoded as a record.
    UndecodableRecord,
    /// The grid does not know the rule.
    RuleNotFound,
    /// The grid was unreachable or answered with something unusable.
    GridUnavailable,
    /// The persisted record could not be read.
    StoreUnavailable,
    /// The record store rejected the update.
    UpsertFailed,
    /// The worker task panicked or was aborted.
    WorkerFailed,
}

/// Result of one unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    /// The record was upserted.
    Updated,
    /// The record was left as it was.
    Skipped(SkipReason),
}

/// Totals for one reconciliation invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileSummary {
    /// Records returned by the selection query.
    pub selected: usize,
    /// Records successfully upserted.
    pub updated: usize,
    /// Records left untouched.
    pub skipped: usize,
    /// Wall-clock time of the invocation.
    pub elapsed: Duration,
}

impl ReconcileSummary {
    fn record(&mut self, outcome: &UnitOutcome) {
        match outcome {
            UnitOutcome::Updated => self.updated += 1,
            UnitOutcome::Skipped(_) => self.skipped += 1,
        }
    }
}

/// Reconciles rule records against the grid.
#[derive(Clone)]
pub struct ReconciliationEngine {
    grid: Arc<dyn GridClient>,
    store: Arc<dyn RecordStore>,
    throughput: Option<Arc<dyn ThroughputSource>>,
    index: String,
    span: Span,
}

impl ReconciliationEngine {
    /// Create an engine writing to `index`. Log output is attached to `span`.
    pub fn new(
        grid: Arc<dyn GridClient>,
        store: Arc<dyn RecordStore>,
        index: impl Into<String>,
        span: Span,
    ) -> Self {
        Self {
            grid,
            store,
            throughput: None,
            index: index.into(),
            span,
        }
    }

    /// Enable throughput enrichment for rules that reach `OK`.
    pub fn with_throughput_source(mut self, source: Arc<dyn ThroughputSource>) -> Self {
        self.throughput = Some(source);
        self
    }

    /// The index this engine reads and writes.
    pub fn index(&self) -> &str {
        &self.index
    }

    /// Reconcile up to `max_rows` records matching `filter`, with at most
    /// `worker_count` units in flight. Blocks until every unit has finished.
    ///
    /// Only a failed selection query is an error; per-record failures are
    /// counted in the summary.
    pub async fn reconcile(
        &self,
        filter: &Filter,
        max_rows: usize,
        worker_count: usize,
    ) -> Result<ReconcileSummary, SyncError> {
        let started = Instant::now();
        let span = self.span.clone();
        async move {
            tracing::info!("Querying database for documents to be updated...");
            let docs = self
                .store
                .search(&self.index, filter, max_rows)
                .await
                .map_err(SyncError::Selection)?;
            tracing::info!("Found {} documents", docs.len());

            let mut summary = ReconcileSummary {
                selected: docs.len(),
                ..ReconcileSummary::default()
            };

            let permits = Arc::new(Semaphore::new(worker_count.max(1)));
            let mut workers = JoinSet::new();
            for doc in docs {
                let permit = match permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let engine = self.clone();
                workers.spawn(
                    async move {
                        let _permit = permit;
                        match RuleRecord::from_document(doc) {
                            Ok(record) => engine.reconcile_record(record).await,
                            Err(e) => {
                                tracing::warn!("Skipping undecodable document: {}", e);
                                UnitOutcome::Skipped(SkipReason::UndecodableRecord)
                            }
                        }
                    }
                    .in_current_span(),
                );
            }

            while let Some(joined) = workers.join_next().await {
                let outcome = joined.unwrap_or_else(|e| {
                    tracing::error!("Reconciliation worker failed: {}", e);
                    UnitOutcome::Skipped(SkipReason::WorkerFailed)
                });
                summary.record(&outcome);
            }

            summary.elapsed = started.elapsed();
            tracing::info!(
                selected = summary.selected,
                updated = summary.updated,
                skipped = summary.skipped,
                "Reconciled batch in {:.1}s",
                summary.elapsed.as_secs_f64()
            );
            Ok::<_, SyncError>(summary)
        }
        .instrument(span)
        .await
    }

    /// Reconcile one rule by id, using its persisted record as the base.
    /// Rules with no persisted record start from an empty one.
    pub async fn reconcile_rule(&self, rule_id: &str) -> UnitOutcome {
        let base = match self.store.get(&self.index, rule_id).await {
            Ok(doc) => match RuleRecord::from_document(doc) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(rule_id, "Skipping undecodable document: {}", e);
                    return UnitOutcome::Skipped(SkipReason::UndecodableRecord);
                }
            },
            Err(StoreError::NotFound { .. }) => RuleRecord::new(rule_id),
            Err(e) => {
                tracing::warn!(rule_id, "Error reading persisted record, skipping: {}", e);
                return UnitOutcome::Skipped(SkipReason::StoreUnavailable);
            }
        };
        self.reconcile_record(base).instrument(self.span.clone()).await
    }

    async fn reconcile_record(&self, base: RuleRecord) -> UnitOutcome {
        let rule_id = base.id.clone();
        tracing::debug!(rule_id = %rule_id, "Getting rule information...");
        let status = match self.grid.rule_status(&rule_id).await {
            Ok(status) => status,
            Err(GridError::NotFound { .. }) => {
                tracing::warn!(rule_id = %rule_id, "Rule not found on grid, skipping");
                return UnitOutcome::Skipped(SkipReason::RuleNotFound);
            }
            Err(e) => {
                tracing::warn!(
                    rule_id = %rule_id,
                    "Error getting rule information, skipping: {}",
                    e
                );
                return UnitOutcome::Skipped(SkipReason::GridUnavailable);
            }
        };

        let mut record = base.clone();
        record.apply_status(&status);

        if status.state == RuleState::Ok {
            self.apply_completion(&mut record, &base).await;
        }

        record.refresh_flags();

        let did = status.data_id();
        let replica = match self.grid.list_replicas(&did, &status.rse_expression).await {
            Ok(replicas) => replicas.into_iter().next(),
            Err(e) => {
                tracing::debug!(rule_id = %rule_id, "Replica lookup failed: {}", e);
                None
            }
        };
        record.apply_replica(replica.as_ref());

        let doc = match record.to_update_document() {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(rule_id = %rule_id, "Failed to encode record: {}", e);
                return UnitOutcome::Skipped(SkipReason::UpsertFailed);
            }
        };

        tracing::info!(rule_id = %rule_id, state = %status.state, "Updating rule...");
        match self.store.upsert(&self.index, &rule_id, doc).await {
            Ok(()) => UnitOutcome::Updated,
            Err(e) => {
                tracing::warn!(rule_id = %rule_id, "Failed to update database: {}", e);
                UnitOutcome::Skipped(SkipReason::UpsertFailed)
            }
        }
    }

    /// Duration and throughput for a record whose fresh state is `OK`.
    ///
    /// The duration compares against the persisted record, re-read from the
    /// store. When that read fails the record the unit started from stands in.
    async fn apply_completion(&self, record: &mut RuleRecord, selected: &RuleRecord) {
        let persisted = match self.store.get(&self.index, &record.id).await {
            Ok(doc) => RuleRecord::from_document(doc).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        let previous = persisted.unwrap_or_else(|e| {
            tracing::warn!(
                rule_id = %record.id,
                "Failed to get persisted record, using selected copy: {}",
                e
            );
            selected.clone()
        });
        if let Some(secs) = record.record_replication_duration(&previous) {
            tracing::debug!(rule_id = %record.id, "Replication took {}s", secs);
        }

        let (Some(source), Some(did), Some(dest)) = (
            self.throughput.as_ref(),
            record.data_id(),
            record.dest_location.clone(),
        ) else {
            return;
        };
        tracing::info!(rule_id = %record.id, "Attempting to get throughput...");
        if let Some(estimate) = self.gather_throughput(source.as_ref(), &did, &dest).await {
            tracing::debug!(
                rule_id = %record.id,
                "Added throughput ({}/{}/{})",
                estimate.mean,
                estimate.median,
                estimate.stdev
            );
            record.apply_throughput(&estimate);
        }
    }

    /// Collect throughput samples for every leaf file under `did`.
    async fn gather_throughput(
        &self,
        source: &dyn ThroughputSource,
        did: &DataId,
        dest: &str,
    ) -> Option<ThroughputEstimate> {
        let leaves = match self.expand_leaves(did).await {
            Ok(leaves) => leaves,
            Err(e) => {
                tracing::warn!(did = %did, "Failed to update throughput: {}", e);
                return None;
            }
        };

        let mut samples = Vec::new();
        for leaf in &leaves {
            let request = match self.grid.transfer_request(leaf, dest).await {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(did = %leaf, "Error getting throughput: {}", e);
                    continue;
                }
            };
            match source.throughput_samples(&request.external_job_id).await {
                Ok(batch) => samples.extend(batch),
                Err(e) => tracing::warn!(did = %leaf, "Error getting throughput: {}", e),
            }
        }
        throughput::estimate(&samples)
    }

    /// Breadth-first expansion of a collection into its files. A file expands
    /// to itself. Identifiers already visited are not expanded twice.
    async fn expand_leaves(&self, root: &DataId) -> Result<Vec<DataId>, GridError> {
        let mut leaves = Vec::new();
        let mut seen = HashSet::from([root.clone()]);
        let mut queue = VecDeque::from([root.clone()]);
        while let Some(did) = queue.pop_front() {
            let children = self.grid.list_child_items(&did).await?;
            if children.is_empty() {
                leaves.push(did);
                continue;
            }
            for child in children {
                if seen.insert(child.clone()) {
                    queue.push_back(child);
                }
            }
        }
        Ok(leaves)
    }
}
