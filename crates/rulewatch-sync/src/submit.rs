//! Creation of initial rule records.
//!
//! The submission path runs right after rules are added on the grid (or after
//! an upload attempt) and writes the first version of each record. From then
//! on the records belong to the reconciliation engine.

use crate::error::SyncError;
use crate::grid::{DataId, GridClient};
use crate::record::{RuleRecord, Tags};
use crate::state::RuleState;
use crate::store::RecordStore;
use serde_json::Value;
use std::sync::Arc;
use tracing::{Instrument, Span};

/// Result of an upload attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    /// The upload completed.
    Succeeded {
        /// Time the upload took, when measured.
        duration_secs: Option<f64>,
    },
    /// The upload failed with this error.
    Failed {
        /// Short description of the failure.
        error: String,
    },
}

/// Writes initial records for freshly submitted rules and uploads.
#[derive(Clone)]
pub struct RuleSubmitter {
    grid: Arc<dyn GridClient>,
    store: Arc<dyn RecordStore>,
    index: String,
    span: Span,
}

impl RuleSubmitter {
    /// Create a submitter writing into `index`.
    pub fn new(
        grid: Arc<dyn GridClient>,
        store: Arc<dyn RecordStore>,
        index: impl Into<String>,
        span: Span,
    ) -> Self {
        Self {
            grid,
            store,
            index: index.into(),
            span,
        }
    }

    /// Create one record per replication rule the grid reports for `did`.
    ///
    /// When the grid reports no rules a single placeholder record with a
    /// generated id is written so that the submission is still counted.
    /// A record that fails to index is logged and skipped. Returns the ids
    /// written.
    pub async fn push_rules_for_did(
        &self,
        did: &DataId,
        tags: Tags,
    ) -> Result<Vec<String>, SyncError> {
        async move {
            let rules = self
                .grid
                .list_rules(did)
                .await
                .map_err(|source| SyncError::RuleListing {
                    did: did.to_string(),
                    source,
                })?;

            let now = now_ms();
            let mut records = Vec::with_capacity(rules.len().max(1));
            if rules.is_empty() {
                tracing::debug!(did = %did, "No rules found, synthesizing record");
                records.push(RuleRecord::synthesized(now));
            }
            for status in &rules {
                let mut record = RuleRecord::from_status(status, now);
                let replica = match self.grid.list_replicas(did, &status.rse_expression).await {
                    Ok(replicas) => replicas.into_iter().next(),
                    Err(_) => None,
                };
                record.apply_replica(replica.as_ref());
                records.push(record);
            }

            let mut written = Vec::with_capacity(records.len());
            for mut record in records {
                record.mark_submitted();
                let rejected = record.merge_tags(tags.clone());
                if !rejected.is_empty() {
                    tracing::warn!(rule_id = %record.id, "Ignoring reserved tags: {:?}", rejected);
                }
                record.refresh_flags();
                if self.index_record(&record).await {
                    written.push(record.id);
                }
            }
            Ok::<_, SyncError>(written)
        }
        .instrument(self.span.clone())
        .await
    }

    /// Create the upload-phase record for an upload of `did` to `dest`.
    /// Returns the generated id, or `None` if indexing failed.
    pub async fn record_upload(
        &self,
        did: &DataId,
        dest: &str,
        outcome: UploadOutcome,
        tags: Tags,
    ) -> Option<String> {
        let mut record = RuleRecord::synthesized(now_ms());
        record.scope = Some(did.scope.clone());
        record.name = Some(did.name.clone());
        record.dest_location = Some(dest.to_string());

        let mut extra = tags;
        extra.insert("is_upload_submitted".to_string(), Value::from(1));
        match outcome {
            UploadOutcome::Succeeded { duration_secs } => {
                record.state = Some(RuleState::UploadSuccessful);
                if let Some(secs) = duration_secs {
                    extra.insert("upload_duration".to_string(), Value::from(secs));
                }
            }
            UploadOutcome::Failed { error } => {
                record.state = Some(RuleState::UploadFailed);
                record.error_detail = Some(error);
            }
        }
        let rejected = record.merge_tags(extra);
        if !rejected.is_empty() {
            tracing::warn!(
                parent: &self.span,
                rule_id = %record.id,
                "Ignoring reserved tags: {:?}",
                rejected
            );
        }
        record.refresh_flags();

        if self.index_record(&record).instrument(self.span.clone()).await {
            Some(record.id)
        } else {
            None
        }
    }

    async fn index_record(&self, record: &RuleRecord) -> bool {
        let doc = match record.to_document() {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(rule_id = %record.id, "Failed to push rule: {}", e);
                return false;
            }
        };
        match self.store.upsert(&self.index, &record.id, doc).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(rule_id = %record.id, "Failed to push rule: {}", e);
                false
            }
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
