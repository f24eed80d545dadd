//! The rule record: one stored document per replication rule.
//!
//! Records mix authoritative fields mirrored from the grid, fields derived
//! locally (flags, duration, throughput, replica endpoint) and caller tags
//! supplied at submission time. [`RuleRecord::apply_status`] is the only
//! place authoritative fields are overwritten; everything else is carried
//! forward untouched.

use crate::error::StoreError;
use crate::grid::{DataId, ReplicaLocation, RuleStatus};
use crate::grid_time::{self, seconds_between};
use crate::state::{RuleState, StateFlags};
use crate::store::Document;
use crate::throughput::ThroughputEstimate;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Caller-supplied tags (task name, file size, ...), stored as top-level keys.
pub type Tags = BTreeMap<String, Value>;

/// Document keys written by the typed part of [`RuleRecord`]. Tags may not use them.
pub const RESERVED_KEYS: [&str; 23] = [
    "rule_id",
    "@timestamp",
    "scope",
    "name",
    "from_rse",
    "to_rse",
    "created_at",
    "updated_at",
    "expires_at",
    "state",
    "error",
    "endpoint",
    "protocol",
    "replication_duration",
    "fts_throughput_mean",
    "fts_throughput_median",
    "fts_throughput_stdev",
    "is_submitted",
    "is_done",
    "is_replicating",
    "is_stuck",
    "is_upload_failed",
    "is_upload_successful",
];

/// Optional keys a reconciliation may clear; written as explicit `null` so a
/// shallow merge removes stale values.
const NULLABLE_UPDATE_KEYS: [&str; 4] = ["error", "endpoint", "protocol", "expires_at"];

/// One replication rule's observed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRecord {
    /// Primary key; the grid's rule id or a generated UUID.
    #[serde(rename = "rule_id")]
    pub id: String,
    /// Record creation time in epoch milliseconds.
    #[serde(rename = "@timestamp", default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<i64>,
    /// Scope of the governed data identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Name of the governed data identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Source storage element or expression.
    #[serde(rename = "from_rse", default, skip_serializing_if = "Option::is_none")]
    pub source_location: Option<String>,
    /// Destination storage element or expression.
    #[serde(rename = "to_rse", default, skip_serializing_if = "Option::is_none")]
    pub dest_location: Option<String>,
    /// Rule creation time on the grid.
    #[serde(
        default,
        with = "grid_time::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<NaiveDateTime>,
    /// Last grid-side change.
    #[serde(
        default,
        with = "grid_time::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<NaiveDateTime>,
    /// Rule expiry.
    #[serde(
        default,
        with = "grid_time::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<NaiveDateTime>,
    /// Lifecycle state; absent means implicitly submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RuleState>,
    /// Error text reported with a failure-adjacent state.
    #[serde(rename = "error", default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// Physical location of the destination replica.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Protocol scheme of [`Self::endpoint`].
    #[serde(rename = "protocol", default, skip_serializing_if = "Option::is_none")]
    pub transport_protocol: Option<String>,
    /// Seconds between the persisted `REPLICATING` observation and `OK`.
    #[serde(
        rename = "replication_duration",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub replication_duration_seconds: Option<f64>,
    /// Mean per-file throughput.
    #[serde(
        rename = "fts_throughput_mean",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub throughput_mean: Option<f64>,
    /// Median per-file throughput.
    #[serde(
        rename = "fts_throughput_median",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub throughput_median: Option<f64>,
    /// Population standard deviation of per-file throughput.
    #[serde(
        rename = "fts_throughput_stdev",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub throughput_stdev: Option<f64>,
    /// Sticky submission marker.
    #[serde(default)]
    pub is_submitted: u8,
    /// Per-state flags derived from [`Self::state`].
    #[serde(flatten)]
    pub flags: StateFlags,
    /// Caller tags.
    #[serde(flatten)]
    pub tags: Tags,
}

impl RuleRecord {
    /// An empty record with only an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            timestamp_ms: None,
            scope: None,
            name: None,
            source_location: None,
            dest_location: None,
            created_at: None,
            updated_at: None,
            expires_at: None,
            state: None,
            error_detail: None,
            endpoint: None,
            transport_protocol: None,
            replication_duration_seconds: None,
            throughput_mean: None,
            throughput_median: None,
            throughput_stdev: None,
            is_submitted: 0,
            flags: StateFlags::default(),
            tags: Tags::new(),
        }
    }

    /// A placeholder record with a generated id, used when the grid reports no
    /// rules for a submission.
    pub fn synthesized(timestamp_ms: i64) -> Self {
        let mut record = Self::new(uuid::Uuid::new_v4().to_string());
        record.timestamp_ms = Some(timestamp_ms);
        record
    }

    /// The initial record for a rule the grid has just reported.
    pub fn from_status(status: &RuleStatus, timestamp_ms: i64) -> Self {
        let mut record = Self::new(status.id.clone());
        record.timestamp_ms = Some(timestamp_ms);
        record.source_location = status.source_replica_expression.clone();
        record.created_at = Some(status.created_at);
        record.apply_status(status);
        record
    }

    /// Decode a stored document.
    pub fn from_document(doc: Document) -> Result<Self, StoreError> {
        Ok(serde_json::from_value(Value::Object(doc))?)
    }

    /// Encode as a document for creation; unset optional fields are omitted.
    pub fn to_document(&self) -> Result<Document, StoreError> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(StoreError::Serialization(serde::ser::Error::custom(format!(
                "record encoded as {other}, expected an object"
            )))),
        }
    }

    /// Encode as a document for a shallow-merge update. Optional fields that a
    /// reconciliation may clear are written as explicit `null`.
    pub fn to_update_document(&self) -> Result<Document, StoreError> {
        let mut doc = self.to_document()?;
        for key in NULLABLE_UPDATE_KEYS {
            doc.entry(key.to_string()).or_insert(Value::Null);
        }
        Ok(doc)
    }

    /// The governed data identifier, if known.
    pub fn data_id(&self) -> Option<DataId> {
        match (&self.scope, &self.name) {
            (Some(scope), Some(name)) => Some(DataId::new(scope.clone(), name.clone())),
            _ => None,
        }
    }

    /// Merge caller tags. Keys owned by the typed fields are rejected and returned.
    pub fn merge_tags(&mut self, tags: Tags) -> Vec<String> {
        let mut rejected = Vec::new();
        for (key, value) in tags {
            if RESERVED_KEYS.contains(&key.as_str()) {
                rejected.push(key);
            } else {
                self.tags.insert(key, value);
            }
        }
        rejected
    }

    /// Overwrite the authoritative fields from a fresh grid status.
    ///
    /// Touches exactly `scope`, `name`, `dest_location`, `updated_at`,
    /// `expires_at`, `state` and `error_detail`. The id, creation time, source,
    /// tags and every derived field are left as they were.
    pub fn apply_status(&mut self, status: &RuleStatus) {
        self.scope = Some(status.scope.clone());
        self.name = Some(status.name.clone());
        self.dest_location = Some(status.rse_expression.clone());
        self.updated_at = Some(status.updated_at);
        self.expires_at = status.expires_at;
        self.state = Some(status.state);
        self.error_detail = status.error.clone();
    }

    /// Recompute the state flags. `is_submitted` only ever goes from 0 to 1.
    pub fn refresh_flags(&mut self) {
        self.flags = StateFlags::from_state(self.state);
        if self.state == Some(RuleState::Submitted) {
            self.is_submitted = 1;
        }
    }

    /// Mark the record as submitted.
    pub fn mark_submitted(&mut self) {
        self.is_submitted = 1;
    }

    /// Record the time spent replicating, if this update is the first observed
    /// `REPLICATING → OK` transition.
    ///
    /// `previous` is the persisted record before this update. Nothing happens
    /// unless `self` is `OK`, `previous` is `REPLICATING`, neither carries a
    /// duration yet, and both have `updated_at`. Negative spans (grid clock
    /// skew) are clamped to zero. Returns the duration when one was set.
    pub fn record_replication_duration(&mut self, previous: &RuleRecord) -> Option<f64> {
        if self.state != Some(RuleState::Ok) || previous.state != Some(RuleState::Replicating) {
            return None;
        }
        if self.replication_duration_seconds.is_some()
            || previous.replication_duration_seconds.is_some()
        {
            return None;
        }
        let started = previous.updated_at.as_ref()?;
        let done = self.updated_at.as_ref()?;
        let duration = seconds_between(started, done).max(0.0);
        self.replication_duration_seconds = Some(duration);
        Some(duration)
    }

    /// Set the throughput fields from an estimate.
    pub fn apply_throughput(&mut self, estimate: &ThroughputEstimate) {
        self.throughput_mean = Some(estimate.mean);
        self.throughput_median = Some(estimate.median);
        self.throughput_stdev = Some(estimate.stdev);
    }

    /// Set or clear the replica endpoint and protocol.
    pub fn apply_replica(&mut self, replica: Option<&ReplicaLocation>) {
        self.endpoint = replica.map(|r| r.endpoint.clone());
        self.transport_protocol = replica.map(|r| r.protocol.clone());
    }

    /// Whether the record has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.flags.is_terminal()
    }
}
