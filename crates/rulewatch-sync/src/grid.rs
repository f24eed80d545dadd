//! Contract with the grid management system.
//!
//! The grid is the authoritative source for rule state. These traits describe
//! the calls the reconciliation engine and the submission path make; HTTP
//! implementations live in the management crate, and tests substitute
//! in-memory fakes.

use crate::error::{GridError, GridResult};
use crate::state::RuleState;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A scope-qualified data identifier (`scope:name`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataId {
    /// Namespace of the identifier.
    pub scope: String,
    /// Name within the scope.
    pub name: String,
}

impl DataId {
    /// Create a data identifier from its parts.
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.name)
    }
}

impl FromStr for DataId {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((scope, name)) if !scope.is_empty() && !name.is_empty() => {
                Ok(DataId::new(scope, name))
            }
            _ => Err(GridError::Malformed {
                msg: format!("data identifier {s:?} is not of the form scope:name"),
            }),
        }
    }
}

/// Current status of one replication rule as reported by the grid.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleStatus {
    /// Rule identifier.
    pub id: String,
    /// Scope of the governed data identifier.
    pub scope: String,
    /// Name of the governed data identifier.
    pub name: String,
    /// Destination storage-element expression.
    pub rse_expression: String,
    /// Source replica expression, if the rule was pinned to a source.
    pub source_replica_expression: Option<String>,
    /// Rule creation time.
    pub created_at: NaiveDateTime,
    /// Last time the grid changed the rule.
    pub updated_at: NaiveDateTime,
    /// Rule expiry, absent for rules without a lifetime.
    pub expires_at: Option<NaiveDateTime>,
    /// Current state.
    pub state: RuleState,
    /// Error text the grid attached to the rule, if any.
    pub error: Option<String>,
}

impl RuleStatus {
    /// The data identifier this rule governs.
    pub fn data_id(&self) -> DataId {
        DataId::new(self.scope.clone(), self.name.clone())
    }
}

/// A replica of a data identifier at a destination storage element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaLocation {
    /// Physical file name (full URL) of the replica.
    pub endpoint: String,
    /// Access protocol scheme, e.g. `davs` or `root`.
    pub protocol: String,
}

impl ReplicaLocation {
    /// Build a location from a physical file name; the protocol is its scheme.
    pub fn from_pfn(pfn: &str) -> Self {
        let protocol = pfn.split(':').next().unwrap_or_default().to_string();
        Self {
            endpoint: pfn.to_string(),
            protocol,
        }
    }
}

/// Historical transfer request for a file at a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Job id assigned by the external transfer service.
    pub external_job_id: String,
}

/// Queries against the grid management system.
#[async_trait]
pub trait GridClient: Send + Sync + 'static {
    /// Current status of a rule. Fails with [`GridError::NotFound`] for unknown ids.
    async fn rule_status(&self, rule_id: &str) -> GridResult<RuleStatus>;

    /// All replication rules governing a data identifier.
    async fn list_rules(&self, did: &DataId) -> GridResult<Vec<RuleStatus>>;

    /// Replica locations of a data identifier at a destination expression.
    async fn list_replicas(&self, did: &DataId, dest_expr: &str)
        -> GridResult<Vec<ReplicaLocation>>;

    /// Direct children of a collection; empty for files.
    async fn list_child_items(&self, did: &DataId) -> GridResult<Vec<DataId>>;

    /// The historical transfer request that moved a file to a destination.
    async fn transfer_request(&self, did: &DataId, dest_expr: &str)
        -> GridResult<TransferRequest>;
}

/// Per-file transfer throughput from the external transfer service.
#[async_trait]
pub trait ThroughputSource: Send + Sync + 'static {
    /// Throughput samples, one per file of the transfer job.
    async fn throughput_samples(&self, external_job_id: &str) -> GridResult<Vec<f64>>;
}
