#![warn(missing_docs)]

//! Rulewatch sync subsystem: rule record model, grid and store contracts, reconciliation engine

pub mod engine;
pub mod error;
pub mod grid;
pub mod grid_time;
pub mod record;
pub mod state;
pub mod store;
pub mod submit;
pub mod throughput;

pub use engine::{ReconcileSummary, ReconciliationEngine, Selection, SkipReason, UnitOutcome};
pub use error::{GridError, GridResult, StoreError, StoreResult, SyncError};
pub use grid::{DataId, GridClient, ReplicaLocation, RuleStatus, ThroughputSource, TransferRequest};
pub use record::{RuleRecord, Tags};
pub use state::{RuleState, StateFlags};
pub use store::{Document, Filter, MemoryRecordStore, Predicate, RecordStore};
pub use submit::{RuleSubmitter, UploadOutcome};
pub use throughput::{estimate, ThroughputEstimate};
