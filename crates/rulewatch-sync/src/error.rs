//! Error types for the rule synchronisation subsystem.

use thiserror::Error;

/// Errors returned by a [`GridClient`](crate::grid::GridClient) or
/// [`ThroughputSource`](crate::grid::ThroughputSource).
#[derive(Debug, Error)]
pub enum GridError {
    /// The grid has no rule with this identifier.
    #[error("rule not found: {rule_id}")]
    NotFound {
        /// The unknown rule identifier.
        rule_id: String,
    },

    /// The grid could not be reached or returned an error status.
    #[error("grid transport error: {msg}")]
    Transport {
        /// Error message describing the transport issue.
        msg: String,
    },

    /// The grid answered, but the response could not be interpreted.
    #[error("malformed grid response: {msg}")]
    Malformed {
        /// Error message describing the malformed response.
        msg: String,
    },
}

/// Errors returned by a [`RecordStore`](crate::store::RecordStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// No document with this id exists in the index.
    #[error("document {id} not found in index {index}")]
    NotFound {
        /// Index that was searched.
        index: String,
        /// Missing document id.
        id: String,
    },

    /// The store could not be reached or rejected the request.
    #[error("record store unavailable: {msg}")]
    Unavailable {
        /// Error message describing the issue.
        msg: String,
    },

    /// A document could not be converted to or from a record.
    #[error("document serialization error")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that abort a whole synchronisation invocation.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Selecting the records to reconcile failed.
    #[error("record selection failed")]
    Selection(#[source] StoreError),

    /// Listing rules for a submitted data identifier failed.
    #[error("listing rules for {did} failed")]
    RuleListing {
        /// Data identifier being submitted.
        did: String,
        /// Underlying grid error.
        #[source]
        source: GridError,
    },

    /// A timestamp could not be parsed in any supported grid format.
    #[error("invalid grid timestamp: {0}")]
    Timestamp(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result alias for grid operations.
pub type GridResult<T> = std::result::Result<T, GridError>;
