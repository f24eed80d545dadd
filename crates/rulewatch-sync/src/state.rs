//! Rule lifecycle states and the boolean flags derived from them.
//!
//! The record store keeps one integer flag per state so that bucketed counts
//! can be expressed as plain term filters (`is_stuck == 1`). The flags are
//! never written independently of [`RuleState`]; they are always recomputed
//! through [`StateFlags::from_state`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle state of a replication rule record.
///
/// `Replicating`, `Ok` and `Stuck` are reported by the grid. `Submitted` is the
/// implicit initial state. The two upload states are written locally by the
/// submission path and never by the reconciliation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleState {
    /// Rule created, no progress observed yet.
    #[serde(rename = "SUBMITTED")]
    Submitted,
    /// Grid is copying replicas.
    #[serde(rename = "REPLICATING")]
    Replicating,
    /// All replicas are in place.
    #[serde(rename = "OK")]
    Ok,
    /// Grid reports a failure condition; the rule may still recover.
    #[serde(rename = "STUCK")]
    Stuck,
    /// The upload that should have preceded the rule failed.
    #[serde(rename = "UPLOAD-FAILED")]
    UploadFailed,
    /// The upload completed.
    #[serde(rename = "UPLOAD-SUCCESSFUL")]
    UploadSuccessful,
}

/// A state string that is not part of the rule lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown rule state: {0}")]
pub struct UnknownState(pub String);

impl RuleState {
    /// All states, in lifecycle order.
    pub const ALL: [RuleState; 6] = [
        RuleState::Submitted,
        RuleState::Replicating,
        RuleState::Ok,
        RuleState::Stuck,
        RuleState::UploadFailed,
        RuleState::UploadSuccessful,
    ];

    /// The wire representation used by the grid and the record store.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleState::Submitted => "SUBMITTED",
            RuleState::Replicating => "REPLICATING",
            RuleState::Ok => "OK",
            RuleState::Stuck => "STUCK",
            RuleState::UploadFailed => "UPLOAD-FAILED",
            RuleState::UploadSuccessful => "UPLOAD-SUCCESSFUL",
        }
    }

    /// Terminal records are no longer selected by the default reconciliation filter.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RuleState::Ok | RuleState::UploadFailed | RuleState::UploadSuccessful
        )
    }

    /// Upload-phase states are owned by the submission path.
    pub fn is_upload_phase(&self) -> bool {
        matches!(self, RuleState::UploadFailed | RuleState::UploadSuccessful)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// Staying in the same state is always allowed, since reconciliation is
    /// idempotent and re-observes unchanged rules.
    pub fn can_transition_to(&self, next: RuleState) -> bool {
        if *self == next {
            return true;
        }
        match self {
            RuleState::Submitted => !matches!(next, RuleState::Submitted),
            RuleState::Replicating => matches!(next, RuleState::Ok | RuleState::Stuck),
            RuleState::Stuck => matches!(next, RuleState::Replicating | RuleState::Ok),
            RuleState::Ok | RuleState::UploadFailed | RuleState::UploadSuccessful => false,
        }
    }
}

impl fmt::Display for RuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RuleState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

/// Derived per-state flags, stored as `0`/`1` integers.
///
/// At most one flag is `1`. Exactly one is `1` whenever the state is anything
/// other than `Submitted` or absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFlags {
    /// `state == OK`.
    #[serde(default)]
    pub is_done: u8,
    /// `state == REPLICATING`.
    #[serde(default)]
    pub is_replicating: u8,
    /// `state == STUCK`.
    #[serde(default)]
    pub is_stuck: u8,
    /// `state == UPLOAD-FAILED`.
    #[serde(default)]
    pub is_upload_failed: u8,
    /// `state == UPLOAD-SUCCESSFUL`.
    #[serde(default)]
    pub is_upload_successful: u8,
}

impl StateFlags {
    /// Flag field names as they appear in stored documents.
    pub const FIELDS: [&'static str; 5] = [
        "is_done",
        "is_replicating",
        "is_stuck",
        "is_upload_failed",
        "is_upload_successful",
    ];

    /// Compute the flags for a state.
    pub fn from_state(state: Option<RuleState>) -> Self {
        let is = |wanted: RuleState| u8::from(state == Some(wanted));
        Self {
            is_done: is(RuleState::Ok),
            is_replicating: is(RuleState::Replicating),
            is_stuck: is(RuleState::Stuck),
            is_upload_failed: is(RuleState::UploadFailed),
            is_upload_successful: is(RuleState::UploadSuccessful),
        }
    }

    /// Number of flags currently set.
    pub fn active_count(&self) -> u8 {
        self.is_done
            + self.is_replicating
            + self.is_stuck
            + self.is_upload_failed
            + self.is_upload_successful
    }

    /// True when any terminal flag is set.
    pub fn is_terminal(&self) -> bool {
        self.is_done == 1 || self.is_upload_failed == 1 || self.is_upload_successful == 1
    }
}
