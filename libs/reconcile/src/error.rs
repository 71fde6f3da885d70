//! Store, reconciliation, update and readiness errors.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by a [`crate::ResourceStore`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The write carried a stale resource version.
    #[error("conflicting write to {kind} {key}: expected version {expected}, found {actual}")]
    Conflict {
        kind: &'static str,
        key: String,
        expected: u64,
        actual: u64,
    },

    /// The resource does not exist.
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    /// A resource with the same key already exists.
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },

    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Reasons a monitor refuses to process a resource.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// A label required to compute the scope key is absent.
    #[error("{resource} is missing label '{label}'")]
    MissingLabel { resource: String, label: String },

    /// A label or field has a value that cannot be interpreted.
    #[error("{resource} has invalid {field}: {reason}")]
    Invalid {
        resource: String,
        field: String,
        reason: String,
    },
}

/// Errors from [`crate::update_spec`] and [`crate::update_status`].
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The resource disappeared before the update could be applied.
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    /// A non-conflict store error; never retried.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from [`crate::wait_until`].
#[derive(Debug, Error)]
pub enum ReadinessError {
    /// The deadline elapsed before the probe reported ready.
    #[error("timeout after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    /// The wait was cancelled.
    #[error("wait for {what} cancelled")]
    Cancelled { what: String },
}
