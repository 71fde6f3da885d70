//! Reconciliation primitives for declarative resources.
//!
//! Resources live in an external store and carry a spec (desired state), an
//! optional status (observed state) and two counters:
//!
//! - **generation**: bumped only when the spec changes. Two records with the
//!   same generation are the same revision.
//! - **resource version**: bumped on every write; writes carrying a stale
//!   version are rejected as conflicts.
//!
//! # Invariants
//!
//! - A [`ResourceMonitor`] delivers an UPDATE only when its generation is newer
//!   than the cached one for the same key.
//! - [`update_spec`] and [`update_status`] retry conflicts and nothing else.
//! - Status writes never overwrite a concurrent spec change.

use std::time::Duration;

mod error;
mod hash;
mod monitor;
mod readiness;
mod resource;
mod store;
mod update;

pub use error::{ReadinessError, ReconcileError, StoreError, UpdateError};
pub use hash::{canonical_json, SpecHash};
pub use monitor::{
    Dispatch, MonitorConfig, MonitorScope, ResourceListener, ResourceMonitor, ResyncStats,
};
pub use readiness::{wait_until, ReadinessPolicy};
pub use resource::{ChangeType, LabelSelector, ObjectMeta, Resource, ResourceKind, WatchEvent};
pub use store::{InMemoryStore, ResourceStore};
pub use update::{update_spec, update_status, UpdatePolicy};

/// Default interval between full resyncs of a running monitor.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(600);

/// Default sleep between conflicting update attempts.
pub const DEFAULT_UPDATE_BACKOFF: Duration = Duration::from_millis(500);
