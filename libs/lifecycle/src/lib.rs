//! Lifecycle primitives for nested components.
//!
//! A [`Component`] is a node in an ownership tree. Each node carries a status
//! that only changes through the lifecycle verbs (`lifecycle_initialize`,
//! `lifecycle_start`, `lifecycle_pause`, `lifecycle_stop`,
//! `lifecycle_terminate`). Behavior is supplied through the [`Lifecycle`]
//! trait; optional capabilities ([`TenantAware`], [`AsyncStart`]) are queried
//! at runtime instead of being encoded in a type hierarchy.
//!
//! ## State Machine
//!
//! ```text
//! Initializing -> Stopped | InitializationError
//! Stopped -> Starting -> Started | StartedWithErrors | LifecycleError
//! Started <-> Pausing -> Paused
//! Started | Paused -> Stopping -> Stopped | StoppedWithErrors | LifecycleError
//! * -> Terminating -> Terminated | LifecycleError
//! ```
//!
//! Ordered units of work are expressed as [`LifecycleStep`]s and reported
//! through a [`ProgressMonitor`].

mod component;
mod error;
mod progress;
mod status;
mod step;

pub use component::{AsyncStart, Component, ComponentSnapshot, Lifecycle, NoopLifecycle, TenantAware};
pub use error::{LifecycleError, ProgressError};
pub use progress::{ProgressMonitor, ProgressReport};
pub use status::{ComponentStatus, ComponentType, Health};
pub use step::{provision, ComponentStep, CompositeStep, LifecycleStep, LifecycleVerb};
