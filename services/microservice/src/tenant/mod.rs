//! Tenant engine management.
//!
//! Each tenant served by a functional area gets its own engine component,
//! built from a tenant-engine resource and driven through its lifecycle by
//! the [`TenantEngineManager`].

mod engine;
mod manager;

pub use engine::{EngineContext, EngineFailure, NotAvailable, TenantEngine, TenantEngineFactory};
pub use manager::{ManagerConfig, ManagerError, ManagerStats, TenantEngineManager};
