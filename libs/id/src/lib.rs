//! # stratum-id
//!
//! Identifier types shared by the stratum orchestration crates.
//!
//! ## ID Format
//!
//! System-generated IDs use a prefixed format: `{prefix}_{ulid}`, for example
//! `cmp_01HV4Z2WQXKJNM8GPQY6VBKC3D` for a lifecycle component.
//!
//! Tenant tokens are operator-chosen and validated instead of generated; see
//! [`TenantToken`].

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
