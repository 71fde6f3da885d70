//! stratum microservice host library.
//!
//! A microservice process serves one functional area of one instance. It
//! watches five kinds of declarative resources and runs one engine per tenant:
//!
//! ```text
//! microservice (Component)
//! ├── resource monitors  instance, microservice, script, script-version, tenant-engine
//! └── TenantEngineManager
//!     ├── starter loop   initialization queue → initialize + start
//!     ├── stopper loop   shutdown queue       → stop + terminate
//!     └── engines        one Component per tenant token
//! ```
//!
//! ## Modules
//!
//! - `kinds`: typed specs, statuses and diffs of the watched resources
//! - `monitors`: scope rules of the five resource monitors
//! - `tenant`: the tenant engine manager
//! - `messaging`: topic readiness
//! - `engine`: the standard tenant engine
//! - `service`: the host component tying it together

pub mod config;
pub mod engine;
pub mod kinds;
pub mod messaging;
pub mod monitors;
pub mod service;
pub mod tenant;
