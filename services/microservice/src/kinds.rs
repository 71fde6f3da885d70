//! Resource kinds watched by the microservice host.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratum_lifecycle::ComponentStatus;
use stratum_reconcile::{ResourceKind, SpecHash};

/// Label naming the instance a resource belongs to.
pub const LABEL_INSTANCE: &str = "stratum.io/instance";

/// Label naming the functional area a resource belongs to.
pub const LABEL_FUNCTIONAL_AREA: &str = "stratum.io/functional-area";

/// Changed flags for kinds whose only interesting field is `configuration`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigurationDiff {
    pub configuration_changed: bool,
}

impl ConfigurationDiff {
    fn between(previous: Option<&serde_json::Value>, current: &serde_json::Value) -> Self {
        Self {
            configuration_changed: previous
                .is_none_or(|p| SpecHash::from_json(p) != SpecHash::from_json(current)),
        }
    }
}

// =============================================================================
// Instance
// =============================================================================

/// An instance: the top-level deployment a set of microservices belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub configuration: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    /// Set once the instance's shared datasets have been created.
    #[serde(default)]
    pub bootstrapped: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl ResourceKind for InstanceKind {
    const KIND: &'static str = "instance";
    type Spec = InstanceSpec;
    type Status = InstanceStatus;
    type Diff = ConfigurationDiff;

    fn diff(previous: Option<&InstanceSpec>, current: &InstanceSpec) -> ConfigurationDiff {
        ConfigurationDiff::between(previous.map(|p| &p.configuration), &current.configuration)
    }
}

// =============================================================================
// Microservice
// =============================================================================

/// A microservice within an instance, one per functional area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MicroserviceKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroserviceSpec {
    pub functional_area: String,
    #[serde(default)]
    pub configuration: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroserviceStatus {
    #[serde(default)]
    pub state: Option<ComponentStatus>,
}

impl ResourceKind for MicroserviceKind {
    const KIND: &'static str = "microservice";
    type Spec = MicroserviceSpec;
    type Status = MicroserviceStatus;
    type Diff = ConfigurationDiff;

    fn diff(previous: Option<&MicroserviceSpec>, current: &MicroserviceSpec) -> ConfigurationDiff {
        ConfigurationDiff::between(previous.map(|p| &p.configuration), &current.configuration)
    }
}

// =============================================================================
// Script and script version
// =============================================================================

/// A user script registered with an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptSpec {
    pub script_id: String,
    #[serde(default)]
    pub interpreter: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Version executed by engines; `None` disables the script.
    #[serde(default)]
    pub active_version: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptDiff {
    pub active_version_changed: bool,
    pub metadata_changed: bool,
}

impl ResourceKind for ScriptKind {
    const KIND: &'static str = "script";
    type Spec = ScriptSpec;
    type Status = ();
    type Diff = ScriptDiff;

    fn diff(previous: Option<&ScriptSpec>, current: &ScriptSpec) -> ScriptDiff {
        match previous {
            None => ScriptDiff {
                active_version_changed: true,
                metadata_changed: true,
            },
            Some(p) => ScriptDiff {
                active_version_changed: p.active_version != current.active_version,
                metadata_changed: p.interpreter != current.interpreter
                    || p.description != current.description,
            },
        }
    }
}

/// One immutable version of a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptVersionKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptVersionSpec {
    pub script_id: String,
    pub version_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptVersionDiff {
    pub content_changed: bool,
}

impl ResourceKind for ScriptVersionKind {
    const KIND: &'static str = "script-version";
    type Spec = ScriptVersionSpec;
    type Status = ();
    type Diff = ScriptVersionDiff;

    fn diff(previous: Option<&ScriptVersionSpec>, current: &ScriptVersionSpec) -> ScriptVersionDiff {
        ScriptVersionDiff {
            content_changed: previous.is_none_or(|p| p.content != current.content),
        }
    }
}

// =============================================================================
// Tenant engine
// =============================================================================

/// Per-tenant engine configuration for one functional area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantEngineKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantEngineSpec {
    /// Tenant token; validated when the resource is keyed.
    pub tenant: String,
    pub functional_area: String,
    #[serde(default)]
    pub configuration: serde_json::Value,
}

/// Engine state written back by the tenant engine manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantEngineStatus {
    #[serde(default)]
    pub state: Option<ComponentStatus>,

    /// Hash of the configuration the running engine was built from.
    #[serde(default)]
    pub configuration_hash: Option<SpecHash>,

    /// Set by the engine once its tenant dataset exists.
    #[serde(default)]
    pub dataset_bootstrapped: bool,

    /// Failure cause, if the last attempt failed.
    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub last_transition: Option<DateTime<Utc>>,
}

impl ResourceKind for TenantEngineKind {
    const KIND: &'static str = "tenant-engine";
    type Spec = TenantEngineSpec;
    type Status = TenantEngineStatus;
    type Diff = ConfigurationDiff;

    fn diff(previous: Option<&TenantEngineSpec>, current: &TenantEngineSpec) -> ConfigurationDiff {
        ConfigurationDiff::between(previous.map(|p| &p.configuration), &current.configuration)
    }
}
