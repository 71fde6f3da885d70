//! Monitor scopes for the five resource kinds.
//!
//! | Monitor        | Owns                                   | Keyed by               |
//! |----------------|----------------------------------------|------------------------|
//! | instance       | the instance named by our instance id  | instance id            |
//! | microservice   | our instance, our functional area      | resource name          |
//! | script         | our instance                           | script id              |
//! | script-version | our instance                           | script id + version id |
//! | tenant-engine  | our instance, our functional area      | tenant token           |

use stratum_id::TenantToken;
use stratum_reconcile::{
    LabelSelector, MonitorScope, ReconcileError, Resource, ResourceKind, ResourceMonitor,
};

use crate::kinds::{
    InstanceKind, MicroserviceKind, ScriptKind, ScriptVersionKind, TenantEngineKind,
    LABEL_FUNCTIONAL_AREA, LABEL_INSTANCE,
};

/// The identity a process serves: one instance, one functional area.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub instance_id: String,
    pub functional_area: String,
}

impl Identity {
    pub fn new(instance_id: impl Into<String>, functional_area: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            functional_area: functional_area.into(),
        }
    }

    /// Selector for resources labeled with this instance.
    pub fn instance_selector(&self) -> LabelSelector {
        LabelSelector::everything().with(LABEL_INSTANCE, &self.instance_id)
    }

    /// Whether `resource` is labeled for this instance. Unlabeled resources
    /// are malformed.
    fn owns_instance<K: ResourceKind>(&self, resource: &Resource<K>) -> Result<bool, ReconcileError> {
        let instance = resource
            .label(LABEL_INSTANCE)
            .ok_or_else(|| ReconcileError::MissingLabel {
                resource: resource.key(),
                label: LABEL_INSTANCE.to_string(),
            })?;
        Ok(instance == self.instance_id)
    }

    /// Functional area from the spec, cross-checked against the label when
    /// one is present.
    fn owns_area<K: ResourceKind>(
        &self,
        resource: &Resource<K>,
        spec_area: &str,
    ) -> Result<bool, ReconcileError> {
        if spec_area.is_empty() {
            return Err(ReconcileError::Invalid {
                resource: resource.key(),
                field: "functionalArea".to_string(),
                reason: "empty".to_string(),
            });
        }
        if let Some(label) = resource.label(LABEL_FUNCTIONAL_AREA) {
            if label != spec_area {
                return Err(ReconcileError::Invalid {
                    resource: resource.key(),
                    field: "functionalArea".to_string(),
                    reason: format!("label says '{label}', spec says '{spec_area}'"),
                });
            }
        }
        Ok(spec_area == self.functional_area)
    }
}

fn required<'a, K: ResourceKind>(
    resource: &Resource<K>,
    field: &str,
    value: &'a str,
) -> Result<&'a str, ReconcileError> {
    if value.trim().is_empty() {
        return Err(ReconcileError::Invalid {
            resource: resource.key(),
            field: field.to_string(),
            reason: "empty".to_string(),
        });
    }
    Ok(value)
}

/// Owns the instance resource named after our instance id.
#[derive(Debug, Clone)]
pub struct InstanceScope(pub Identity);

impl MonitorScope<InstanceKind> for InstanceScope {
    fn scope_key(&self, resource: &Resource<InstanceKind>) -> Result<Option<String>, ReconcileError> {
        Ok((resource.name() == self.0.instance_id).then(|| resource.name().to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct MicroserviceScope(pub Identity);

impl MonitorScope<MicroserviceKind> for MicroserviceScope {
    fn scope_key(
        &self,
        resource: &Resource<MicroserviceKind>,
    ) -> Result<Option<String>, ReconcileError> {
        if !self.0.owns_instance(resource)?
            || !self.0.owns_area(resource, &resource.spec.functional_area)?
        {
            return Ok(None);
        }
        Ok(Some(resource.name().to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct ScriptScope(pub Identity);

impl MonitorScope<ScriptKind> for ScriptScope {
    fn scope_key(&self, resource: &Resource<ScriptKind>) -> Result<Option<String>, ReconcileError> {
        if !self.0.owns_instance(resource)? {
            return Ok(None);
        }
        required(resource, "scriptId", &resource.spec.script_id).map(|id| Some(id.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct ScriptVersionScope(pub Identity);

impl MonitorScope<ScriptVersionKind> for ScriptVersionScope {
    fn scope_key(
        &self,
        resource: &Resource<ScriptVersionKind>,
    ) -> Result<Option<String>, ReconcileError> {
        if !self.0.owns_instance(resource)? {
            return Ok(None);
        }
        let script = required(resource, "scriptId", &resource.spec.script_id)?;
        let version = required(resource, "versionId", &resource.spec.version_id)?;
        Ok(Some(format!("{script}:{version}")))
    }
}

#[derive(Debug, Clone)]
pub struct TenantEngineScope(pub Identity);

impl MonitorScope<TenantEngineKind> for TenantEngineScope {
    fn scope_key(
        &self,
        resource: &Resource<TenantEngineKind>,
    ) -> Result<Option<String>, ReconcileError> {
        if !self.0.owns_instance(resource)?
            || !self.0.owns_area(resource, &resource.spec.functional_area)?
        {
            return Ok(None);
        }
        let token = TenantToken::parse(&resource.spec.tenant).map_err(|e| ReconcileError::Invalid {
            resource: resource.key(),
            field: "tenant".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(token.to_string()))
    }
}

pub fn instance_monitor(identity: &Identity) -> ResourceMonitor<InstanceKind> {
    ResourceMonitor::new("instance", InstanceScope(identity.clone()))
}

pub fn microservice_monitor(identity: &Identity) -> ResourceMonitor<MicroserviceKind> {
    ResourceMonitor::new("microservice", MicroserviceScope(identity.clone()))
}

pub fn script_monitor(identity: &Identity) -> ResourceMonitor<ScriptKind> {
    ResourceMonitor::new("script", ScriptScope(identity.clone()))
}

pub fn script_version_monitor(identity: &Identity) -> ResourceMonitor<ScriptVersionKind> {
    ResourceMonitor::new("script-version", ScriptVersionScope(identity.clone()))
}

pub fn tenant_engine_monitor(identity: &Identity) -> ResourceMonitor<TenantEngineKind> {
    ResourceMonitor::new("tenant-engine", TenantEngineScope(identity.clone()))
}
