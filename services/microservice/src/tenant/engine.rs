use std::sync::Arc;

use chrono::Utc;
use stratum_id::TenantToken;
use stratum_lifecycle::{Component, ComponentStatus};
use stratum_reconcile::{update_status, Resource, ResourceStore, UpdateError, UpdatePolicy};
use thiserror::Error;

use crate::kinds::TenantEngineKind;
use crate::monitors::Identity;

/// What an engine needs from its host, handed over at construction.
#[derive(Clone)]
pub struct EngineContext {
    pub identity: Identity,
    pub token: TenantToken,
    namespace: String,
    resource_name: String,
    store: Arc<dyn ResourceStore<TenantEngineKind>>,
    update_policy: UpdatePolicy,
}

impl EngineContext {
    pub(crate) fn new(
        identity: Identity,
        token: TenantToken,
        resource: &Resource<TenantEngineKind>,
        store: Arc<dyn ResourceStore<TenantEngineKind>>,
        update_policy: UpdatePolicy,
    ) -> Self {
        Self {
            identity,
            token,
            namespace: resource.namespace().to_string(),
            resource_name: resource.name().to_string(),
            store,
            update_policy,
        }
    }

    /// Record on the tenant-engine resource that the tenant dataset exists.
    pub async fn mark_dataset_bootstrapped(&self) -> Result<(), UpdateError> {
        update_status::<TenantEngineKind, _, _>(
            self.store.as_ref(),
            &self.namespace,
            &self.resource_name,
            &self.update_policy,
            |status| {
                status.dataset_bootstrapped = true;
                status.last_transition = Some(Utc::now());
            },
        )
        .await
        .map(|_| ())
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("identity", &self.identity)
            .field("token", &self.token)
            .field("resource", &format_args!("{}/{}", self.namespace, self.resource_name))
            .finish()
    }
}

/// Builds the component tree for one tenant.
pub trait TenantEngineFactory: Send + Sync + 'static {
    fn create(
        &self,
        resource: &Resource<TenantEngineKind>,
        context: EngineContext,
    ) -> anyhow::Result<Arc<Component>>;
}

/// Why an engine landed in the failed bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineFailure {
    /// The factory, the token check or the initialize verb failed.
    Initialization(String),
    /// The start verb failed.
    Start(String),
}

impl EngineFailure {
    pub fn reason(&self) -> &str {
        match self {
            Self::Initialization(reason) | Self::Start(reason) => reason,
        }
    }
}

/// A tenant engine known to the manager.
#[derive(Debug)]
pub struct TenantEngine {
    token: TenantToken,
    component: Option<Arc<Component>>,
    resource: Resource<TenantEngineKind>,
    failure: Option<EngineFailure>,
}

impl TenantEngine {
    pub(crate) fn running(
        token: TenantToken,
        component: Arc<Component>,
        resource: Resource<TenantEngineKind>,
    ) -> Self {
        Self {
            token,
            component: Some(component),
            resource,
            failure: None,
        }
    }

    pub(crate) fn failed(
        token: TenantToken,
        component: Option<Arc<Component>>,
        resource: Resource<TenantEngineKind>,
        failure: EngineFailure,
    ) -> Self {
        Self {
            token,
            component,
            resource,
            failure: Some(failure),
        }
    }

    pub fn token(&self) -> &TenantToken {
        &self.token
    }

    /// The engine component; absent when the factory itself failed.
    pub fn component(&self) -> Option<&Arc<Component>> {
        self.component.as_ref()
    }

    /// Resource revision the engine was built from.
    pub fn resource(&self) -> &Resource<TenantEngineKind> {
        &self.resource
    }

    pub fn failure(&self) -> Option<&EngineFailure> {
        self.failure.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn status(&self) -> ComponentStatus {
        self.component
            .as_ref()
            .map(|c| c.status())
            .unwrap_or(ComponentStatus::InitializationError)
    }
}

/// Why a tenant engine cannot serve requests.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotAvailable {
    #[error("no tenant engine for tenant '{token}'")]
    NotFound { token: TenantToken },

    #[error("tenant engine for '{token}' failed to initialize: {reason}")]
    FailedInitialization { token: TenantToken, reason: String },

    #[error("tenant engine for '{token}' failed to start: {reason}")]
    FailedStart { token: TenantToken, reason: String },

    #[error("tenant engine for '{token}' has not started (status {status})")]
    NotStarted {
        token: TenantToken,
        status: ComponentStatus,
    },
}
