//! Standard tenant engine: provisions the tenant's topics and reports its
//! dataset as bootstrapped once running.

use std::sync::Arc;

use async_trait::async_trait;
use stratum_id::TenantToken;
use stratum_lifecycle::{
    Component, ComponentType, Lifecycle, LifecycleError, ProgressMonitor, TenantAware,
};
use stratum_reconcile::{ReadinessPolicy, Resource};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::kinds::TenantEngineKind;
use crate::messaging::{ensure_topic, TopicAdmin, TopicSpec};
use crate::tenant::{EngineContext, TenantEngineFactory};

/// Topics every tenant engine owns.
pub const TENANT_TOPICS: &[&str] = &["events", "commands"];

struct StandardEngine {
    context: EngineContext,
    topics: Arc<dyn TopicAdmin>,
    partitions: u32,
    replication: u16,
    readiness: ReadinessPolicy,
    cancel: CancellationToken,
}

impl TenantAware for StandardEngine {
    fn tenant_token(&self) -> &TenantToken {
        &self.context.token
    }
}

#[async_trait]
impl Lifecycle for StandardEngine {
    async fn initialize(
        &self,
        _component: &Component,
        monitor: &mut ProgressMonitor,
    ) -> Result<(), LifecycleError> {
        monitor.push_context(TENANT_TOPICS.len(), "Ensure tenant topics");
        for suffix in TENANT_TOPICS {
            let spec = TopicSpec::for_tenant(
                &self.context.identity,
                &self.context.token,
                suffix,
                self.partitions,
                self.replication,
            );
            monitor.start_progress(format!("Ensure topic {}", spec.name))?;
            let ready = ensure_topic(self.topics.as_ref(), &spec, &self.readiness, &self.cancel).await;
            if let Err(e) = ready {
                monitor.pop_context();
                return Err(LifecycleError::Internal(e.into()));
            }
            monitor.finish_progress();
        }
        monitor.pop_context();
        Ok(())
    }

    async fn start(
        &self,
        _component: &Component,
        _monitor: &mut ProgressMonitor,
    ) -> Result<(), LifecycleError> {
        self.context
            .mark_dataset_bootstrapped()
            .await
            .map_err(|e| LifecycleError::Internal(e.into()))?;
        info!(tenant = %self.context.token, "Tenant dataset bootstrapped");
        Ok(())
    }

    fn tenant_aware(&self) -> Option<&dyn TenantAware> {
        Some(self)
    }
}

/// Builds a [`StandardEngine`] per tenant.
pub struct StandardEngineFactory {
    topics: Arc<dyn TopicAdmin>,
    partitions: u32,
    replication: u16,
    readiness: ReadinessPolicy,
    cancel: CancellationToken,
}

impl StandardEngineFactory {
    pub fn new(
        topics: Arc<dyn TopicAdmin>,
        partitions: u32,
        replication: u16,
        readiness: ReadinessPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            topics,
            partitions,
            replication,
            readiness,
            cancel,
        }
    }
}

impl TenantEngineFactory for StandardEngineFactory {
    fn create(
        &self,
        resource: &Resource<TenantEngineKind>,
        context: EngineContext,
    ) -> anyhow::Result<Arc<Component>> {
        let name = format!("{} engine for {}", resource.spec.functional_area, context.token);
        Ok(Arc::new(Component::new(
            name,
            ComponentType::TenantEngine,
            StandardEngine {
                context,
                topics: Arc::clone(&self.topics),
                partitions: self.partitions,
                replication: self.replication,
                readiness: self.readiness,
                cancel: self.cancel.clone(),
            },
        )))
    }
}
