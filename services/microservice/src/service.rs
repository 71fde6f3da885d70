//! The microservice host component.
//!
//! Initialize ensures the area's topics are ready; start brings up the tenant
//! engine manager and the five resource monitors; stop tears them down in
//! reverse order.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use stratum_lifecycle::{Component, ComponentType, Lifecycle, LifecycleError, ProgressMonitor};
use stratum_reconcile::{
    MonitorConfig, Resource, ResourceKind, ResourceListener, ResourceMonitor, ResourceStore,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::kinds::{InstanceKind, MicroserviceKind, ScriptKind, ScriptVersionKind, TenantEngineKind};
use crate::messaging::{ensure_topic, TopicAdmin, TopicSpec};
use crate::monitors::{
    instance_monitor, microservice_monitor, script_monitor, script_version_monitor,
    tenant_engine_monitor,
};
use crate::tenant::{TenantEngineFactory, TenantEngineManager};

/// Topics every functional area publishes to.
pub const AREA_TOPICS: &[&str] = &["inbound-events", "outbound-events", "failed-events"];

/// Stores for every watched kind.
#[derive(Clone)]
pub struct Stores {
    pub instances: Arc<dyn ResourceStore<InstanceKind>>,
    pub microservices: Arc<dyn ResourceStore<MicroserviceKind>>,
    pub scripts: Arc<dyn ResourceStore<ScriptKind>>,
    pub script_versions: Arc<dyn ResourceStore<ScriptVersionKind>>,
    pub tenant_engines: Arc<dyn ResourceStore<TenantEngineKind>>,
}

/// Logs every delivered change. Registered on the monitors whose consumers
/// live outside this process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeLog;

impl<K: ResourceKind> ResourceListener<K> for ChangeLog {
    fn on_created(&self, resource: &Resource<K>) -> anyhow::Result<()> {
        info!(kind = K::KIND, resource = %resource.key(), generation = resource.generation(), "Resource created");
        Ok(())
    }

    fn on_updated(&self, resource: &Resource<K>, diff: &K::Diff) -> anyhow::Result<()> {
        info!(kind = K::KIND, resource = %resource.key(), generation = resource.generation(), diff = ?diff, "Resource updated");
        Ok(())
    }

    fn on_deleted(&self, resource: &Resource<K>) -> anyhow::Result<()> {
        info!(kind = K::KIND, resource = %resource.key(), "Resource deleted");
        Ok(())
    }
}

/// The five monitors of one host.
pub struct Monitors {
    pub instance: Arc<ResourceMonitor<InstanceKind>>,
    pub microservice: Arc<ResourceMonitor<MicroserviceKind>>,
    pub script: Arc<ResourceMonitor<ScriptKind>>,
    pub script_version: Arc<ResourceMonitor<ScriptVersionKind>>,
    pub tenant_engine: Arc<ResourceMonitor<TenantEngineKind>>,
}

/// Lifecycle behavior of a microservice process.
pub struct MicroserviceHost {
    config: Config,
    stores: Stores,
    monitors: Monitors,
    manager: Arc<TenantEngineManager>,
    topics: Arc<dyn TopicAdmin>,
    cancel: CancellationToken,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MicroserviceHost {
    pub fn new(
        config: Config,
        stores: Stores,
        factory: Arc<dyn TenantEngineFactory>,
        topics: Arc<dyn TopicAdmin>,
    ) -> Self {
        let identity = config.identity();
        let manager = Arc::new(TenantEngineManager::new(
            identity.clone(),
            factory,
            Arc::clone(&stores.tenant_engines),
            config.manager_config(),
        ));

        let monitors = Monitors {
            instance: Arc::new(instance_monitor(&identity)),
            microservice: Arc::new(microservice_monitor(&identity)),
            script: Arc::new(script_monitor(&identity)),
            script_version: Arc::new(script_version_monitor(&identity)),
            tenant_engine: Arc::new(tenant_engine_monitor(&identity)),
        };
        monitors.instance.register(Arc::new(ChangeLog));
        monitors.microservice.register(Arc::new(ChangeLog));
        monitors.script.register(Arc::new(ChangeLog));
        monitors.script_version.register(Arc::new(ChangeLog));
        monitors.tenant_engine.register(Arc::clone(&manager) as Arc<dyn ResourceListener<TenantEngineKind>>);

        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            stores,
            monitors,
            manager,
            topics,
            cancel: CancellationToken::new(),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn manager(&self) -> Arc<TenantEngineManager> {
        Arc::clone(&self.manager)
    }

    pub fn monitors(&self) -> &Monitors {
        &self.monitors
    }

    /// Cancels readiness waits in progress.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Build the host and wrap it in a component named after its area.
    pub fn into_component(self) -> Arc<Component> {
        let name = format!("{} microservice", self.config.functional_area);
        Arc::new(Component::new(name, ComponentType::Microservice, self))
    }

    fn spawn_monitor<K: ResourceKind>(
        &self,
        monitor: &Arc<ResourceMonitor<K>>,
        store: &Arc<dyn ResourceStore<K>>,
        config: MonitorConfig,
    ) {
        let handle = tokio::spawn(Arc::clone(monitor).run(
            Arc::clone(store),
            config,
            self.shutdown_tx.subscribe(),
        ));
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
    }
}

#[async_trait]
impl Lifecycle for MicroserviceHost {
    async fn initialize(
        &self,
        _component: &Component,
        monitor: &mut ProgressMonitor,
    ) -> Result<(), LifecycleError> {
        let identity = self.config.identity();
        let policy = self.config.readiness_policy();

        monitor.push_context(AREA_TOPICS.len(), "Ensure topics");
        for suffix in AREA_TOPICS {
            let spec = TopicSpec::for_area(
                &identity,
                suffix,
                self.config.topic_partitions,
                self.config.topic_replication,
            );
            monitor.start_progress(format!("Ensure topic {}", spec.name))?;
            if let Err(e) = ensure_topic(self.topics.as_ref(), &spec, &policy, &self.cancel).await {
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
        monitor: &mut ProgressMonitor,
    ) -> Result<(), LifecycleError> {
        monitor.push_context(2, "Start microservice");

        monitor.start_progress("Start tenant engine manager")?;
        self.manager
            .start()
            .map_err(|e| LifecycleError::Internal(e.into()))?;
        monitor.finish_progress();

        monitor.start_progress("Start resource monitors")?;
        let base = self.config.monitor_config();
        let scoped = base.clone().with_selector(self.config.identity().instance_selector());
        self.spawn_monitor(&self.monitors.instance, &self.stores.instances, base);
        self.spawn_monitor(&self.monitors.microservice, &self.stores.microservices, scoped.clone());
        self.spawn_monitor(&self.monitors.script, &self.stores.scripts, scoped.clone());
        self.spawn_monitor(&self.monitors.script_version, &self.stores.script_versions, scoped.clone());
        self.spawn_monitor(&self.monitors.tenant_engine, &self.stores.tenant_engines, scoped);
        monitor.finish_progress();

        monitor.pop_context();
        Ok(())
    }

    async fn stop(
        &self,
        _component: &Component,
        monitor: &mut ProgressMonitor,
    ) -> Result<(), LifecycleError> {
        monitor.push_context(2, "Stop microservice");

        monitor.start_progress("Stop resource monitors")?;
        self.shutdown_tx.send_replace(true);
        let tasks: Vec<_> = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Resource monitor task panicked");
            }
        }
        monitor.finish_progress();

        monitor.start_progress("Stop tenant engines")?;
        let result = self.manager.shutdown().await;
        monitor.finish_progress();
        monitor.pop_context();

        result.map_err(|e| LifecycleError::Internal(e.into()))
    }

    async fn terminate(
        &self,
        _component: &Component,
        _monitor: &mut ProgressMonitor,
    ) -> Result<(), LifecycleError> {
        self.cancel.cancel();
        Ok(())
    }
}
