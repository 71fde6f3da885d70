use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use stratum_id::TenantToken;
use stratum_lifecycle::{provision, ComponentStatus, ProgressMonitor};
use stratum_reconcile::{
    update_status, wait_until, ReadinessError, ReadinessPolicy, Resource, ResourceListener,
    ResourceStore, SpecHash, UpdateError, UpdatePolicy,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::engine::{EngineContext, EngineFailure, NotAvailable, TenantEngine, TenantEngineFactory};
use crate::kinds::{ConfigurationDiff, TenantEngineKind};
use crate::monitors::Identity;

/// Tenant engine manager settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum tenant engine operations in flight.
    pub concurrency: usize,

    /// Policy for status writeback.
    pub update_policy: UpdatePolicy,

    /// Delay before retrying a shutdown that raced an in-flight start.
    pub requeue_delay: Duration,

    /// How long [`TenantEngineManager::shutdown`] waits for engines to stop.
    pub drain_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            update_policy: UpdatePolicy::default(),
            requeue_delay: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Tenant engine manager errors.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("no tenant engine for tenant '{0}'")]
    NotFound(TenantToken),

    #[error("tenant engine manager is not running")]
    NotRunning,

    #[error("tenant engine manager already started")]
    AlreadyStarted,

    #[error("tenant engines did not drain: {0}")]
    Drain(#[from] ReadinessError),
}

/// Bucket sizes at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub initializing: usize,
    pub initialized: usize,
    pub failed: usize,
    pub stopping: usize,
}

#[derive(Debug)]
struct ShutdownRequest {
    token: TenantToken,
    /// Resource to initialize from once stopped; `None` for a plain removal.
    restart: Option<Resource<TenantEngineKind>>,
}

struct Queues {
    init_rx: mpsc::UnboundedReceiver<Resource<TenantEngineKind>>,
    shutdown_rx: mpsc::UnboundedReceiver<ShutdownRequest>,
}

/// Builds, starts and stops one engine per tenant.
///
/// Requests arrive on two FIFO queues: initialization (fed by the
/// tenant-engine monitor on CREATE/UPDATE) and shutdown (DELETE, restarts).
/// A starter loop and a stopper loop drain them, running each item on a task
/// bounded by a shared semaphore. A token sits in at most one of
/// `initializing`, `initialized` and `failed`; claiming `initializing` (and
/// `stopping`) is an atomic insert-if-absent, so concurrent duplicates for the
/// same tenant are dropped.
///
/// Once [`TenantEngineManager::shutdown`] begins, queued initializations are
/// dropped and an initialization already in flight hands its engine straight
/// to the stopper when it finishes.
pub struct TenantEngineManager {
    identity: Identity,
    config: ManagerConfig,
    factory: Arc<dyn TenantEngineFactory>,
    store: Arc<dyn ResourceStore<TenantEngineKind>>,

    init_tx: mpsc::UnboundedSender<Resource<TenantEngineKind>>,
    shutdown_tx: mpsc::UnboundedSender<ShutdownRequest>,
    queues: Mutex<Option<Queues>>,
    permits: Arc<Semaphore>,

    initializing: DashMap<TenantToken, Instant>,
    initialized: DashMap<TenantToken, Arc<TenantEngine>>,
    failed: DashMap<TenantToken, Arc<TenantEngine>>,
    stopping: DashMap<TenantToken, Instant>,
    closing: AtomicBool,

    stop_tx: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl TenantEngineManager {
    pub fn new(
        identity: Identity,
        factory: Arc<dyn TenantEngineFactory>,
        store: Arc<dyn ResourceStore<TenantEngineKind>>,
        config: ManagerConfig,
    ) -> Self {
        let (init_tx, init_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));

        Self {
            identity,
            config,
            factory,
            store,
            init_tx,
            shutdown_tx,
            queues: Mutex::new(Some(Queues {
                init_rx,
                shutdown_rx,
            })),
            permits,
            initializing: DashMap::new(),
            initialized: DashMap::new(),
            failed: DashMap::new(),
            stopping: DashMap::new(),
            closing: AtomicBool::new(false),
            stop_tx,
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Spawn the starter and stopper loops.
    pub fn start(self: &Arc<Self>) -> Result<(), ManagerError> {
        let queues = self
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(ManagerError::AlreadyStarted)?;

        info!(
            instance = %self.identity.instance_id,
            functional_area = %self.identity.functional_area,
            concurrency = self.config.concurrency,
            "Starting tenant engine manager"
        );

        let starter = tokio::spawn(Arc::clone(self).starter_loop(queues.init_rx, self.stop_tx.subscribe()));
        let stopper = tokio::spawn(Arc::clone(self).stopper_loop(queues.shutdown_rx, self.stop_tx.subscribe()));
        self.loops
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend([starter, stopper]);
        Ok(())
    }

    // =========================================================================
    // Queues
    // =========================================================================

    /// Queue an initialization. Duplicates are resolved when dequeued.
    pub fn enqueue_initialization(
        &self,
        resource: Resource<TenantEngineKind>,
    ) -> Result<(), ManagerError> {
        if self.is_closing() {
            return Err(ManagerError::NotRunning);
        }
        debug!(tenant = %resource.spec.tenant, generation = resource.generation(), "Queueing tenant engine initialization");
        self.init_tx
            .send(resource)
            .map_err(|_| ManagerError::NotRunning)
    }

    fn enqueue_shutdown(&self, request: ShutdownRequest) -> Result<(), ManagerError> {
        debug!(tenant = %request.token, restart = request.restart.is_some(), "Queueing tenant engine shutdown");
        self.shutdown_tx
            .send(request)
            .map_err(|_| ManagerError::NotRunning)
    }

    async fn starter_loop(
        self: Arc<Self>,
        mut requests: mpsc::UnboundedReceiver<Resource<TenantEngineKind>>,
        mut stop: watch::Receiver<bool>,
    ) {
        info!("Tenant engine starter loop started");

        loop {
            let resource = tokio::select! {
                biased;

                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }

                request = requests.recv() => match request {
                    Some(resource) => resource,
                    None => break,
                },
            };

            if self.is_closing() {
                debug!(tenant = %resource.spec.tenant, "Manager shutting down, dropping queued initialization");
                continue;
            }

            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                break;
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.initialize_engine(resource).await;
                drop(permit);
            });
        }

        info!("Tenant engine starter loop stopped");
    }

    async fn stopper_loop(
        self: Arc<Self>,
        mut requests: mpsc::UnboundedReceiver<ShutdownRequest>,
        mut stop: watch::Receiver<bool>,
    ) {
        info!("Tenant engine stopper loop started");

        loop {
            let request = tokio::select! {
                biased;

                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }

                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                break;
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.stop_engine(request).await;
                drop(permit);
            });
        }

        info!("Tenant engine stopper loop stopped");
    }

    // =========================================================================
    // Workers
    // =========================================================================

    #[instrument(skip_all, fields(tenant = %resource.spec.tenant, generation = resource.generation()))]
    async fn initialize_engine(&self, resource: Resource<TenantEngineKind>) {
        let token = match TenantToken::parse(&resource.spec.tenant) {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Dropping tenant engine with invalid token");
                return;
            }
        };

        let claimed = match self.initializing.entry(token.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                true
            }
        };
        if !claimed {
            debug!("Initialization already in flight, dropping request");
            return;
        }

        // Checked after claiming: a finishing worker publishes to
        // `initialized` before releasing its claim.
        if self.initialized.contains_key(&token) {
            debug!("Tenant engine already running, dropping request");
            self.initializing.remove(&token);
            return;
        }
        if self.is_closing() {
            debug!("Manager shutting down, dropping request");
            self.initializing.remove(&token);
            return;
        }

        // A failed engine may still hold whatever its hooks acquired.
        if let Some(previous) = self.failed.get(&token).map(|e| Arc::clone(e.value())) {
            info!("Tearing down failed tenant engine before rebuilding");
            self.teardown(&token, &previous).await;
        }

        let engine = Arc::new(self.bring_up(&token, resource).await);
        if engine.is_failed() {
            self.failed.insert(token.clone(), Arc::clone(&engine));
        } else {
            self.initialized.insert(token.clone(), Arc::clone(&engine));
            self.failed.remove(&token);
        }

        self.write_status(
            engine.resource(),
            engine.status(),
            SpecHash::of(&engine.resource().spec.configuration),
            engine.failure().map(|f| f.reason().to_string()),
        )
        .await;

        // Released after the status write so a racing stop defers until the
        // final state is stored.
        self.initializing.remove(&token);

        // Published above before reading the flag: either `remove_all` saw
        // this engine or this worker sees the shutdown.
        if self.is_closing() {
            info!("Manager shut down during initialization, stopping engine");
            if let Err(e) = self.enqueue_shutdown(ShutdownRequest {
                token,
                restart: None,
            }) {
                warn!(error = %e, "Failed to queue tenant engine shutdown");
            }
        }
    }

    async fn bring_up(&self, token: &TenantToken, resource: Resource<TenantEngineKind>) -> TenantEngine {
        let context = EngineContext::new(
            self.identity.clone(),
            token.clone(),
            &resource,
            Arc::clone(&self.store),
            self.config.update_policy,
        );

        let component = match self.factory.create(&resource, context) {
            Ok(component) => component,
            Err(e) => {
                error!(error = %e, "Failed to build tenant engine");
                let failure = EngineFailure::Initialization(format!("{e:#}"));
                return TenantEngine::failed(token.clone(), None, resource, failure);
            }
        };

        if let Some(served) = component.tenant_token() {
            if served != token {
                let reason = format!("engine component serves tenant '{served}'");
                error!(%reason, "Tenant engine token mismatch");
                let failure = EngineFailure::Initialization(reason);
                return TenantEngine::failed(token.clone(), Some(component), resource, failure);
            }
        }

        info!(component = %component.name(), "Provisioning tenant engine");
        let mut monitor = ProgressMonitor::new(format!("tenant engine {token}"));
        match provision(Arc::clone(&component), &mut monitor).await {
            Ok(status) => {
                info!(status = %status, "Tenant engine started");
                TenantEngine::running(token.clone(), component, resource)
            }
            Err(e) => {
                let status = component.status();
                let reason = component
                    .last_error()
                    .map(|cause| cause.to_string())
                    .unwrap_or_else(|| e.to_string());
                error!(status = %status, error = %e, "Tenant engine failed");

                let failure = if status == ComponentStatus::InitializationError {
                    EngineFailure::Initialization(reason)
                } else {
                    EngineFailure::Start(reason)
                };
                TenantEngine::failed(token.clone(), Some(component), resource, failure)
            }
        }
    }

    #[instrument(skip_all, fields(tenant = %request.token, restart = request.restart.is_some()))]
    async fn stop_engine(&self, request: ShutdownRequest) {
        let ShutdownRequest { token, restart } = request;

        if self.initializing.contains_key(&token) {
            debug!(delay = ?self.config.requeue_delay, "Tenant engine still starting, deferring shutdown");
            tokio::time::sleep(self.config.requeue_delay).await;
            if let Err(e) = self.enqueue_shutdown(ShutdownRequest { token, restart }) {
                warn!(error = %e, "Failed to requeue tenant engine shutdown");
            }
            return;
        }

        let claimed = match self.stopping.entry(token.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                true
            }
        };
        if !claimed {
            debug!("Shutdown already in flight, dropping request");
            return;
        }

        let engine = self
            .initialized
            .get(&token)
            .map(|e| Arc::clone(e.value()))
            .or_else(|| self.failed.get(&token).map(|e| Arc::clone(e.value())));

        let final_status = match &engine {
            Some(engine) => self.teardown(&token, engine).await,
            None => {
                debug!("No tenant engine to stop");
                None
            }
        };

        self.initialized.remove(&token);
        self.failed.remove(&token);

        if let (Some(engine), Some(status)) = (&engine, final_status) {
            self.write_status(engine.resource(), status, None, None).await;
        }
        // Held until the final status is stored so a drain covers the write.
        self.stopping.remove(&token);

        if let Some(resource) = restart {
            if self.is_closing() {
                debug!("Manager shutting down, skipping restart");
                return;
            }
            info!("Restarting tenant engine");
            if let Err(e) = self.enqueue_initialization(resource) {
                warn!(error = %e, "Failed to requeue tenant engine initialization");
            }
        }
    }

    /// Stop then terminate the engine's component, if it has one. Returns the
    /// final component status.
    async fn teardown(&self, token: &TenantToken, engine: &TenantEngine) -> Option<ComponentStatus> {
        let component = engine.component()?;
        let mut monitor = ProgressMonitor::new(format!("tenant engine {token} shutdown"));

        let stopped = component.lifecycle_stop(&mut monitor).await;
        if stopped.is_error() {
            warn!(status = %stopped, "Tenant engine did not stop cleanly");
        }
        let terminated = component.lifecycle_terminate(&mut monitor).await;
        if terminated.is_error() {
            let cause = component.last_error().map(|e| e.to_string());
            warn!(status = %terminated, error = ?cause, "Tenant engine did not terminate cleanly");
        } else {
            info!("Tenant engine terminated");
        }
        Some(terminated)
    }

    async fn write_status(
        &self,
        resource: &Resource<TenantEngineKind>,
        state: ComponentStatus,
        configuration_hash: Option<SpecHash>,
        message: Option<String>,
    ) {
        let result = update_status::<TenantEngineKind, _, _>(
            self.store.as_ref(),
            resource.namespace(),
            resource.name(),
            &self.config.update_policy,
            |status| {
                status.state = Some(state);
                status.configuration_hash = configuration_hash.clone();
                status.message = message.clone();
                status.last_transition = Some(Utc::now());
            },
        )
        .await;

        match result {
            Ok(_) => debug!(state = %state, "Tenant engine status written"),
            Err(UpdateError::NotFound { .. }) => {
                debug!("Tenant engine resource is gone, skipping status write")
            }
            Err(e) => warn!(error = %e, "Failed to write tenant engine status"),
        }
    }

    // =========================================================================
    // Queries and commands
    // =========================================================================

    /// The engine for `token`, running or failed.
    pub fn get_by_token(&self, token: &TenantToken) -> Option<Arc<TenantEngine>> {
        self.initialized
            .get(token)
            .map(|e| Arc::clone(e.value()))
            .or_else(|| self.failed.get(token).map(|e| Arc::clone(e.value())))
    }

    /// The engine for `token` if its status is exactly `Started`, otherwise
    /// why not. A degraded engine (`StartedWithErrors`) is not served.
    pub fn assure_available(&self, token: &TenantToken) -> Result<Arc<TenantEngine>, NotAvailable> {
        if let Some(engine) = self.initialized.get(token).map(|e| Arc::clone(e.value())) {
            let status = engine.status();
            if status == ComponentStatus::Started {
                return Ok(engine);
            }
            return Err(NotAvailable::NotStarted {
                token: token.clone(),
                status,
            });
        }

        if let Some(engine) = self.failed.get(token).map(|e| Arc::clone(e.value())) {
            return Err(match engine.failure() {
                Some(EngineFailure::Start(reason)) => NotAvailable::FailedStart {
                    token: token.clone(),
                    reason: reason.clone(),
                },
                Some(EngineFailure::Initialization(reason)) => NotAvailable::FailedInitialization {
                    token: token.clone(),
                    reason: reason.clone(),
                },
                None => NotAvailable::NotStarted {
                    token: token.clone(),
                    status: engine.status(),
                },
            });
        }

        if self.initializing.contains_key(token) {
            return Err(NotAvailable::NotStarted {
                token: token.clone(),
                status: ComponentStatus::Starting,
            });
        }

        Err(NotAvailable::NotFound {
            token: token.clone(),
        })
    }

    /// Stop the engine for `token` and build it again from the same resource.
    pub fn restart(&self, token: &TenantToken) -> Result<(), ManagerError> {
        let engine = self
            .get_by_token(token)
            .ok_or_else(|| ManagerError::NotFound(token.clone()))?;
        self.enqueue_shutdown(ShutdownRequest {
            token: token.clone(),
            restart: Some(engine.resource().clone()),
        })
    }

    /// Restart every known engine. Returns how many were queued.
    pub fn restart_all(&self) -> usize {
        self.known_tokens()
            .iter()
            .filter(|token| self.restart(token).is_ok())
            .count()
    }

    /// Stop every known engine. Returns how many were queued.
    pub fn remove_all(&self) -> usize {
        self.known_tokens()
            .into_iter()
            .filter(|token| {
                self.enqueue_shutdown(ShutdownRequest {
                    token: token.clone(),
                    restart: None,
                })
                .is_ok()
            })
            .count()
    }

    fn known_tokens(&self) -> Vec<TenantToken> {
        self.initialized
            .iter()
            .map(|e| e.key().clone())
            .chain(self.failed.iter().map(|e| e.key().clone()))
            .collect()
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            initializing: self.initializing.len(),
            initialized: self.initialized.len(),
            failed: self.failed.len(),
            stopping: self.stopping.len(),
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn is_drained(&self) -> bool {
        self.stats() == ManagerStats::default()
    }

    /// Wait until the engine for `token` reports its dataset as bootstrapped.
    pub async fn wait_for_dataset_bootstrap(
        &self,
        token: &TenantToken,
        policy: &ReadinessPolicy,
        cancel: &CancellationToken,
    ) -> Result<(), ReadinessError> {
        let what = format!("dataset bootstrap for tenant {token}");
        wait_until(&what, policy, cancel, move || async move {
            let Some(engine) = self.get_by_token(token) else {
                return Ok(false);
            };
            let resource = engine.resource();
            let current = self.store.get(resource.namespace(), resource.name()).await?;
            Ok(current
                .and_then(|r| r.status)
                .is_some_and(|s| s.dataset_bootstrapped))
        })
        .await
    }

    /// Stop every engine, then the loops.
    ///
    /// New and queued initializations are refused from here on; one already
    /// in flight is stopped as soon as it finishes.
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        self.closing.store(true, Ordering::SeqCst);
        let queued = self.remove_all();
        info!(engines = queued, "Shutting down tenant engine manager");

        let policy = ReadinessPolicy {
            interval: Duration::from_millis(50),
            deadline: Some(self.config.drain_timeout),
        };
        let drained = wait_until("tenant engines drained", &policy, &CancellationToken::new(), move || async move {
            Ok(self.is_drained())
        })
        .await;

        self.stop_tx.send_replace(true);
        let loops: Vec<_> = std::mem::take(
            &mut *self.loops.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for handle in loops {
            if let Err(e) = handle.await {
                error!(error = %e, "Tenant engine loop panicked");
            }
        }

        drained.map_err(ManagerError::from)
    }
}

impl ResourceListener<TenantEngineKind> for TenantEngineManager {
    fn on_created(&self, resource: &Resource<TenantEngineKind>) -> anyhow::Result<()> {
        self.enqueue_initialization(resource.clone())?;
        Ok(())
    }

    fn on_updated(
        &self,
        resource: &Resource<TenantEngineKind>,
        diff: &ConfigurationDiff,
    ) -> anyhow::Result<()> {
        let token = TenantToken::parse(&resource.spec.tenant)?;

        let running_differs = self.initialized.get(&token).is_some_and(|engine| {
            SpecHash::of(&engine.resource().spec.configuration)
                != SpecHash::of(&resource.spec.configuration)
        });
        if diff.configuration_changed && running_differs {
            info!(tenant = %token, "Tenant engine configuration changed, restarting");
            self.enqueue_shutdown(ShutdownRequest {
                token,
                restart: Some(resource.clone()),
            })?;
        }

        self.enqueue_initialization(resource.clone())?;
        Ok(())
    }

    fn on_deleted(&self, resource: &Resource<TenantEngineKind>) -> anyhow::Result<()> {
        let token = TenantToken::parse(&resource.spec.tenant)?;
        self.enqueue_shutdown(ShutdownRequest {
            token,
            restart: None,
        })?;
        Ok(())
    }
}

impl std::fmt::Debug for TenantEngineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantEngineManager")
            .field("identity", &self.identity)
            .field("stats", &self.stats())
            .finish()
    }
}
