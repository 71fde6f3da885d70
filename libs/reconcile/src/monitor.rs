//! Generation-deduplicating resource monitor.
//!
//! A [`ResourceMonitor`] consumes CREATE/UPDATE/DELETE events for one kind,
//! keeps a cache keyed by a scope-specific key, and fans out typed callbacks
//! to registered listeners. UPDATE events whose generation is not newer than
//! the cached one are dropped, so status-only echoes from the store never
//! re-trigger business logic.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::error::ReconcileError;
use crate::resource::{ChangeType, LabelSelector, Resource, ResourceKind, WatchEvent};
use crate::store::ResourceStore;
use crate::DEFAULT_RESYNC_INTERVAL;

/// Decides which resources a monitor owns and how they are keyed.
pub trait MonitorScope<K: ResourceKind>: Send + Sync + 'static {
    /// `Ok(Some(key))` for owned resources, `Ok(None)` for resources outside
    /// this monitor's identity, `Err` for malformed resources.
    fn scope_key(&self, resource: &Resource<K>) -> Result<Option<String>, ReconcileError>;
}

impl<K, F> MonitorScope<K> for F
where
    K: ResourceKind,
    F: Fn(&Resource<K>) -> Result<Option<String>, ReconcileError> + Send + Sync + 'static,
{
    fn scope_key(&self, resource: &Resource<K>) -> Result<Option<String>, ReconcileError> {
        self(resource)
    }
}

/// Callbacks for resource changes.
///
/// Callbacks run on the monitor task and must not block; long work belongs on
/// a queue drained elsewhere.
pub trait ResourceListener<K: ResourceKind>: Send + Sync {
    fn on_created(&self, _resource: &Resource<K>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_updated(&self, _resource: &Resource<K>, _diff: &K::Diff) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_deleted(&self, _resource: &Resource<K>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// What [`ResourceMonitor::handle_event`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Listeners were invoked.
    Delivered { listeners: usize, failures: usize },
    /// The resource belongs to another identity.
    OutOfScope,
    /// The resource could not be keyed.
    Malformed,
    /// UPDATE with a generation that is not newer than the cached one, or
    /// DELETE for a key that was never cached.
    Unchanged,
}

/// Counts from one [`ResourceMonitor::resync`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
}

/// Where and how often a running monitor watches.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub namespace: String,
    pub selector: LabelSelector,
    pub resync_interval: Duration,
    /// Delay before re-establishing a failed watch.
    pub retry_backoff: Duration,
}

impl MonitorConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            selector: LabelSelector::everything(),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            retry_backoff: Duration::from_secs(5),
        }
    }

    pub fn with_selector(mut self, selector: LabelSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }
}

/// Monitor for one resource kind.
pub struct ResourceMonitor<K: ResourceKind> {
    name: String,
    scope: Box<dyn MonitorScope<K>>,
    cache: DashMap<String, Resource<K>>,
    listeners: RwLock<Vec<Arc<dyn ResourceListener<K>>>>,
}

impl<K: ResourceKind> ResourceMonitor<K> {
    pub fn new(name: impl Into<String>, scope: impl MonitorScope<K>) -> Self {
        Self {
            name: name.into(),
            scope: Box::new(scope),
            cache: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a listener. Listeners are invoked in registration order.
    pub fn register(&self, listener: Arc<dyn ResourceListener<K>>) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    /// Last cached revision for a scope key.
    pub fn cached(&self, key: &str) -> Option<Resource<K>> {
        self.cache.get(key).map(|r| r.value().clone())
    }

    pub fn cached_keys(&self) -> Vec<String> {
        self.cache.iter().map(|e| e.key().clone()).collect()
    }

    /// Process one event.
    pub fn handle_event(&self, event: WatchEvent<K>) -> Dispatch {
        let WatchEvent { change, resource } = event;

        let key = match self.scope.scope_key(&resource) {
            Ok(Some(key)) => key,
            Ok(None) => {
                debug!(monitor = %self.name, resource = %resource.key(), "Ignoring resource outside monitor scope");
                return Dispatch::OutOfScope;
            }
            Err(e) => {
                warn!(monitor = %self.name, kind = K::KIND, error = %e, "Skipping malformed resource");
                return Dispatch::Malformed;
            }
        };

        match change {
            ChangeType::Create => {
                self.cache.insert(key, resource.clone());
                self.fan_out(change, &resource, |l| l.on_created(&resource))
            }
            ChangeType::Update => {
                let previous = self.cache.get(&key).map(|r| r.value().clone());
                if let Some(previous) = &previous {
                    if resource.generation() <= previous.generation() {
                        // Same revision: keep the freshest status but do not deliver.
                        if resource.generation() == previous.generation()
                            && resource.metadata.resource_version
                                > previous.metadata.resource_version
                        {
                            self.cache.insert(key, resource.clone());
                        }
                        debug!(
                            monitor = %self.name,
                            resource = %resource.key(),
                            generation = resource.generation(),
                            "Dropping update without spec change"
                        );
                        return Dispatch::Unchanged;
                    }
                }

                let diff = K::diff(previous.as_ref().map(|p| &p.spec), &resource.spec);
                self.cache.insert(key, resource.clone());
                self.fan_out(change, &resource, |l| l.on_updated(&resource, &diff))
            }
            ChangeType::Delete => {
                if self.cache.remove(&key).is_none() {
                    debug!(
                        monitor = %self.name,
                        resource = %resource.key(),
                        "Dropping delete for unknown resource"
                    );
                    return Dispatch::Unchanged;
                }
                self.fan_out(change, &resource, |l| l.on_deleted(&resource))
            }
        }
    }

    fn fan_out(
        &self,
        change: ChangeType,
        resource: &Resource<K>,
        call: impl Fn(&dyn ResourceListener<K>) -> anyhow::Result<()>,
    ) -> Dispatch {
        let listeners: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        debug!(
            monitor = %self.name,
            change = %change,
            resource = %resource.key(),
            generation = resource.generation(),
            listeners = listeners.len(),
            "Dispatching resource change"
        );

        let mut failures = 0;
        for listener in &listeners {
            match catch_unwind(AssertUnwindSafe(|| call(listener.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(monitor = %self.name, change = %change, resource = %resource.key(), error = %e, "Listener failed");
                }
                Err(_) => {
                    failures += 1;
                    error!(monitor = %self.name, change = %change, resource = %resource.key(), "Listener panicked");
                }
            }
        }

        Dispatch::Delivered {
            listeners: listeners.len(),
            failures,
        }
    }

    /// Reconcile the cache against a full listing.
    ///
    /// Unknown resources are delivered as CREATE, known ones as UPDATE (and
    /// dropped when their generation has not moved), and cached keys absent
    /// from the listing as DELETE.
    pub fn resync(&self, resources: Vec<Resource<K>>) -> ResyncStats {
        let mut stats = ResyncStats::default();
        let mut seen = HashSet::new();

        for resource in resources {
            let key = match self.scope.scope_key(&resource) {
                Ok(Some(key)) => key,
                Ok(None) => continue,
                Err(e) => {
                    warn!(monitor = %self.name, kind = K::KIND, error = %e, "Skipping malformed resource");
                    stats.skipped += 1;
                    continue;
                }
            };
            seen.insert(key.clone());

            let event = if self.cache.contains_key(&key) {
                WatchEvent::updated(resource)
            } else {
                WatchEvent::created(resource)
            };
            let change = event.change;
            match (change, self.handle_event(event)) {
                (ChangeType::Create, Dispatch::Delivered { .. }) => stats.created += 1,
                (ChangeType::Update, Dispatch::Delivered { .. }) => stats.updated += 1,
                _ => stats.skipped += 1,
            }
        }

        let missing: Vec<Resource<K>> = self
            .cache
            .iter()
            .filter(|e| !seen.contains(e.key()))
            .map(|e| e.value().clone())
            .collect();
        for resource in missing {
            self.handle_event(WatchEvent::deleted(resource));
            stats.deleted += 1;
        }

        stats
    }

    /// Run the watch loop until shutdown.
    ///
    /// Lists once, then applies incremental events and re-lists every
    /// `resync_interval`. A closed or failed watch is re-established after
    /// `retry_backoff`.
    #[instrument(skip_all, fields(monitor = %self.name, kind = K::KIND, namespace = %config.namespace))]
    pub async fn run(
        self: Arc<Self>,
        store: Arc<dyn ResourceStore<K>>,
        config: MonitorConfig,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(resync_interval = ?config.resync_interval, "Resource monitor starting");

        let Some(mut events) = self.connect(store.as_ref(), &config, &mut shutdown).await else {
            info!("Resource monitor shutting down");
            return;
        };

        let period = if config.resync_interval.is_zero() {
            warn!(fallback = ?DEFAULT_RESYNC_INTERVAL, "Zero resync interval, using the default");
            DEFAULT_RESYNC_INTERVAL
        } else {
            config.resync_interval
        };
        let mut resync = tokio::time::interval(period);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately and the initial listing already ran.
        resync.tick().await;

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                event = events.recv() => match event {
                    Some(event) => {
                        self.handle_event(event);
                    }
                    None => {
                        warn!("Watch closed, re-establishing");
                        match self.connect(store.as_ref(), &config, &mut shutdown).await {
                            Some(rx) => events = rx,
                            None => break,
                        }
                    }
                },

                _ = resync.tick() => {
                    self.list_and_resync(store.as_ref(), &config).await;
                }
            }
        }

        info!("Resource monitor shutting down");
    }

    /// Open a watch and apply an initial listing. Returns `None` on shutdown.
    async fn connect(
        &self,
        store: &dyn ResourceStore<K>,
        config: &MonitorConfig,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<mpsc::UnboundedReceiver<WatchEvent<K>>> {
        loop {
            if *shutdown.borrow() {
                return None;
            }

            match store.watch(&config.namespace, &config.selector).await {
                Ok(rx) => {
                    self.list_and_resync(store, config).await;
                    return Some(rx);
                }
                Err(e) => {
                    error!(error = %e, "Failed to establish watch");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(config.retry_backoff) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    async fn list_and_resync(&self, store: &dyn ResourceStore<K>, config: &MonitorConfig) {
        match store.list(&config.namespace, &config.selector).await {
            Ok(resources) => {
                let stats = self.resync(resources);
                debug!(
                    created = stats.created,
                    updated = stats.updated,
                    deleted = stats.deleted,
                    skipped = stats.skipped,
                    "Resync complete"
                );
            }
            Err(e) => warn!(error = %e, "Resync listing failed"),
        }
    }
}

impl<K: ResourceKind> std::fmt::Debug for ResourceMonitor<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("name", &self.name)
            .field("kind", &K::KIND)
            .field("cached", &self.cache.len())
            .finish()
    }
}
