//! Resource store contract and an in-memory implementation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::error::StoreError;
use crate::resource::{LabelSelector, Resource, ResourceKind, WatchEvent};

/// Read, write and watch access to resources of one kind.
#[async_trait]
pub trait ResourceStore<K: ResourceKind>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Resource<K>>, StoreError>;

    async fn list(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Resource<K>>, StoreError>;

    /// Replace metadata labels and spec. Status is left untouched. Fails with
    /// [`StoreError::Conflict`] when `resource.metadata.resource_version` is
    /// stale.
    async fn replace(&self, resource: Resource<K>) -> Result<Resource<K>, StoreError>;

    /// Replace the status only. Same conflict rule as [`ResourceStore::replace`].
    async fn replace_status(&self, resource: Resource<K>) -> Result<Resource<K>, StoreError>;

    /// Subscribe to changes in `namespace` matching `selector`.
    async fn watch(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<mpsc::UnboundedReceiver<WatchEvent<K>>, StoreError>;
}

struct Watcher<K: ResourceKind> {
    namespace: String,
    selector: LabelSelector,
    tx: mpsc::UnboundedSender<WatchEvent<K>>,
}

/// In-memory store with generation and resource-version bookkeeping.
///
/// Generation is bumped whenever a write changes the spec; resource version is
/// bumped on every write. Watchers receive events synchronously with the
/// write.
pub struct InMemoryStore<K: ResourceKind> {
    objects: RwLock<BTreeMap<(String, String), Resource<K>>>,
    watchers: Mutex<Vec<Watcher<K>>>,
    next_version: AtomicU64,
}

impl<K: ResourceKind> Default for InMemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ResourceKind> InMemoryStore<K> {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            watchers: Mutex::new(Vec::new()),
            next_version: AtomicU64::new(1),
        }
    }

    fn bump_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }

    fn notify(&self, event: WatchEvent<K>) {
        let mut watchers = self
            .watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        watchers.retain(|w| {
            if w.namespace != event.resource.metadata.namespace
                || !w.selector.matches(&event.resource.metadata.labels)
            {
                return !w.tx.is_closed();
            }
            w.tx.send(event.clone()).is_ok()
        });
    }

    /// Insert a new resource at generation 1.
    pub async fn create(&self, mut resource: Resource<K>) -> Result<Resource<K>, StoreError> {
        let key = (
            resource.metadata.namespace.clone(),
            resource.metadata.name.clone(),
        );
        let mut objects = self.objects.write().await;
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: K::KIND,
                key: resource.key(),
            });
        }

        resource.metadata.generation = 1;
        resource.metadata.resource_version = self.bump_version();
        objects.insert(key, resource.clone());
        drop(objects);

        debug!(kind = K::KIND, key = %resource.key(), "Created resource");
        self.notify(WatchEvent::created(resource.clone()));
        Ok(resource)
    }

    /// Remove a resource, returning it if it existed.
    pub async fn delete(&self, namespace: &str, name: &str) -> Option<Resource<K>> {
        let removed = self
            .objects
            .write()
            .await
            .remove(&(namespace.to_string(), name.to_string()));
        if let Some(resource) = &removed {
            debug!(kind = K::KIND, key = %resource.key(), "Deleted resource");
            self.notify(WatchEvent::deleted(resource.clone()));
        }
        removed
    }

    /// Number of stored resources.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    async fn write(
        &self,
        resource: Resource<K>,
        apply: impl FnOnce(&mut Resource<K>, Resource<K>),
    ) -> Result<Resource<K>, StoreError> {
        let mut objects = self.objects.write().await;
        let key = (
            resource.metadata.namespace.clone(),
            resource.metadata.name.clone(),
        );
        let current = objects.get_mut(&key).ok_or_else(|| StoreError::NotFound {
            kind: K::KIND,
            key: resource.key(),
        })?;

        if current.metadata.resource_version != resource.metadata.resource_version {
            return Err(StoreError::Conflict {
                kind: K::KIND,
                key: resource.key(),
                expected: resource.metadata.resource_version,
                actual: current.metadata.resource_version,
            });
        }

        apply(current, resource);
        current.metadata.resource_version = self.bump_version();
        let updated = current.clone();
        drop(objects);

        self.notify(WatchEvent::updated(updated.clone()));
        Ok(updated)
    }
}

#[async_trait]
impl<K: ResourceKind> ResourceStore<K> for InMemoryStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Resource<K>>, StoreError> {
        Ok(self
            .objects
            .read()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Resource<K>>, StoreError> {
        Ok(self
            .objects
            .read()
            .await
            .values()
            .filter(|r| r.metadata.namespace == namespace && selector.matches(&r.metadata.labels))
            .cloned()
            .collect())
    }

    async fn replace(&self, resource: Resource<K>) -> Result<Resource<K>, StoreError> {
        self.write(resource, |current, incoming| {
            if current.spec != incoming.spec {
                current.metadata.generation += 1;
            }
            current.metadata.labels = incoming.metadata.labels;
            current.spec = incoming.spec;
        })
        .await
    }

    async fn replace_status(&self, resource: Resource<K>) -> Result<Resource<K>, StoreError> {
        self.write(resource, |current, incoming| {
            current.status = incoming.status;
        })
        .await
    }

    async fn watch(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<mpsc::UnboundedReceiver<WatchEvent<K>>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Watcher {
                namespace: namespace.to_string(),
                selector: selector.clone(),
                tx,
            });
        Ok(rx)
    }
}
