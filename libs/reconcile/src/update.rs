//! Optimistic-concurrency updates.
//!
//! Each attempt reloads the resource, applies the caller's mutation and
//! writes it back. Conflicting writes are retried after a fixed backoff; any
//! other error is returned immediately.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{StoreError, UpdateError};
use crate::resource::{Resource, ResourceKind};
use crate::store::ResourceStore;
use crate::DEFAULT_UPDATE_BACKOFF;

/// Retry policy for [`update_spec`] and [`update_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdatePolicy {
    /// Sleep between conflicting attempts.
    pub backoff: Duration,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_UPDATE_BACKOFF,
        }
    }
}

/// Reload, mutate and replace the spec of `namespace/name` until the write
/// does not conflict.
pub async fn update_spec<K, S, F>(
    store: &S,
    namespace: &str,
    name: &str,
    policy: &UpdatePolicy,
    mut mutate: F,
) -> Result<Resource<K>, UpdateError>
where
    K: ResourceKind,
    S: ResourceStore<K> + ?Sized,
    F: FnMut(&mut Resource<K>) + Send,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let mut resource = reload(store, namespace, name).await?;
        mutate(&mut resource);

        match store.replace(resource).await {
            Ok(updated) => {
                debug!(kind = K::KIND, namespace, name, attempt, generation = updated.generation(), "Spec updated");
                return Ok(updated);
            }
            Err(e) => backoff_on_conflict::<K>(e, namespace, name, attempt, policy).await?,
        }
    }
}

/// Reload, mutate and replace the status of `namespace/name` until the write
/// does not conflict. A missing status starts from `K::Status::default()`.
pub async fn update_status<K, S, F>(
    store: &S,
    namespace: &str,
    name: &str,
    policy: &UpdatePolicy,
    mut mutate: F,
) -> Result<Resource<K>, UpdateError>
where
    K: ResourceKind,
    S: ResourceStore<K> + ?Sized,
    F: FnMut(&mut K::Status) + Send,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let mut resource = reload(store, namespace, name).await?;
        mutate(resource.status.get_or_insert_with(K::Status::default));

        match store.replace_status(resource).await {
            Ok(updated) => {
                debug!(kind = K::KIND, namespace, name, attempt, "Status updated");
                return Ok(updated);
            }
            Err(e) => backoff_on_conflict::<K>(e, namespace, name, attempt, policy).await?,
        }
    }
}

async fn reload<K, S>(store: &S, namespace: &str, name: &str) -> Result<Resource<K>, UpdateError>
where
    K: ResourceKind,
    S: ResourceStore<K> + ?Sized,
{
    store
        .get(namespace, name)
        .await?
        .ok_or_else(|| UpdateError::NotFound {
            kind: K::KIND,
            key: format!("{namespace}/{name}"),
        })
}

async fn backoff_on_conflict<K: ResourceKind>(
    error: StoreError,
    namespace: &str,
    name: &str,
    attempt: u32,
    policy: &UpdatePolicy,
) -> Result<(), UpdateError> {
    if !error.is_conflict() {
        return Err(error.into());
    }
    warn!(
        kind = K::KIND,
        namespace,
        name,
        attempt,
        backoff = ?policy.backoff,
        "Conflicting write, retrying"
    );
    tokio::time::sleep(policy.backoff).await;
    Ok(())
}
