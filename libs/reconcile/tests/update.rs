//! Integration tests for conflict-retrying spec and status updates.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use rstest::rstest;
use serde::{Deserialize, Serialize};
use stratum_reconcile::{
    update_spec, update_status, InMemoryStore, LabelSelector, Resource, ResourceKind,
    ResourceStore, StoreError, UpdateError, UpdatePolicy, WatchEvent,
};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
struct Engine;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct EngineStatus {
    state: String,
    restarts: u32,
}

impl ResourceKind for Engine {
    const KIND: &'static str = "engine";
    type Spec = String;
    type Status = EngineStatus;
    type Diff = ();

    fn diff(_: Option<&String>, _: &String) {}
}

/// What the wrapper does to the first few writes.
#[derive(Debug, Clone, Copy)]
enum Inject {
    Conflicts(u32),
    Unavailable,
}

/// Wraps an [`InMemoryStore`] and fails writes according to [`Inject`].
struct FaultyStore {
    inner: InMemoryStore<Engine>,
    inject: Inject,
    writes: AtomicU32,
}

impl FaultyStore {
    fn new(inject: Inject) -> Self {
        Self {
            inner: InMemoryStore::new(),
            inject,
            writes: AtomicU32::new(0),
        }
    }

    fn fault(&self, resource: &Resource<Engine>) -> Option<StoreError> {
        let n = self.writes.fetch_add(1, Ordering::SeqCst);
        match self.inject {
            Inject::Conflicts(k) if n < k => Some(StoreError::Conflict {
                kind: Engine::KIND,
                key: resource.key(),
                expected: resource.metadata.resource_version,
                actual: resource.metadata.resource_version + 1,
            }),
            Inject::Conflicts(_) => None,
            Inject::Unavailable => Some(StoreError::Unavailable("connection reset".to_string())),
        }
    }
}

#[async_trait]
impl ResourceStore<Engine> for FaultyStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Resource<Engine>>, StoreError> {
        self.inner.get(namespace, name).await
    }

    async fn list(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Resource<Engine>>, StoreError> {
        self.inner.list(namespace, selector).await
    }

    async fn replace(&self, resource: Resource<Engine>) -> Result<Resource<Engine>, StoreError> {
        match self.fault(&resource) {
            Some(e) => Err(e),
            None => self.inner.replace(resource).await,
        }
    }

    async fn replace_status(
        &self,
        resource: Resource<Engine>,
    ) -> Result<Resource<Engine>, StoreError> {
        match self.fault(&resource) {
            Some(e) => Err(e),
            None => self.inner.replace_status(resource).await,
        }
    }

    async fn watch(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<mpsc::UnboundedReceiver<WatchEvent<Engine>>, StoreError> {
        self.inner.watch(namespace, selector).await
    }
}

fn fast() -> UpdatePolicy {
    UpdatePolicy {
        backoff: Duration::from_millis(1),
    }
}

async fn seeded(inject: Inject) -> FaultyStore {
    let store = FaultyStore::new(inject);
    store
        .inner
        .create(Resource::new("tenants", "acme", "v1".to_string()))
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn test_status_update_retries_two_conflicts() {
    let store = seeded(Inject::Conflicts(2)).await;
    let invocations = AtomicU32::new(0);

    let updated = update_status::<Engine, _, _>(&store, "tenants", "acme", &fast(), |status: &mut EngineStatus| {
        invocations.fetch_add(1, Ordering::SeqCst);
        status.state = "started".to_string();
        status.restarts += 1;
    })
    .await
    .unwrap();

    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    let status = updated.status.unwrap();
    assert_eq!(status.state, "started");
    // Each attempt starts from a fresh reload, so the increment lands once.
    assert_eq!(status.restarts, 1);
}

#[rstest]
#[case::status(true)]
#[case::spec(false)]
#[tokio::test]
async fn test_non_conflict_error_is_not_retried(#[case] status: bool) {
    let store = seeded(Inject::Unavailable).await;
    let invocations = AtomicU32::new(0);

    let result = if status {
        update_status::<Engine, _, _>(&store, "tenants", "acme", &fast(), |_: &mut EngineStatus| {
            invocations.fetch_add(1, Ordering::SeqCst);
        })
        .await
    } else {
        update_spec::<Engine, _, _>(&store, "tenants", "acme", &fast(), |r: &mut Resource<Engine>| {
            invocations.fetch_add(1, Ordering::SeqCst);
            r.spec = "v2".to_string();
        })
        .await
    };

    assert!(matches!(result, Err(UpdateError::Store(StoreError::Unavailable(_)))));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missing_resource_is_not_found() {
    let store = Arc::new(InMemoryStore::<Engine>::new());
    let err = update_status::<Engine, _, _>(store.as_ref(), "tenants", "ghost", &fast(), |_: &mut EngineStatus| {})
        .await
        .unwrap_err();
    assert!(matches!(err, UpdateError::NotFound { .. }));
}

#[tokio::test]
async fn test_spec_update_bumps_generation() {
    let store = seeded(Inject::Conflicts(1)).await;
    let updated = update_spec::<Engine, _, _>(&store, "tenants", "acme", &fast(), |r: &mut Resource<Engine>| {
        r.spec = "v2".to_string();
    })
    .await
    .unwrap();

    assert_eq!(updated.spec, "v2");
    assert_eq!(updated.generation(), 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_update_converges_after_k_conflicts(k in 0u32..6) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let (attempts, updated) = runtime.block_on(async {
            let store = seeded(Inject::Conflicts(k)).await;
            let attempts = AtomicU32::new(0);
            let updated = update_status::<Engine, _, _>(&store, "tenants", "acme", &fast(), |s: &mut EngineStatus| {
                attempts.fetch_add(1, Ordering::SeqCst);
                s.state = "ready".to_string();
            })
            .await;
            (attempts.into_inner(), updated)
        });

        prop_assert_eq!(attempts, k + 1);
        let updated = updated.unwrap();
        prop_assert_eq!(updated.status.map(|s| s.state), Some("ready".to_string()));
    }
}
