//! End-to-end test of the microservice host component against in-memory
//! stores and topic admin.

use std::sync::Arc;
use std::time::Duration;

use stratum_id::TenantToken;
use stratum_lifecycle::{provision, ComponentStatus, ProgressMonitor};
use stratum_microservice::config::Config;
use stratum_microservice::engine::{StandardEngineFactory, TENANT_TOPICS};
use stratum_microservice::kinds::{
    InstanceKind, MicroserviceKind, ScriptKind, ScriptVersionKind, TenantEngineKind,
    TenantEngineSpec, LABEL_INSTANCE,
};
use stratum_microservice::messaging::InMemoryTopicAdmin;
use stratum_microservice::service::{MicroserviceHost, Stores, AREA_TOPICS};
use stratum_reconcile::{InMemoryStore, ReadinessPolicy, Resource, ResourceStore};
use tokio_util::sync::CancellationToken;

fn config() -> Config {
    Config {
        instance_id: "prod".to_string(),
        functional_area: "event-sources".to_string(),
        update_backoff_ms: 1,
        ..Config::default()
    }
}

fn tenant_engine(tenant: &str, instance: &str) -> Resource<TenantEngineKind> {
    Resource::new(
        "default",
        format!("{tenant}-event-sources"),
        TenantEngineSpec {
            tenant: tenant.to_string(),
            functional_area: "event-sources".to_string(),
            configuration: serde_json::json!({"sources": ["mqtt"]}),
        },
    )
    .with_label(LABEL_INSTANCE, instance)
}

#[tokio::test]
async fn test_host_runs_tenant_engines_from_resources() {
    let engines = Arc::new(InMemoryStore::<TenantEngineKind>::new());
    let stores = Stores {
        instances: Arc::new(InMemoryStore::<InstanceKind>::new()),
        microservices: Arc::new(InMemoryStore::<MicroserviceKind>::new()),
        scripts: Arc::new(InMemoryStore::<ScriptKind>::new()),
        script_versions: Arc::new(InMemoryStore::<ScriptVersionKind>::new()),
        tenant_engines: engines.clone(),
    };
    let topics = Arc::new(InMemoryTopicAdmin::new());
    let factory = Arc::new(StandardEngineFactory::new(
        topics.clone(),
        8,
        3,
        ReadinessPolicy::default(),
        CancellationToken::new(),
    ));

    let host = MicroserviceHost::new(config(), stores, factory, topics.clone());
    let manager = host.manager();
    let component = host.into_component();

    // One engine exists before start, one arrives afterwards, and one belongs
    // to another instance.
    engines.create(tenant_engine("acme", "prod")).await.unwrap();
    let status = provision(Arc::clone(&component), &mut ProgressMonitor::new("host"))
        .await
        .unwrap();
    assert_eq!(status, ComponentStatus::Started);
    engines.create(tenant_engine("globex", "prod")).await.unwrap();
    engines.create(tenant_engine("initech", "staging")).await.unwrap();

    let policy = ReadinessPolicy {
        interval: Duration::from_millis(10),
        deadline: Some(Duration::from_secs(5)),
    };
    for tenant in ["acme", "globex"] {
        let token = TenantToken::parse(tenant).unwrap();
        manager
            .wait_for_dataset_bootstrap(&token, &policy, &CancellationToken::new())
            .await
            .unwrap();
        assert!(manager.assure_available(&token).is_ok());
    }
    assert!(manager
        .get_by_token(&TenantToken::parse("initech").unwrap())
        .is_none());

    assert_eq!(topics.creates() as usize, AREA_TOPICS.len() + 2 * TENANT_TOPICS.len());
    assert!(topics.topic("prod.tenant.acme.event-sources.events").is_some());

    let mut monitor = ProgressMonitor::new("host shutdown");
    assert_eq!(component.lifecycle_stop(&mut monitor).await, ComponentStatus::Stopped);
    assert_eq!(manager.stats().initialized, 0);
    assert_eq!(
        component.lifecycle_terminate(&mut monitor).await,
        ComponentStatus::Terminated
    );

    let stored = engines
        .get("default", "acme-event-sources")
        .await
        .unwrap()
        .and_then(|r| r.status)
        .unwrap();
    assert_eq!(stored.state, Some(ComponentStatus::Terminated));
    assert!(stored.dataset_bootstrapped);
}
