//! stratum microservice host
//!
//! Serves one functional area of one instance: watches the instance's
//! declarative resources and keeps one engine running per tenant.
//!
//! ## Architecture
//!
//! - **Resource monitors**: one per kind, deduplicating by generation
//! - **Tenant engine manager**: starter and stopper loops over FIFO queues
//! - **Topic readiness**: topics exist and are replicated before engines run
//!
//! Stores and the topic admin are in-process for now.

use std::sync::Arc;

use anyhow::Result;
use stratum_lifecycle::{provision, ProgressMonitor};
use stratum_microservice::config::Config;
use stratum_microservice::engine::StandardEngineFactory;
use stratum_microservice::kinds::{
    InstanceKind, MicroserviceKind, ScriptKind, ScriptVersionKind, TenantEngineKind,
};
use stratum_microservice::messaging::InMemoryTopicAdmin;
use stratum_microservice::service::{MicroserviceHost, Stores};
use stratum_reconcile::InMemoryStore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so STRATUM_LOG_LEVEL can seed the filter
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        instance_id = %config.instance_id,
        namespace = %config.namespace,
        functional_area = %config.functional_area,
        tenant_concurrency = config.tenant_concurrency,
        "Starting stratum microservice"
    );

    let stores = Stores {
        instances: Arc::new(InMemoryStore::<InstanceKind>::new()),
        microservices: Arc::new(InMemoryStore::<MicroserviceKind>::new()),
        scripts: Arc::new(InMemoryStore::<ScriptKind>::new()),
        script_versions: Arc::new(InMemoryStore::<ScriptVersionKind>::new()),
        tenant_engines: Arc::new(InMemoryStore::<TenantEngineKind>::new()),
    };
    let topics = Arc::new(InMemoryTopicAdmin::new());

    // Engines share one cancellation token so shutdown interrupts their
    // readiness waits too.
    let cancel = CancellationToken::new();
    let factory = Arc::new(StandardEngineFactory::new(
        topics.clone(),
        config.topic_partitions,
        config.topic_replication,
        config.readiness_policy(),
        cancel.clone(),
    ));

    let host = MicroserviceHost::new(config, stores, factory, topics);
    let host_cancel = host.cancellation();
    let component = host.into_component();

    let mut monitor = ProgressMonitor::new("provision microservice");
    let provisioning = {
        let component = Arc::clone(&component);
        tokio::spawn(async move { provision(component, &mut monitor).await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal during startup");
            cancel.cancel();
            host_cancel.cancel();
        }
        result = provisioning => match result {
            Ok(Ok(status)) => {
                info!(status = %status, "Microservice started");
                tokio::signal::ctrl_c().await?;
                info!("Received shutdown signal");
            }
            Ok(Err(e)) => error!(error = %e, "Microservice failed to start"),
            Err(e) => error!(error = %e, "Provisioning task panicked"),
        },
    }

    let snapshot = component.snapshot();
    info!(health = ?snapshot.health, "Shutting down");

    cancel.cancel();
    let mut monitor = ProgressMonitor::new("shutdown microservice");
    let stopped = component.lifecycle_stop(&mut monitor).await;
    if stopped.is_error() {
        warn!(status = %stopped, error = ?component.last_error().map(|e| e.to_string()), "Microservice did not stop cleanly");
    }
    component.lifecycle_terminate(&mut monitor).await;

    info!("Microservice shutdown complete");
    Ok(())
}
