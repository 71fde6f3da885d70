//! Topic readiness.
//!
//! Microservices and tenant engines publish to per-area topics that must
//! exist and be fully replicated before anything is produced to them.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use stratum_id::TenantToken;
use stratum_reconcile::{wait_until, ReadinessError, ReadinessPolicy};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::monitors::Identity;

/// Desired shape of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: u32,
    pub replication: u16,
}

impl TopicSpec {
    /// Topic shared by every tenant of a functional area.
    pub fn for_area(identity: &Identity, suffix: &str, partitions: u32, replication: u16) -> Self {
        Self {
            name: format!("{}.{}.{}", identity.instance_id, identity.functional_area, suffix),
            partitions,
            replication,
        }
    }

    /// Topic private to one tenant of a functional area.
    pub fn for_tenant(
        identity: &Identity,
        tenant: &TenantToken,
        suffix: &str,
        partitions: u32,
        replication: u16,
    ) -> Self {
        Self {
            name: format!(
                "{}.tenant.{}.{}.{}",
                identity.instance_id, tenant, identity.functional_area, suffix
            ),
            partitions,
            replication,
        }
    }
}

/// Broker administration used for topic readiness.
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    async fn topic_exists(&self, topic: &str) -> anyhow::Result<bool>;

    async fn create_topic(&self, spec: &TopicSpec) -> anyhow::Result<()>;

    /// Whether every partition has its full replica set in sync.
    async fn is_fully_replicated(&self, topic: &str) -> anyhow::Result<bool>;
}

/// Create `spec` if missing and wait until it is fully replicated.
pub async fn ensure_topic(
    admin: &dyn TopicAdmin,
    spec: &TopicSpec,
    policy: &ReadinessPolicy,
    cancel: &CancellationToken,
) -> Result<(), ReadinessError> {
    let what = format!("topic {}", spec.name);
    wait_until(&what, policy, cancel, move || async move {
        if !admin.topic_exists(&spec.name).await? {
            info!(topic = %spec.name, partitions = spec.partitions, replication = spec.replication, "Creating topic");
            admin.create_topic(spec).await?;
        }
        admin.is_fully_replicated(&spec.name).await
    })
    .await
}

/// In-process topic admin for development and tests.
///
/// A created topic reports fully replicated after `replication_lag` probes.
#[derive(Debug, Default)]
pub struct InMemoryTopicAdmin {
    topics: DashMap<String, (TopicSpec, u32)>,
    replication_lag: u32,
    creates: AtomicU32,
}

impl InMemoryTopicAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replication_lag(replication_lag: u32) -> Self {
        Self {
            replication_lag,
            ..Self::default()
        }
    }

    pub fn topic(&self, name: &str) -> Option<TopicSpec> {
        self.topics.get(name).map(|t| t.value().0.clone())
    }

    /// Number of `create_topic` calls served.
    pub fn creates(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TopicAdmin for InMemoryTopicAdmin {
    async fn topic_exists(&self, topic: &str) -> anyhow::Result<bool> {
        Ok(self.topics.contains_key(topic))
    }

    async fn create_topic(&self, spec: &TopicSpec) -> anyhow::Result<()> {
        if spec.partitions == 0 || spec.replication == 0 {
            anyhow::bail!("topic {} needs at least one partition and one replica", spec.name);
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.topics
            .entry(spec.name.clone())
            .or_insert_with(|| (spec.clone(), 0));
        Ok(())
    }

    async fn is_fully_replicated(&self, topic: &str) -> anyhow::Result<bool> {
        let Some(mut entry) = self.topics.get_mut(topic) else {
            anyhow::bail!("topic {topic} does not exist");
        };
        let probes = &mut entry.value_mut().1;
        *probes += 1;
        let ready = *probes > self.replication_lag;
        debug!(topic, probes = *probes, ready, "Replication probe");
        Ok(ready)
    }
}
