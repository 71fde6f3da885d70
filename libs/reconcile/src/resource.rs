//! Typed declarative resources and watch events.

use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A kind of declarative resource.
///
/// Implemented by a unit marker type per kind; the associated types carry the
/// typed spec, status and spec diff.
pub trait ResourceKind: Debug + Clone + PartialEq + Send + Sync + 'static {
    /// Kind name used in logs and errors.
    const KIND: &'static str;

    type Spec: Debug + Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static;
    type Status: Debug
        + Clone
        + Default
        + PartialEq
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;
    type Diff: Debug + Clone + Default + PartialEq + Send + Sync + 'static;

    /// Which fields changed between `previous` and `current`. `None` means the
    /// previous revision is unknown, so everything counts as changed.
    fn diff(previous: Option<&Self::Spec>, current: &Self::Spec) -> Self::Diff;
}

/// Resource metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,

    /// Bumped by the store on every spec change. Equal generations mean the
    /// same revision.
    #[serde(default)]
    pub generation: u64,

    /// Bumped by the store on every write; writes carrying a stale value
    /// conflict.
    #[serde(default)]
    pub resource_version: u64,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// A typed declarative resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Resource<K: ResourceKind> {
    pub metadata: ObjectMeta,
    pub spec: K::Spec,
    #[serde(default)]
    pub status: Option<K::Status>,
}

impl<K: ResourceKind> Resource<K> {
    /// A new resource that has not been written yet.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: K::Spec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn generation(&self) -> u64 {
        self.metadata.generation
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.get(key).map(String::as_str)
    }

    /// `namespace/name`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }
}

/// Equality-based label selector; an empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    required: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.required.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.required
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

/// Kind of change carried by a watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        })
    }
}

/// A change notification for one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent<K: ResourceKind> {
    pub change: ChangeType,
    pub resource: Resource<K>,
}

impl<K: ResourceKind> WatchEvent<K> {
    pub fn created(resource: Resource<K>) -> Self {
        Self {
            change: ChangeType::Create,
            resource,
        }
    }

    pub fn updated(resource: Resource<K>) -> Self {
        Self {
            change: ChangeType::Update,
            resource,
        }
    }

    pub fn deleted(resource: Resource<K>) -> Self {
        Self {
            change: ChangeType::Delete,
            resource,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_selector_matches_everything() {
        let labels = BTreeMap::from([("a".to_string(), "1".to_string())]);
        assert!(LabelSelector::everything().matches(&labels));
        assert!(LabelSelector::everything().matches(&BTreeMap::new()));
    }

    #[test]
    fn test_selector_requires_all_labels() {
        let labels = BTreeMap::from([
            ("instance".to_string(), "dev".to_string()),
            ("area".to_string(), "core".to_string()),
        ]);
        let selector = LabelSelector::everything().with("instance", "dev");
        assert!(selector.matches(&labels));
        assert!(!selector.clone().with("area", "billing").matches(&labels));
        assert!(!LabelSelector::everything().with("tenant", "acme").matches(&labels));
    }
}
