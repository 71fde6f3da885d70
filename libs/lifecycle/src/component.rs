//! Lifecycle component and capability traits.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use stratum_id::{ComponentId, TenantToken};
use tracing::{debug, error, info, warn};

use crate::error::LifecycleError;
use crate::progress::ProgressMonitor;
use crate::status::{ComponentStatus, ComponentType, Health};
use crate::step::LifecycleVerb;

// =============================================================================
// Capability Traits
// =============================================================================

/// Behavior plugged into a [`Component`].
///
/// Hooks receive the owning component so they can register and drive nested
/// components. Guards default to `true`; a guard returning `false` turns the
/// corresponding verb into a no-op.
#[async_trait]
pub trait Lifecycle: Send + Sync + 'static {
    fn can_initialize(&self) -> bool {
        true
    }

    fn can_start(&self) -> bool {
        true
    }

    fn can_pause(&self) -> bool {
        true
    }

    fn can_stop(&self) -> bool {
        true
    }

    async fn initialize(
        &self,
        _component: &Component,
        _monitor: &mut ProgressMonitor,
    ) -> Result<(), LifecycleError> {
        Ok(())
    }

    async fn start(
        &self,
        _component: &Component,
        _monitor: &mut ProgressMonitor,
    ) -> Result<(), LifecycleError> {
        Ok(())
    }

    async fn pause(
        &self,
        _component: &Component,
        _monitor: &mut ProgressMonitor,
    ) -> Result<(), LifecycleError> {
        Ok(())
    }

    async fn stop(
        &self,
        _component: &Component,
        _monitor: &mut ProgressMonitor,
    ) -> Result<(), LifecycleError> {
        Ok(())
    }

    async fn terminate(
        &self,
        _component: &Component,
        _monitor: &mut ProgressMonitor,
    ) -> Result<(), LifecycleError> {
        Ok(())
    }

    /// Tenant capability, if this behavior serves a single tenant.
    fn tenant_aware(&self) -> Option<&dyn TenantAware> {
        None
    }

    /// Background-start capability.
    fn async_start(&self) -> Option<&dyn AsyncStart> {
        None
    }
}

/// Component scoped to a single tenant.
pub trait TenantAware: Send + Sync {
    fn tenant_token(&self) -> &TenantToken;
}

/// Component whose start may run in the background when started as a nested
/// component, so a slow dependency does not hold up its parent.
pub trait AsyncStart: Send + Sync {
    fn start_in_background(&self) -> bool {
        true
    }
}

/// Behavior with no hooks; useful for grouping components.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLifecycle;

impl Lifecycle for NoopLifecycle {}

// =============================================================================
// Component
// =============================================================================

/// A managed unit with a lifecycle status and nested children.
pub struct Component {
    id: ComponentId,
    name: String,
    component_type: ComponentType,
    created_at: DateTime<Utc>,
    status: AtomicU8,
    initialized: AtomicBool,
    last_error: Mutex<Option<Arc<LifecycleError>>>,
    children: DashMap<ComponentId, Arc<Component>>,
    behavior: Box<dyn Lifecycle>,
}

impl Component {
    /// Create a component in the `Stopped` state.
    pub fn new(
        name: impl Into<String>,
        component_type: ComponentType,
        behavior: impl Lifecycle,
    ) -> Self {
        Self {
            id: ComponentId::new(),
            name: name.into(),
            component_type,
            created_at: Utc::now(),
            status: AtomicU8::new(ComponentStatus::Stopped as u8),
            initialized: AtomicBool::new(false),
            last_error: Mutex::new(None),
            children: DashMap::new(),
            behavior: Box::new(behavior),
        }
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn component_type(&self) -> ComponentType {
        self.component_type
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn behavior(&self) -> &dyn Lifecycle {
        self.behavior.as_ref()
    }

    /// Current status.
    pub fn status(&self) -> ComponentStatus {
        // Only valid discriminants are ever stored.
        ComponentStatus::from_u8(self.status.load(Ordering::Acquire))
            .unwrap_or(ComponentStatus::LifecycleError)
    }

    /// Returns true once initialization has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Error recorded by the most recent failed verb.
    pub fn last_error(&self) -> Option<Arc<LifecycleError>> {
        self.last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Tenant served by this component, if it is tenant-aware.
    pub fn tenant_token(&self) -> Option<&TenantToken> {
        self.behavior.tenant_aware().map(|t| t.tenant_token())
    }

    fn set_status(&self, status: ComponentStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    fn set_last_error(&self, err: Option<Arc<LifecycleError>>) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = err;
    }

    fn fail(&self, status: ComponentStatus, err: LifecycleError) -> ComponentStatus {
        error!(component = %self.name, status = %status, error = %err, "Lifecycle transition failed");
        self.set_last_error(Some(Arc::new(err)));
        self.set_status(status);
        status
    }

    fn settle(&self, status: ComponentStatus) -> ComponentStatus {
        self.set_last_error(None);
        self.set_status(status);
        info!(component = %self.name, status = %status, "Lifecycle state transitioned");
        status
    }

    /// Returns true if any direct child is in one of the given states.
    fn any_child_in(&self, states: &[ComponentStatus]) -> bool {
        self.children
            .iter()
            .any(|child| states.contains(&child.value().status()))
    }

    // -------------------------------------------------------------------------
    // Lifecycle Verbs
    // -------------------------------------------------------------------------

    /// Initialize the component. Returns the settled status.
    pub async fn lifecycle_initialize(&self, monitor: &mut ProgressMonitor) -> ComponentStatus {
        if !self.behavior.can_initialize() {
            debug!(component = %self.name, "Initialize guard declined, skipping");
            return self.status();
        }

        self.set_status(ComponentStatus::Initializing);
        match self.behavior.initialize(self, monitor).await {
            Ok(()) => {
                self.initialized.store(true, Ordering::Release);
                self.settle(ComponentStatus::Stopped)
            }
            Err(e) => self.fail(ComponentStatus::InitializationError, e),
        }
    }

    /// Start the component. Returns the settled status.
    ///
    /// Settles on `StartedWithErrors` when any child is in `LifecycleError` or
    /// `StartedWithErrors`.
    pub async fn lifecycle_start(&self, monitor: &mut ProgressMonitor) -> ComponentStatus {
        if !self.behavior.can_start() {
            debug!(component = %self.name, "Start guard declined, skipping");
            return self.status();
        }
        if !self.is_initialized() {
            return self.fail(
                ComponentStatus::LifecycleError,
                LifecycleError::NotInitialized(self.name.clone()),
            );
        }

        self.set_status(ComponentStatus::Starting);
        match self.behavior.start(self, monitor).await {
            Ok(()) => {
                let degraded = self.any_child_in(&[
                    ComponentStatus::LifecycleError,
                    ComponentStatus::StartedWithErrors,
                ]);
                self.settle(if degraded {
                    ComponentStatus::StartedWithErrors
                } else {
                    ComponentStatus::Started
                })
            }
            Err(e) => self.fail(ComponentStatus::LifecycleError, e),
        }
    }

    /// Pause a started component. No-op unless started.
    pub async fn lifecycle_pause(&self, monitor: &mut ProgressMonitor) -> ComponentStatus {
        let current = self.status();
        if !self.behavior.can_pause() || !current.is_started() {
            debug!(component = %self.name, status = %current, "Pause not applicable, skipping");
            return current;
        }

        self.set_status(ComponentStatus::Pausing);
        match self.behavior.pause(self, monitor).await {
            Ok(()) => self.settle(ComponentStatus::Paused),
            Err(e) => self.fail(ComponentStatus::LifecycleError, e),
        }
    }

    /// Stop the component. Returns the settled status.
    ///
    /// Components that already stopped cleanly or terminated are left alone;
    /// failed components still run their stop hook to release what they hold.
    pub async fn lifecycle_stop(&self, monitor: &mut ProgressMonitor) -> ComponentStatus {
        let current = self.status();
        if !self.behavior.can_stop()
            || matches!(current, ComponentStatus::Stopped | ComponentStatus::Terminated)
        {
            debug!(component = %self.name, status = %current, "Stop not applicable, skipping");
            return current;
        }

        self.set_status(ComponentStatus::Stopping);
        match self.behavior.stop(self, monitor).await {
            Ok(()) => {
                let degraded = self.any_child_in(&[
                    ComponentStatus::LifecycleError,
                    ComponentStatus::StoppedWithErrors,
                ]);
                self.settle(if degraded {
                    ComponentStatus::StoppedWithErrors
                } else {
                    ComponentStatus::Stopped
                })
            }
            Err(e) => self.fail(ComponentStatus::LifecycleError, e),
        }
    }

    /// Terminate the component. Allowed from any non-terminated state.
    pub async fn lifecycle_terminate(&self, monitor: &mut ProgressMonitor) -> ComponentStatus {
        if self.status() == ComponentStatus::Terminated {
            return ComponentStatus::Terminated;
        }

        self.set_status(ComponentStatus::Terminating);
        match self.behavior.terminate(self, monitor).await {
            Ok(()) => self.settle(ComponentStatus::Terminated),
            Err(e) => self.fail(ComponentStatus::LifecycleError, e),
        }
    }

    /// Run one verb by value.
    pub async fn run_verb(&self, verb: LifecycleVerb, monitor: &mut ProgressMonitor) -> ComponentStatus {
        match verb {
            LifecycleVerb::Initialize => self.lifecycle_initialize(monitor).await,
            LifecycleVerb::Start => self.lifecycle_start(monitor).await,
            LifecycleVerb::Pause => self.lifecycle_pause(monitor).await,
            LifecycleVerb::Stop => self.lifecycle_stop(monitor).await,
            LifecycleVerb::Terminate => self.lifecycle_terminate(monitor).await,
        }
    }

    // -------------------------------------------------------------------------
    // Nested Components
    // -------------------------------------------------------------------------

    /// Register a child without running any verb on it.
    pub fn register(&self, child: Arc<Component>) {
        debug!(parent = %self.name, child = %child.name, "Registering nested component");
        self.children.insert(child.id, child);
    }

    /// Remove a child from this component.
    pub fn unregister(&self, id: ComponentId) -> Option<Arc<Component>> {
        self.children.remove(&id).map(|(_, child)| child)
    }

    /// Direct children, in no particular order.
    pub fn children(&self) -> Vec<Arc<Component>> {
        self.children.iter().map(|c| Arc::clone(c.value())).collect()
    }

    /// Look up a direct child.
    pub fn child(&self, id: ComponentId) -> Option<Arc<Component>> {
        self.children.get(&id).map(|c| Arc::clone(c.value()))
    }

    /// Register `child` and run `verb` on it.
    ///
    /// If the child ends in an error state and `require` is true the error is
    /// returned, which fails the calling hook; otherwise it is only logged.
    pub async fn nested(
        &self,
        verb: LifecycleVerb,
        child: Arc<Component>,
        monitor: &mut ProgressMonitor,
        require: bool,
    ) -> Result<(), LifecycleError> {
        self.register(Arc::clone(&child));

        if verb == LifecycleVerb::Start {
            if let Some(capability) = child.behavior.async_start() {
                if capability.start_in_background() {
                    let background = Arc::clone(&child);
                    info!(parent = %self.name, child = %child.name, "Starting nested component in background");
                    tokio::spawn(async move {
                        let mut monitor = ProgressMonitor::new(format!("Start {}", background.name));
                        background.lifecycle_start(&mut monitor).await;
                    });
                    return Ok(());
                }
            }
        }

        let status = child.run_verb(verb, monitor).await;
        if !status.is_error() {
            return Ok(());
        }

        if require {
            return Err(LifecycleError::NestedFailed {
                component: child.name.clone(),
                status,
                source: child.last_error(),
            });
        }

        warn!(
            parent = %self.name,
            child = %child.name,
            status = %status,
            "Optional nested component failed"
        );
        Ok(())
    }

    pub async fn initialize_nested(
        &self,
        child: Arc<Component>,
        monitor: &mut ProgressMonitor,
        require: bool,
    ) -> Result<(), LifecycleError> {
        self.nested(LifecycleVerb::Initialize, child, monitor, require).await
    }

    pub async fn start_nested(
        &self,
        child: Arc<Component>,
        monitor: &mut ProgressMonitor,
        require: bool,
    ) -> Result<(), LifecycleError> {
        self.nested(LifecycleVerb::Start, child, monitor, require).await
    }

    pub async fn stop_nested(
        &self,
        child: Arc<Component>,
        monitor: &mut ProgressMonitor,
        require: bool,
    ) -> Result<(), LifecycleError> {
        self.nested(LifecycleVerb::Stop, child, monitor, require).await
    }

    pub async fn terminate_nested(
        &self,
        child: Arc<Component>,
        monitor: &mut ProgressMonitor,
        require: bool,
    ) -> Result<(), LifecycleError> {
        self.nested(LifecycleVerb::Terminate, child, monitor, require).await
    }

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------

    /// All descendants of the given type, depth-first.
    pub fn find_components_of_type(&self, component_type: ComponentType) -> Vec<Arc<Component>> {
        let mut found = Vec::new();
        self.collect_of_type(component_type, &mut found);
        found
    }

    fn collect_of_type(&self, component_type: ComponentType, found: &mut Vec<Arc<Component>>) {
        for child in self.children() {
            if child.component_type == component_type {
                found.push(Arc::clone(&child));
            }
            child.collect_of_type(component_type, found);
        }
    }

    /// Worst health among this component and all descendants.
    pub fn health(&self) -> Health {
        self.children()
            .iter()
            .map(|c| c.health())
            .fold(self.status().health(), Health::max)
    }

    /// Serializable view of the subtree rooted here.
    pub fn snapshot(&self) -> ComponentSnapshot {
        let mut children: Vec<_> = self.children().iter().map(|c| c.snapshot()).collect();
        children.sort_by(|a, b| a.id.cmp(&b.id));

        ComponentSnapshot {
            id: self.id,
            name: self.name.clone(),
            component_type: self.component_type,
            status: self.status(),
            health: self.health(),
            last_error: self.last_error().map(|e| e.to_string()),
            created_at: self.created_at,
            children,
        }
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("component_type", &self.component_type)
            .field("status", &self.status())
            .field("children", &self.children.len())
            .finish()
    }
}

/// Point-in-time view of a component subtree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSnapshot {
    pub id: ComponentId,
    pub name: String,
    pub component_type: ComponentType,
    pub status: ComponentStatus,
    pub health: Health,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub children: Vec<ComponentSnapshot>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    struct FailOn(LifecycleVerb);

    #[async_trait]
    impl Lifecycle for FailOn {
        async fn initialize(&self, _: &Component, _: &mut ProgressMonitor) -> Result<(), LifecycleError> {
            self.check(LifecycleVerb::Initialize)
        }

        async fn start(&self, _: &Component, _: &mut ProgressMonitor) -> Result<(), LifecycleError> {
            self.check(LifecycleVerb::Start)
        }

        async fn stop(&self, _: &Component, _: &mut ProgressMonitor) -> Result<(), LifecycleError> {
            self.check(LifecycleVerb::Stop)
        }

        async fn terminate(&self, _: &Component, _: &mut ProgressMonitor) -> Result<(), LifecycleError> {
            self.check(LifecycleVerb::Terminate)
        }
    }

    impl FailOn {
        fn check(&self, verb: LifecycleVerb) -> Result<(), LifecycleError> {
            if self.0 == verb {
                Err(LifecycleError::failed(format!("{verb} failed")))
            } else {
                Ok(())
            }
        }
    }

    struct Guarded;

    impl Lifecycle for Guarded {
        fn can_start(&self) -> bool {
            false
        }
    }

    fn monitor() -> ProgressMonitor {
        ProgressMonitor::new("test")
    }

    #[tokio::test]
    async fn test_initial_state_is_stopped() {
        let c = Component::new("c", ComponentType::Other, NoopLifecycle);
        assert_eq!(c.status(), ComponentStatus::Stopped);
        assert!(!c.is_initialized());
        assert!(c.last_error().is_none());
    }

    #[tokio::test]
    async fn test_happy_path() {
        let c = Component::new("c", ComponentType::Other, NoopLifecycle);
        let mut m = monitor();
        assert_eq!(c.lifecycle_initialize(&mut m).await, ComponentStatus::Stopped);
        assert_eq!(c.lifecycle_start(&mut m).await, ComponentStatus::Started);
        assert_eq!(c.lifecycle_pause(&mut m).await, ComponentStatus::Paused);
        assert_eq!(c.lifecycle_start(&mut m).await, ComponentStatus::Started);
        assert_eq!(c.lifecycle_stop(&mut m).await, ComponentStatus::Stopped);
        assert_eq!(c.lifecycle_terminate(&mut m).await, ComponentStatus::Terminated);
    }

    #[rstest]
    #[case(LifecycleVerb::Initialize, ComponentStatus::InitializationError)]
    #[case(LifecycleVerb::Start, ComponentStatus::LifecycleError)]
    #[case(LifecycleVerb::Stop, ComponentStatus::LifecycleError)]
    #[case(LifecycleVerb::Terminate, ComponentStatus::LifecycleError)]
    #[tokio::test]
    async fn test_hook_failure_sets_error_state(
        #[case] verb: LifecycleVerb,
        #[case] expected: ComponentStatus,
    ) {
        let c = Component::new("c", ComponentType::Other, FailOn(verb));
        let mut m = monitor();

        let mut last = ComponentStatus::Stopped;
        for v in [
            LifecycleVerb::Initialize,
            LifecycleVerb::Start,
            LifecycleVerb::Stop,
            LifecycleVerb::Terminate,
        ] {
            last = c.run_verb(v, &mut m).await;
            if v == verb {
                break;
            }
        }

        assert_eq!(last, expected);
        let err = c.last_error().expect("error recorded");
        assert_eq!(err.to_string(), format!("{verb} failed"));
    }

    #[tokio::test]
    async fn test_start_before_initialize_fails() {
        let c = Component::new("c", ComponentType::Other, NoopLifecycle);
        let status = c.lifecycle_start(&mut monitor()).await;
        assert_eq!(status, ComponentStatus::LifecycleError);
        assert!(matches!(
            c.last_error().as_deref(),
            Some(LifecycleError::NotInitialized(name)) if name == "c"
        ));
    }

    #[tokio::test]
    async fn test_guard_makes_verb_noop() {
        let c = Component::new("c", ComponentType::Other, Guarded);
        let mut m = monitor();
        c.lifecycle_initialize(&mut m).await;
        assert_eq!(c.lifecycle_start(&mut m).await, ComponentStatus::Stopped);
    }

    #[tokio::test]
    async fn test_success_clears_last_error() {
        let c = Component::new("c", ComponentType::Other, NoopLifecycle);
        let mut m = monitor();
        c.lifecycle_start(&mut m).await;
        assert!(c.last_error().is_some());

        c.lifecycle_initialize(&mut m).await;
        assert_eq!(c.lifecycle_start(&mut m).await, ComponentStatus::Started);
        assert!(c.last_error().is_none());
    }

    #[tokio::test]
    async fn test_required_nested_failure_propagates() {
        let parent = Component::new("parent", ComponentType::Microservice, NoopLifecycle);
        let child = Arc::new(Component::new(
            "child",
            ComponentType::DataStore,
            FailOn(LifecycleVerb::Initialize),
        ));

        let err = parent
            .initialize_nested(Arc::clone(&child), &mut monitor(), true)
            .await
            .unwrap_err();

        match err {
            LifecycleError::NestedFailed {
                component, status, source,
            } => {
                assert_eq!(component, "child");
                assert_eq!(status, ComponentStatus::InitializationError);
                assert!(source.is_some());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(parent.children().len(), 1);
    }

    #[tokio::test]
    async fn test_optional_nested_failure_only_logs() {
        let parent = Component::new("parent", ComponentType::Microservice, NoopLifecycle);
        let child = Arc::new(Component::new(
            "child",
            ComponentType::DataStore,
            FailOn(LifecycleVerb::Initialize),
        ));

        parent
            .initialize_nested(child, &mut monitor(), false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_aggregates_child_errors() {
        let parent = Component::new("parent", ComponentType::Microservice, NoopLifecycle);
        let child = Arc::new(Component::new(
            "child",
            ComponentType::DataStore,
            FailOn(LifecycleVerb::Stop),
        ));
        let mut m = monitor();
        parent.lifecycle_initialize(&mut m).await;
        parent.initialize_nested(Arc::clone(&child), &mut m, true).await.unwrap();
        parent.lifecycle_start(&mut m).await;
        child.lifecycle_start(&mut m).await;
        child.lifecycle_stop(&mut m).await;

        assert_eq!(parent.lifecycle_stop(&mut m).await, ComponentStatus::StoppedWithErrors);
    }

    #[tokio::test]
    async fn test_find_components_of_type_is_depth_first() {
        let root = Component::new("root", ComponentType::Microservice, NoopLifecycle);
        let engine = Arc::new(Component::new("engine", ComponentType::TenantEngine, NoopLifecycle));
        let store = Arc::new(Component::new("store", ComponentType::DataStore, NoopLifecycle));
        let inner = Arc::new(Component::new("inner", ComponentType::DataStore, NoopLifecycle));
        engine.register(Arc::clone(&inner));
        root.register(Arc::clone(&engine));
        root.register(Arc::clone(&store));

        let stores = root.find_components_of_type(ComponentType::DataStore);
        let mut names: Vec<_> = stores.iter().map(|c| c.name().to_string()).collect();
        names.sort();
        assert_eq!(names, vec!["inner", "store"]);
        assert!(root.find_components_of_type(ComponentType::ScriptEngine).is_empty());
    }

    #[tokio::test]
    async fn test_health_rolls_up_worst_descendant() {
        let root = Component::new("root", ComponentType::Microservice, NoopLifecycle);
        let engine = Arc::new(Component::new("engine", ComponentType::TenantEngine, NoopLifecycle));
        let broken = Arc::new(Component::new("broken", ComponentType::DataStore, NoopLifecycle));
        engine.register(Arc::clone(&broken));
        root.register(Arc::clone(&engine));
        assert_eq!(root.health(), Health::Nominal);

        broken.lifecycle_start(&mut monitor()).await;
        assert_eq!(root.health(), Health::Error);

        let snapshot = root.snapshot();
        assert_eq!(snapshot.health, Health::Error);
        assert_eq!(snapshot.children[0].children[0].status, ComponentStatus::LifecycleError);
    }
}
