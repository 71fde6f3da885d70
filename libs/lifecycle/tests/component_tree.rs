//! Integration tests for component trees, status aggregation and progress.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use stratum_lifecycle::{
    provision, AsyncStart, Component, ComponentStatus, ComponentStep, ComponentType,
    CompositeStep, Lifecycle, LifecycleError, LifecycleStep, NoopLifecycle, ProgressMonitor,
};

/// Start hook that always fails.
struct FailingStart;

#[async_trait]
impl Lifecycle for FailingStart {
    async fn start(&self, _: &Component, _: &mut ProgressMonitor) -> Result<(), LifecycleError> {
        Err(LifecycleError::failed("listener port already bound"))
    }
}

/// Parent that initializes and starts a fixed set of children.
struct Parent {
    children: Vec<(Arc<Component>, bool)>,
}

#[async_trait]
impl Lifecycle for Parent {
    async fn initialize(&self, me: &Component, monitor: &mut ProgressMonitor) -> Result<(), LifecycleError> {
        for (child, require) in &self.children {
            me.initialize_nested(Arc::clone(child), monitor, *require).await?;
        }
        Ok(())
    }

    async fn start(&self, me: &Component, monitor: &mut ProgressMonitor) -> Result<(), LifecycleError> {
        for (child, require) in &self.children {
            me.start_nested(Arc::clone(child), monitor, *require).await?;
        }
        Ok(())
    }
}

/// Start that takes a while and opts into background start.
struct SlowBootstrap;

#[async_trait]
impl Lifecycle for SlowBootstrap {
    async fn start(&self, _: &Component, _: &mut ProgressMonitor) -> Result<(), LifecycleError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }

    fn async_start(&self) -> Option<&dyn AsyncStart> {
        Some(self)
    }
}

impl AsyncStart for SlowBootstrap {}

fn leaf(name: &str, behavior: impl Lifecycle) -> Arc<Component> {
    Arc::new(Component::new(name, ComponentType::Other, behavior))
}

#[tokio::test]
async fn test_optional_failing_child_degrades_parent() {
    let child1 = leaf("child1", NoopLifecycle);
    let child2 = leaf("child2", FailingStart);
    let parent = Component::new(
        "parent",
        ComponentType::Microservice,
        Parent {
            children: vec![(Arc::clone(&child1), true), (Arc::clone(&child2), false)],
        },
    );

    let mut monitor = ProgressMonitor::new("scenario-a");
    assert_eq!(parent.lifecycle_initialize(&mut monitor).await, ComponentStatus::Stopped);
    let status = parent.lifecycle_start(&mut monitor).await;

    assert_eq!(child1.status(), ComponentStatus::Started);
    assert_eq!(child2.status(), ComponentStatus::LifecycleError);
    assert_eq!(status, ComponentStatus::StartedWithErrors);
    assert!(parent.last_error().is_none());
}

#[tokio::test]
async fn test_required_failing_child_fails_parent() {
    let child = leaf("database", FailingStart);
    let parent = Component::new(
        "parent",
        ComponentType::Microservice,
        Parent {
            children: vec![(Arc::clone(&child), true)],
        },
    );

    let mut monitor = ProgressMonitor::new("required");
    parent.lifecycle_initialize(&mut monitor).await;
    let status = parent.lifecycle_start(&mut monitor).await;

    assert_eq!(status, ComponentStatus::LifecycleError);
    let err = parent.last_error().expect("parent error recorded");
    assert!(matches!(
        err.as_ref(),
        LifecycleError::NestedFailed { component, .. } if component == "database"
    ));
}

#[tokio::test]
async fn test_async_start_child_does_not_block_parent() {
    let slow = leaf("bootstrap", SlowBootstrap);
    let parent = Component::new(
        "parent",
        ComponentType::Microservice,
        Parent {
            children: vec![(Arc::clone(&slow), true)],
        },
    );

    let mut monitor = ProgressMonitor::new("async");
    parent.lifecycle_initialize(&mut monitor).await;
    assert_eq!(parent.lifecycle_start(&mut monitor).await, ComponentStatus::Started);
    assert_ne!(slow.status(), ComponentStatus::Started);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(slow.status(), ComponentStatus::Started);
}

#[tokio::test]
async fn test_nested_composites_report_monotonic_progress() {
    let a = leaf("a", NoopLifecycle);
    let b = leaf("b", NoopLifecycle);
    let c = leaf("c", NoopLifecycle);

    let inner = CompositeStep::new("bring up b")
        .with(ComponentStep::initialize(Arc::clone(&b)))
        .with(ComponentStep::start(Arc::clone(&b)));
    let outer = CompositeStep::new("bring up all")
        .with(ComponentStep::initialize(Arc::clone(&a)))
        .with(inner)
        .with(ComponentStep::initialize(Arc::clone(&c)));

    let mut monitor = ProgressMonitor::new("nested");
    outer.execute(&mut monitor).await.unwrap();

    let percents: Vec<f64> = monitor.history().iter().map(|r| r.percent).collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
    assert_eq!(percents.last().copied(), Some(100.0));
}

#[tokio::test]
async fn test_provision_failure_names_step() {
    let broken = leaf("broken", FailingStart);
    let err = provision(Arc::clone(&broken), &mut ProgressMonitor::new("provision"))
        .await
        .unwrap_err();

    assert_eq!(err.failed_step(), Some("Start broken"));
    assert_eq!(broken.status(), ComponentStatus::LifecycleError);
}

// =============================================================================
// Properties
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Ok,
    FailStart,
    Degraded,
}

fn child_for(index: usize, outcome: Outcome) -> Arc<Component> {
    let name = format!("child{index}");
    match outcome {
        Outcome::Ok => leaf(&name, NoopLifecycle),
        Outcome::FailStart => leaf(&name, FailingStart),
        Outcome::Degraded => {
            let grandchild = leaf(&format!("{name}-grandchild"), FailingStart);
            leaf(
                &name,
                Parent {
                    children: vec![(grandchild, false)],
                },
            )
        }
    }
}

fn outcome() -> impl Strategy<Value = Outcome> {
    prop_oneof![Just(Outcome::Ok), Just(Outcome::FailStart), Just(Outcome::Degraded)]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_start_status_reflects_children(outcomes in prop::collection::vec(outcome(), 0..6)) {
        let children: Vec<_> = outcomes
            .iter()
            .enumerate()
            .map(|(i, o)| (child_for(i, *o), false))
            .collect();
        let parent = Component::new("parent", ComponentType::Microservice, Parent { children });

        let status = runtime().block_on(async {
            let mut monitor = ProgressMonitor::new("prop");
            parent.lifecycle_initialize(&mut monitor).await;
            parent.lifecycle_start(&mut monitor).await
        });

        let any_bad = outcomes.iter().any(|o| !matches!(o, Outcome::Ok));
        let expected = if any_bad {
            ComponentStatus::StartedWithErrors
        } else {
            ComponentStatus::Started
        };
        prop_assert_eq!(status, expected);
    }

    #[test]
    fn prop_progress_is_monotonic(shape in prop::collection::vec(0usize..4, 1..8)) {
        // Each entry is a primitive step (0) or a nested composite of that many
        // initialize steps.
        let mut outer = CompositeStep::new("outer");
        for (i, nested) in shape.iter().enumerate() {
            if *nested == 0 {
                outer.add(ComponentStep::initialize(leaf(&format!("s{i}"), NoopLifecycle)));
            } else {
                let mut inner = CompositeStep::new(format!("inner{i}"));
                for j in 0..*nested {
                    inner.add(ComponentStep::initialize(leaf(&format!("s{i}-{j}"), NoopLifecycle)));
                }
                outer.add(inner);
            }
        }

        let mut monitor = ProgressMonitor::new("prop");
        runtime().block_on(outer.execute(&mut monitor)).unwrap();

        let percents: Vec<f64> = monitor.history().iter().map(|r| r.percent).collect();
        prop_assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        prop_assert_eq!(percents.last().copied(), Some(100.0));
    }
}
