//! Lifecycle steps: single verbs bound to a component, and ordered
//! composites of them.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::component::Component;
use crate::error::LifecycleError;
use crate::progress::ProgressMonitor;
use crate::status::ComponentStatus;

/// A lifecycle verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleVerb {
    Initialize,
    Start,
    Pause,
    Stop,
    Terminate,
}

impl LifecycleVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::Terminate => "terminate",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Self::Initialize => "Initialize",
            Self::Start => "Start",
            Self::Pause => "Pause",
            Self::Stop => "Stop",
            Self::Terminate => "Terminate",
        }
    }
}

impl std::fmt::Display for LifecycleVerb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of lifecycle work.
#[async_trait]
pub trait LifecycleStep: Send + Sync {
    /// Descriptive name, used when wrapping failures.
    fn name(&self) -> &str;

    async fn execute(&self, monitor: &mut ProgressMonitor) -> Result<(), LifecycleError>;
}

/// Runs one verb against one component.
///
/// Standalone steps fail whenever the component ends in an error state. A
/// step nested under an owner registers the component with the owner and only
/// fails when the owner requires it.
pub struct ComponentStep {
    name: String,
    verb: LifecycleVerb,
    component: Arc<Component>,
    owner: Option<(Arc<Component>, bool)>,
}

impl ComponentStep {
    pub fn new(verb: LifecycleVerb, component: Arc<Component>) -> Self {
        Self {
            name: format!("{} {}", verb.title(), component.name()),
            verb,
            component,
            owner: None,
        }
    }

    pub fn initialize(component: Arc<Component>) -> Self {
        Self::new(LifecycleVerb::Initialize, component)
    }

    pub fn start(component: Arc<Component>) -> Self {
        Self::new(LifecycleVerb::Start, component)
    }

    pub fn stop(component: Arc<Component>) -> Self {
        Self::new(LifecycleVerb::Stop, component)
    }

    pub fn terminate(component: Arc<Component>) -> Self {
        Self::new(LifecycleVerb::Terminate, component)
    }

    /// Run the verb as a nested call on `owner`.
    pub fn nested_under(mut self, owner: Arc<Component>, require: bool) -> Self {
        self.owner = Some((owner, require));
        self
    }

    pub fn verb(&self) -> LifecycleVerb {
        self.verb
    }
}

#[async_trait]
impl LifecycleStep for ComponentStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, monitor: &mut ProgressMonitor) -> Result<(), LifecycleError> {
        if let Some((owner, require)) = &self.owner {
            return owner
                .nested(self.verb, Arc::clone(&self.component), monitor, *require)
                .await;
        }

        let status = self.component.run_verb(self.verb, monitor).await;
        if status.is_error() {
            return Err(self
                .component
                .last_error()
                .map(|source| LifecycleError::NestedFailed {
                    component: self.component.name().to_string(),
                    status,
                    source: Some(source),
                })
                .unwrap_or_else(|| {
                    LifecycleError::failed(format!(
                        "{} ended in state {status}",
                        self.component.name()
                    ))
                }));
        }
        Ok(())
    }
}

/// Ordered sequence of steps sharing one progress context.
///
/// Execution stops at the first failing step; the error is wrapped with that
/// step's name.
pub struct CompositeStep {
    name: String,
    steps: Vec<Box<dyn LifecycleStep>>,
}

impl CompositeStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step.
    pub fn add(&mut self, step: impl LifecycleStep + 'static) -> &mut Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Builder form of [`CompositeStep::add`].
    pub fn with(mut self, step: impl LifecycleStep + 'static) -> Self {
        self.add(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[async_trait]
impl LifecycleStep for CompositeStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, monitor: &mut ProgressMonitor) -> Result<(), LifecycleError> {
        monitor.push_context(self.steps.len(), self.name.clone());

        for step in &self.steps {
            debug!(composite = %self.name, step = %step.name(), "Executing lifecycle step");

            let result = match monitor.start_progress(step.name()) {
                Ok(()) => step.execute(monitor).await,
                Err(e) => Err(e.into()),
            };

            if let Err(source) = result {
                warn!(composite = %self.name, step = %step.name(), error = %source, "Lifecycle step failed");
                monitor.pop_context();
                return Err(LifecycleError::Step {
                    step: step.name().to_string(),
                    source: Box::new(source),
                });
            }

            monitor.finish_progress();
        }

        monitor.pop_context();
        Ok(())
    }
}

/// Initialize then start `component` as one composite operation.
pub async fn provision(
    component: Arc<Component>,
    monitor: &mut ProgressMonitor,
) -> Result<ComponentStatus, LifecycleError> {
    let composite = CompositeStep::new(format!("Provision {}", component.name()))
        .with(ComponentStep::initialize(Arc::clone(&component)))
        .with(ComponentStep::start(Arc::clone(&component)));

    composite.execute(monitor).await?;
    Ok(component.status())
}
