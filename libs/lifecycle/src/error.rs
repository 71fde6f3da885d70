//! Lifecycle and progress errors.

use std::sync::Arc;

use thiserror::Error;

use crate::status::ComponentStatus;

/// Errors raised by lifecycle hooks and steps.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// A hook reported a failure.
    #[error("{0}")]
    Failed(String),

    /// Start was requested on a component that never initialized.
    #[error("component '{0}' has not been initialized")]
    NotInitialized(String),

    /// A required nested component ended in an error state.
    #[error("required component '{component}' ended in state {status}")]
    NestedFailed {
        component: String,
        status: ComponentStatus,
        #[source]
        source: Option<Arc<LifecycleError>>,
    },

    /// A lifecycle step failed; carries the step name for diagnostics.
    #[error("step '{step}' failed: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<LifecycleError>,
    },

    /// Progress bookkeeping was misused.
    #[error(transparent)]
    Progress(#[from] ProgressError),

    /// Internal error.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl LifecycleError {
    /// Shorthand for [`LifecycleError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Name of the innermost failing step, if any.
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            Self::Step { step, source } => source.failed_step().or(Some(step.as_str())),
            _ => None,
        }
    }
}

/// Errors raised by [`crate::ProgressMonitor`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProgressError {
    /// More operations were started than the context declared.
    #[error("context '{context}' declared {declared} operations but operation {attempted} was started")]
    TooManyOperations {
        context: String,
        declared: usize,
        attempted: usize,
    },

    /// An operation was started with no context pushed.
    #[error("no progress context is active")]
    NoContext,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_step_reports_innermost() {
        let err = LifecycleError::Step {
            step: "Start microservice".to_string(),
            source: Box::new(LifecycleError::Step {
                step: "Start profile".to_string(),
                source: Box::new(LifecycleError::failed("boom")),
            }),
        };
        assert_eq!(err.failed_step(), Some("Start profile"));
        assert_eq!(
            err.to_string(),
            "step 'Start microservice' failed: step 'Start profile' failed: boom"
        );
    }
}
