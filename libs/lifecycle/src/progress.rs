//! Nested progress tracking for lifecycle operations.
//!
//! A [`ProgressMonitor`] keeps a stack of contexts. Each context declares how
//! many operations it will run; the percentage is computed by folding the
//! stack, where every level is a `1/operation_count` slice of the budget left
//! by the level above. An inner step therefore reports globally correct
//! progress without knowing how deeply it is nested.
//!
//! Monitors are created per operation (one per provision, shutdown, ...), so
//! the recorded history stays bounded by the number of steps in that
//! operation.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::ProgressError;

/// A single progress report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    /// Task the monitor was created for.
    pub task: String,

    /// Message of the operation that just finished.
    pub message: String,

    /// Overall completion, 0 to 100.
    pub percent: f64,
}

#[derive(Debug)]
struct ProgressContext {
    message: String,
    operation_count: usize,
    current_index: usize,
    current_message: String,
}

/// Progress monitor for nested lifecycle operations.
pub struct ProgressMonitor {
    task: String,
    stack: Vec<ProgressContext>,
    history: Vec<ProgressReport>,
    tx: watch::Sender<ProgressReport>,
}

impl ProgressMonitor {
    /// Create a monitor for the named task.
    pub fn new(task: impl Into<String>) -> Self {
        let task = task.into();
        let (tx, _) = watch::channel(ProgressReport {
            task: task.clone(),
            message: String::new(),
            percent: 0.0,
        });
        Self {
            task,
            stack: Vec::new(),
            history: Vec::new(),
            tx,
        }
    }

    /// Task name.
    pub fn task(&self) -> &str {
        &self.task
    }

    /// Subscribe to the latest report.
    pub fn subscribe(&self) -> watch::Receiver<ProgressReport> {
        self.tx.subscribe()
    }

    /// Reports emitted so far, oldest first.
    pub fn history(&self) -> &[ProgressReport] {
        &self.history
    }

    /// Current nesting depth.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Push a context that will run `operation_count` operations.
    pub fn push_context(&mut self, operation_count: usize, message: impl Into<String>) {
        let message = message.into();
        debug!(task = %self.task, depth = self.stack.len() + 1, operation_count, context = %message, "Pushing progress context");
        self.stack.push(ProgressContext {
            message,
            operation_count,
            current_index: 0,
            current_message: String::new(),
        });
    }

    /// Pop the innermost context.
    pub fn pop_context(&mut self) {
        self.stack.pop();
    }

    /// Mark the start of the next operation in the innermost context.
    pub fn start_progress(&mut self, message: impl Into<String>) -> Result<(), ProgressError> {
        let context = self.stack.last_mut().ok_or(ProgressError::NoContext)?;
        let attempted = context.current_index + 1;
        if attempted > context.operation_count {
            return Err(ProgressError::TooManyOperations {
                context: context.message.clone(),
                declared: context.operation_count,
                attempted,
            });
        }
        context.current_index = attempted;
        context.current_message = message.into();
        Ok(())
    }

    /// Mark the current operation of the innermost context as finished and
    /// publish the resulting percentage.
    pub fn finish_progress(&mut self) -> f64 {
        let percent = self.percent_complete();
        let message = self
            .stack
            .last()
            .map(|c| c.current_message.clone())
            .unwrap_or_default();

        info!(task = %self.task, percent, operation = %message, "Progress");

        let report = ProgressReport {
            task: self.task.clone(),
            message,
            percent,
        };
        self.history.push(report.clone());
        self.tx.send_replace(report);
        percent
    }

    /// Fold the context stack into a percentage, counting the innermost
    /// current operation as complete.
    pub fn percent_complete(&self) -> f64 {
        // Exact rational arithmetic: the same point in the stack always maps to
        // the same float, and a fully finished level lands exactly on 100.
        let mut numerator: u128 = 0;
        let mut denominator: u128 = 1;
        let last = self.stack.len().saturating_sub(1);

        for (depth, context) in self.stack.iter().enumerate() {
            if context.operation_count == 0 {
                break;
            }
            let count = context.operation_count as u128;
            let completed = if depth == last {
                context.current_index
            } else {
                context.current_index.saturating_sub(1)
            };
            numerator = numerator.saturating_mul(count).saturating_add(completed as u128);
            denominator = denominator.saturating_mul(count);
        }

        (numerator as f64 / denominator as f64 * 100.0).min(100.0)
    }
}

impl std::fmt::Debug for ProgressMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressMonitor")
            .field("task", &self.task)
            .field("stack", &self.stack)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_progress() {
        let mut monitor = ProgressMonitor::new("flat");
        monitor.push_context(4, "four steps");

        let mut seen = Vec::new();
        for i in 0..4 {
            monitor.start_progress(format!("op {i}")).unwrap();
            seen.push(monitor.finish_progress());
        }

        assert_eq!(seen, vec![25.0, 50.0, 75.0, 100.0]);
    }

    #[test]
    fn test_nested_progress_is_proportional() {
        let mut monitor = ProgressMonitor::new("nested");
        monitor.push_context(2, "microservice");

        monitor.start_progress("start profile").unwrap();
        monitor.push_context(4, "profile");
        monitor.start_progress("a").unwrap();
        assert_eq!(monitor.finish_progress(), 12.5);
        monitor.start_progress("b").unwrap();
        assert_eq!(monitor.finish_progress(), 25.0);
        monitor.pop_context();
        assert_eq!(monitor.finish_progress(), 50.0);

        monitor.start_progress("start engines").unwrap();
        assert_eq!(monitor.finish_progress(), 100.0);
    }

    #[test]
    fn test_too_many_operations() {
        let mut monitor = ProgressMonitor::new("overflow");
        monitor.push_context(1, "single");
        monitor.start_progress("first").unwrap();
        let err = monitor.start_progress("second").unwrap_err();
        assert_eq!(
            err,
            ProgressError::TooManyOperations {
                context: "single".to_string(),
                declared: 1,
                attempted: 2,
            }
        );
    }

    #[test]
    fn test_start_without_context() {
        let mut monitor = ProgressMonitor::new("empty");
        assert_eq!(monitor.start_progress("x"), Err(ProgressError::NoContext));
    }

    #[test]
    fn test_subscribers_see_latest_report() {
        let mut monitor = ProgressMonitor::new("watched");
        let rx = monitor.subscribe();
        monitor.push_context(2, "two");
        monitor.start_progress("one").unwrap();
        monitor.finish_progress();

        let latest = rx.borrow().clone();
        assert_eq!(latest.percent, 50.0);
        assert_eq!(latest.message, "one");
        assert_eq!(monitor.history().len(), 1);
    }
}
