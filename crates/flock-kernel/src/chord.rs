//! Fan-out / fan-in barrier.
//!
//! [FanOut] spawns one task per unit of work; [FanOut::join] waits for all
//! of them and yields a [BatchOutcome]. The outcome is either "every member
//! succeeded" or "at least one member failed"; a caller never sees a
//! partially successful batch as a success.

use std::future::Future;

use tokio::task::JoinHandle;

use crate::error::FlockError;

/// Result of joining a batch.
#[derive(Debug)]
pub enum BatchOutcome<T> {
    Succeeded(Vec<T>),
    Failed {
        errors: Vec<FlockError>,
        succeeded: usize,
    },
}

impl<T> BatchOutcome<T> {
    pub fn from_results(results: Vec<Result<T, FlockError>>) -> Self {
        let mut values = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(value) => values.push(value),
                Err(err) => errors.push(err),
            }
        }
        if errors.is_empty() {
            BatchOutcome::Succeeded(values)
        } else {
            BatchOutcome::Failed {
                errors,
                succeeded: values.len(),
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BatchOutcome::Succeeded(_))
    }

    pub fn total(&self) -> usize {
        match self {
            BatchOutcome::Succeeded(values) => values.len(),
            BatchOutcome::Failed { errors, succeeded } => errors.len() + succeeded,
        }
    }

    /// Collapse the batch: all values, or `BatchFailed` for `stage`.
    pub fn into_result(self, stage: &'static str) -> Result<Vec<T>, FlockError> {
        match self {
            BatchOutcome::Succeeded(values) => Ok(values),
            BatchOutcome::Failed { errors, succeeded } => {
                for err in &errors {
                    tracing::warn!("{} subtask failed: {}", stage, err);
                }
                Err(FlockError::BatchFailed {
                    stage,
                    failed: errors.len(),
                    total: errors.len() + succeeded,
                })
            }
        }
    }
}

/// A batch of spawned subtasks awaiting a single barrier.
pub struct FanOut<T> {
    handles: Vec<JoinHandle<Result<T, FlockError>>>,
}

impl<T: Send + 'static> FanOut<T> {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    /// Dispatch one subtask. It starts running immediately.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Result<T, FlockError>> + Send + 'static,
    {
        self.handles.push(tokio::spawn(task));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every subtask. A panicked subtask counts as a failure.
    pub async fn join(self) -> BatchOutcome<T> {
        let joined = futures::future::join_all(self.handles).await;
        let results = joined
            .into_iter()
            .map(|joined| match joined {
                Ok(result) => result,
                Err(err) => Err(FlockError::Task(err.to_string())),
            })
            .collect();
        BatchOutcome::from_results(results)
    }
}

impl<T: Send + 'static> Default for FanOut<T> {
    fn default() -> Self {
        Self::new()
    }
}
