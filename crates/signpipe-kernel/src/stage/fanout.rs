//! Bounded per-item fan-out.
//!
//! Every item gets its own task, but at most `limit` of them run at once.
//! `spawn` waits for a free slot, so a full pool stops the dispatcher from
//! reading more input and the backpressure reaches the upstream queue.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::StageError;

/// A pool of per-item sub-tasks with a fixed concurrency limit.
#[derive(Debug)]
pub struct FanOut {
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<Result<(), StageError>>,
    limit: usize,
}

impl FanOut {
    /// Create a pool running at most `limit` sub-tasks at once (at least one).
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            tasks: JoinSet::new(),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Wait for a free slot, then spawn `task`. The slot is held until the
    /// task finishes.
    pub async fn spawn<F>(&mut self, task: F) -> Result<(), StageError>
    where
        F: Future<Output = Result<(), StageError>> + Send + 'static,
    {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| StageError::SubTask(e.to_string()))?;

        self.tasks.spawn(async move {
            let _permit = permit; // Hold permit until done
            task.await
        });
        Ok(())
    }

    /// Wait for every sub-task. Returns the first failure, after all of them
    /// have finished.
    pub async fn join(mut self) -> Result<(), StageError> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let outcome = match joined {
                Ok(result) => result,
                Err(e) => Err(StageError::SubTask(e.to_string())),
            };
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
