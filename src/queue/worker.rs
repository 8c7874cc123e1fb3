use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, warn};

use super::{ClaimedTask, SqliteTaskQueue, WorkUnit};

/// Executes work units claimed from the queue.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, unit: &WorkUnit) -> Result<()>;

    /// Called once when a unit has used up its attempts.
    async fn abandon(&self, unit: &WorkUnit, error: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub max_attempts: u32,
    /// Delay before the first retry, doubled for every further attempt.
    pub retry_backoff: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        WorkerOptions {
            concurrency: 2,
            poll_interval: Duration::from_millis(500),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(5),
        }
    }
}

pub struct Worker {
    queue: SqliteTaskQueue,
    handler: Arc<dyn TaskHandler>,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(queue: SqliteTaskQueue, handler: Arc<dyn TaskHandler>, options: WorkerOptions) -> Self {
        Worker {
            queue,
            handler,
            options,
        }
    }

    /// Claims and runs one due task. Returns false when nothing was due.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(task) = self.queue.claim_due(Utc::now()).await? else {
            return Ok(false);
        };
        self.process(task).await?;
        Ok(true)
    }

    /// Runs due tasks until none are left. Returns how many ran.
    pub async fn drain(&self) -> Result<usize> {
        let mut count = 0;
        while self.run_once().await? {
            count += 1;
        }
        Ok(count)
    }

    async fn process(&self, task: ClaimedTask) -> Result<()> {
        let kind = task.unit.kind().as_str();
        match self.handler.handle(&task.unit).await {
            Ok(()) => {
                debug!(task = task.id, kind, "Task finished");
                self.queue.complete(task.id).await?;
            }
            Err(e) if task.attempts < self.options.max_attempts => {
                let delay = self.options.retry_backoff * 2u32.pow(task.attempts.saturating_sub(1));
                warn!(task = task.id, kind, attempts = task.attempts, error = %e, "Task failed, retrying");
                let not_before = Utc::now() + chrono::Duration::from_std(delay)?;
                self.queue.retry(task.id, &format!("{e:#}"), not_before).await?;
            }
            Err(e) => {
                let message = format!("{e:#}");
                error!(task = task.id, kind, attempts = task.attempts, error = %message, "Task failed, giving up");
                self.queue.fail(task.id, &message).await?;
                if let Err(e) = self.handler.abandon(&task.unit, &message).await {
                    error!(task = task.id, error = %e, "Failed to reconcile abandoned task");
                }
            }
        }
        Ok(())
    }

    /// Starts the polling loops. They stop once `shutdown` turns true.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.options.concurrency.max(1))
            .map(|slot| {
                let worker = self.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    debug!(slot, "Worker started");
                    while !*shutdown.borrow() {
                        let idle = match worker.run_once().await {
                            Ok(ran) => !ran,
                            Err(e) => {
                                error!(slot, error = %e, "Worker poll failed");
                                true
                            }
                        };
                        if idle {
                            tokio::select! {
                                _ = tokio::time::sleep(worker.options.poll_interval) => {}
                                _ = shutdown.changed() => {}
                            }
                        }
                    }
                    debug!(slot, "Worker stopped");
                })
            })
            .collect()
    }
}
