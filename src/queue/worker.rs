use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::{Backoff, Delivery, Enqueuer, Queue, QueueName, Task};

const IDLE_POLL: Duration = Duration::from_millis(500);
const PROMOTE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum HandlerError {
    /// Worth another attempt after backoff: network trouble, database
    /// hiccups, 4xx SMTP weather.
    #[error("transient: {0}")]
    Transient(String),
    /// Retrying will not help; fail the task now.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Self::Transient(err.to_string())
    }

    pub fn permanent(err: impl std::fmt::Display) -> Self {
        Self::Permanent(err.to_string())
    }
}

/// The typed dispatch surface the worker drives. One implementation
/// routes on `task.task_type`; tests substitute their own.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<(), HandlerError>;

    /// Fired once when a task exhausts its retries (or fails
    /// permanently); marks the owning entity failed.
    async fn on_terminal_failure(&self, task: &Task, error: &HandlerError);
}

/// Expand per-queue weights into the polling rotation, so a busy
/// critical queue cannot starve the others entirely.
pub fn queue_rotation(critical: u8, default: u8, low: u8) -> Vec<QueueName> {
    let mut rotation = Vec::new();
    let longest = critical.max(default).max(low);

    for round in 0..longest {
        if round < critical {
            rotation.push(QueueName::Critical);
        }
        if round < default {
            rotation.push(QueueName::Default);
        }
        if round < low {
            rotation.push(QueueName::Low);
        }
    }

    if rotation.is_empty() {
        rotation.push(QueueName::Default);
    }
    rotation
}

pub struct Worker {
    queue: Queue,
    handler: Arc<dyn TaskHandler>,
    backoff: Backoff,
    rotation: Vec<QueueName>,
    permits: Arc<Semaphore>,
    concurrency: usize,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        queue: Queue,
        handler: Arc<dyn TaskHandler>,
        backoff: Backoff,
        rotation: Vec<QueueName>,
        concurrency: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            handler,
            backoff,
            rotation,
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut offset = 0usize;
            let mut promote = tokio::time::interval(PROMOTE_INTERVAL);
            promote.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            info!("worker started");
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        info!("worker shutting down, draining in-flight tasks");
                        // every permit back home means no task is in flight
                        let _ = self.permits.acquire_many(self.concurrency as u32).await;
                        return;
                    }
                    _ = promote.tick() => {
                        if let Err(err) = self.queue.promote_due().await {
                            warn!("failed to promote scheduled tasks: {err}");
                        }
                        self.drain_available(&mut offset).await;
                    }
                }
            }
        })
    }

    /// Pop and dispatch until the queues are empty or permits run out.
    async fn drain_available(&self, offset: &mut usize) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                return;
            };

            // rotate the starting queue so weights actually matter
            let mut order = Vec::with_capacity(self.rotation.len());
            for i in 0..self.rotation.len() {
                order.push(self.rotation[(*offset + i) % self.rotation.len()]);
            }
            *offset = (*offset + 1) % self.rotation.len();

            let delivery = match self.queue.pop(&order).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    drop(permit);
                    tokio::time::sleep(IDLE_POLL).await;
                    return;
                }
                Err(err) => {
                    drop(permit);
                    warn!("queue pop failed: {err}");
                    tokio::time::sleep(IDLE_POLL).await;
                    return;
                }
            };

            let queue = self.queue.clone();
            let handler = self.handler.clone();
            let backoff = self.backoff.clone();
            tokio::spawn(async move {
                let _permit = permit;
                process(queue, handler, backoff, delivery).await;
            });
        }
    }
}

#[tracing::instrument(
    skip_all,
    fields(task_id = delivery.task.id.to_string(), task_type = delivery.task.task_type.as_str())
)]
async fn process(queue: Queue, handler: Arc<dyn TaskHandler>, backoff: Backoff, delivery: Delivery) {
    let task = &delivery.task;

    match handler.handle(task).await {
        Ok(()) => {
            debug!("task completed");
            if let Err(err) = queue.ack(&delivery).await {
                warn!("failed to ack completed task: {err}");
            }
        }
        Err(HandlerError::Transient(reason)) if task.retried < task.max_retries => {
            let delay = backoff.delay(task.retried);
            warn!(
                retried = task.retried,
                delay_secs = delay.as_secs(),
                "task failed, scheduling retry: {reason}"
            );

            let mut retry = task.clone();
            retry.retried += 1;

            if let Err(err) = queue.enqueue_in(retry, delay).await {
                error!("failed to schedule retry, task will re-run via processing list: {err}");
                return;
            }
            if let Err(err) = queue.ack(&delivery).await {
                warn!("failed to ack retried task: {err}");
            }
        }
        Err(err) => {
            error!("task failed terminally: {err}");
            handler.on_terminal_failure(task, &err).await;
            if let Err(ack_err) = queue.ack(&delivery).await {
                warn!("failed to ack terminally failed task: {ack_err}");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rotation_interleaves_by_weight() {
        let rotation = queue_rotation(2, 1, 1);
        assert_eq!(
            rotation,
            vec![
                QueueName::Critical,
                QueueName::Default,
                QueueName::Low,
                QueueName::Critical,
            ]
        );
    }

    #[test]
    fn rotation_never_comes_back_empty() {
        assert_eq!(queue_rotation(0, 0, 0), vec![QueueName::Default]);
    }

    #[test]
    fn rotation_with_default_weights_leads_with_critical() {
        let rotation = queue_rotation(6, 3, 1);
        assert_eq!(rotation[0], QueueName::Critical);
        assert_eq!(rotation.iter().filter(|q| **q == QueueName::Critical).count(), 6);
        assert_eq!(rotation.iter().filter(|q| **q == QueueName::Default).count(), 3);
        assert_eq!(rotation.iter().filter(|q| **q == QueueName::Low).count(), 1);
    }
}
