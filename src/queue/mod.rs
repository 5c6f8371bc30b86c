use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, aio::ConnectionManager};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

use crate::models::{BroadcastId, DomainId, EmailId, ImportJobId, TenantId, WebhookEventId};

pub mod worker;

pub use worker::{HandlerError, TaskHandler, Worker};

const SCHEDULED_KEY: &str = "sendmill:queue:scheduled";
const PROMOTE_BATCH: isize = 100;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("could not serialize task: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    #[serde(rename = "email:send")]
    EmailSend,
    #[serde(rename = "email:batch")]
    EmailBatch,
    #[serde(rename = "broadcast:send")]
    BroadcastSend,
    #[serde(rename = "domain:verify")]
    DomainVerify,
    #[serde(rename = "bounce:parse")]
    BounceParse,
    #[serde(rename = "inbound:process")]
    InboundProcess,
    #[serde(rename = "webhook:deliver")]
    WebhookDeliver,
    #[serde(rename = "metrics:aggregate")]
    MetricsAggregate,
    #[serde(rename = "contact:import")]
    ContactImport,
    #[serde(rename = "cleanup")]
    Cleanup,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::EmailSend => "email:send",
            TaskType::EmailBatch => "email:batch",
            TaskType::BroadcastSend => "broadcast:send",
            TaskType::DomainVerify => "domain:verify",
            TaskType::BounceParse => "bounce:parse",
            TaskType::InboundProcess => "inbound:process",
            TaskType::WebhookDeliver => "webhook:deliver",
            TaskType::MetricsAggregate => "metrics:aggregate",
            TaskType::ContactImport => "contact:import",
            TaskType::Cleanup => "cleanup",
        }
    }

    /// Which named queue this task type lands on.
    pub fn queue(&self) -> QueueName {
        match self {
            TaskType::EmailSend => QueueName::Critical,
            TaskType::EmailBatch
            | TaskType::BroadcastSend
            | TaskType::DomainVerify
            | TaskType::BounceParse
            | TaskType::InboundProcess
            | TaskType::WebhookDeliver => QueueName::Default,
            TaskType::MetricsAggregate | TaskType::ContactImport | TaskType::Cleanup => {
                QueueName::Low
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Critical,
    Default,
    Low,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Critical => "critical",
            QueueName::Default => "default",
            QueueName::Low => "low",
        }
    }

    fn key(&self) -> String {
        format!("sendmill:queue:{}", self.as_str())
    }

    fn processing_key(&self) -> String {
        format!("sendmill:queue:{}:processing", self.as_str())
    }
}

/// A unit of work on the durable queue. The payload is JSON so handlers
/// evolve without queue migrations; retry bookkeeping travels with the
/// task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub retried: u32,
    pub max_retries: u32,
}

impl Task {
    pub fn new(
        task_type: TaskType,
        payload: &impl Serialize,
        max_retries: u32,
    ) -> Result<Self, QueueError> {
        Ok(Self {
            id: Uuid::new_v4(),
            task_type,
            payload: serde_json::to_value(payload)?,
            retried: 0,
            max_retries,
        })
    }

    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, QueueError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

// Typed payloads, one per task type.

#[derive(Debug, Serialize, Deserialize)]
pub struct SendEmailPayload {
    pub email_id: EmailId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchPayload {
    pub email_ids: Vec<EmailId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BroadcastPayload {
    pub broadcast_id: BroadcastId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DomainVerifyPayload {
    pub domain_id: DomainId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BounceParsePayload {
    pub team_id: TenantId,
    /// Raw DSN message, base64-encoded.
    pub raw_message: String,
    pub email_id: Option<EmailId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InboundPayload {
    pub team_id: TenantId,
    /// Raw inbound message, base64-encoded.
    pub raw_message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookDeliverPayload {
    pub webhook_event_id: WebhookEventId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsAggregatePayload {
    pub window_hours: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContactImportPayload {
    pub import_job_id: ImportJobId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CleanupPayload {
    pub retention_days: u32,
}

/// The capability handlers and services use to put work on the queue.
/// Backed by Redis in production, by a vector in tests.
#[async_trait]
pub trait Enqueuer: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<(), QueueError>;
    async fn enqueue_in(&self, task: Task, delay: Duration) -> Result<(), QueueError>;
}

/// A task popped from a queue, held on the processing list until acked.
#[derive(Debug)]
pub struct Delivery {
    pub task: Task,
    raw: String,
    queue: QueueName,
}

#[derive(Clone)]
pub struct Queue {
    redis: ConnectionManager,
}

impl Queue {
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }

    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Move due scheduled tasks onto their target queues. Runs
    /// periodically from the worker; losing a race with a sibling node
    /// at worst duplicates a task, which handlers tolerate.
    pub async fn promote_due(&self) -> Result<u64, QueueError> {
        let mut redis = self.redis.clone();
        let now = Utc::now().timestamp_millis();

        let due: Vec<String> = redis
            .zrangebyscore_limit(SCHEDULED_KEY, 0, now, 0, PROMOTE_BATCH)
            .await?;

        let mut promoted = 0;
        for raw in due {
            let Ok(task) = serde_json::from_str::<Task>(&raw) else {
                let _: () = redis.zrem(SCHEDULED_KEY, &raw).await?;
                continue;
            };

            let removed: i64 = redis.zrem(SCHEDULED_KEY, &raw).await?;
            if removed > 0 {
                let _: () = redis.lpush(task.task_type.queue().key(), &raw).await?;
                promoted += 1;
            }
        }

        Ok(promoted)
    }

    /// Pop one task, trying queues in the given order. The task moves to
    /// a processing list so a crashed worker leaves evidence behind.
    pub async fn pop(&self, order: &[QueueName]) -> Result<Option<Delivery>, QueueError> {
        let mut redis = self.redis.clone();

        for queue in order {
            let raw: Option<String> = redis::cmd("LMOVE")
                .arg(queue.key())
                .arg(queue.processing_key())
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut redis)
                .await?;

            if let Some(raw) = raw {
                match serde_json::from_str::<Task>(&raw) {
                    Ok(task) => {
                        trace!(task_type = task.task_type.as_str(), "popped task");
                        return Ok(Some(Delivery {
                            task,
                            raw,
                            queue: *queue,
                        }));
                    }
                    Err(err) => {
                        // poison entry, drop it
                        tracing::error!("discarding malformed task payload: {err}");
                        let _: () = redis.lrem(queue.processing_key(), 1, &raw).await?;
                    }
                }
            }
        }

        Ok(None)
    }

    /// Remove a completed (or re-scheduled) task from the processing
    /// list.
    pub async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut redis = self.redis.clone();
        let _: () = redis
            .lrem(delivery.queue.processing_key(), 1, &delivery.raw)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Enqueuer for Queue {
    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        let mut redis = self.redis.clone();
        let raw = serde_json::to_string(&task)?;
        trace!(task_type = task.task_type.as_str(), "enqueueing task");
        let _: () = redis.lpush(task.task_type.queue().key(), raw).await?;
        Ok(())
    }

    async fn enqueue_in(&self, task: Task, delay: Duration) -> Result<(), QueueError> {
        let mut redis = self.redis.clone();
        let raw = serde_json::to_string(&task)?;
        let run_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let _: () = redis.zadd(SCHEDULED_KEY, raw, run_at).await?;
        Ok(())
    }
}

/// Retry schedule: attempt n waits `delays[n]`, clamped to the last slot.
#[derive(Debug, Clone)]
pub struct Backoff {
    delays: Vec<Duration>,
}

impl Backoff {
    pub fn new(delays: Vec<Duration>) -> Self {
        debug_assert!(!delays.is_empty());
        Self { delays }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let index = (attempt as usize).min(self.delays.len() - 1);
        self.delays[index]
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(vec![
            Duration::from_secs(30),
            Duration::from_secs(2 * 60),
            Duration::from_secs(10 * 60),
            Duration::from_secs(30 * 60),
            Duration::from_secs(2 * 60 * 60),
        ])
    }
}

/// Test double recording enqueued tasks instead of talking to Redis.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryEnqueuer {
    pub tasks: std::sync::Mutex<Vec<Task>>,
}

#[cfg(test)]
#[async_trait]
impl Enqueuer for MemoryEnqueuer {
    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }

    async fn enqueue_in(&self, task: Task, _delay: Duration) -> Result<(), QueueError> {
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn task_wire_format_round_trips() {
        let task = Task::new(
            TaskType::EmailSend,
            &SendEmailPayload {
                email_id: EmailId::from(Uuid::new_v4()),
            },
            5,
        )
        .unwrap();

        let raw = serde_json::to_string(&task).unwrap();
        assert!(raw.contains("\"type\":\"email:send\""));

        let parsed: Task = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.task_type, TaskType::EmailSend);
        assert_eq!(parsed.max_retries, 5);

        let payload: SendEmailPayload = parsed.payload_as().unwrap();
        let original: SendEmailPayload = task.payload_as().unwrap();
        assert_eq!(payload.email_id, original.email_id);
    }

    #[test]
    fn task_types_map_to_queues() {
        assert_eq!(TaskType::EmailSend.queue(), QueueName::Critical);
        assert_eq!(TaskType::WebhookDeliver.queue(), QueueName::Default);
        assert_eq!(TaskType::Cleanup.queue(), QueueName::Low);
    }

    #[test]
    fn backoff_clamps_to_the_last_slot() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::from_secs(30));
        assert_eq!(backoff.delay(1), Duration::from_secs(120));
        assert_eq!(backoff.delay(4), Duration::from_secs(7200));
        // past the end of the schedule
        assert_eq!(backoff.delay(17), Duration::from_secs(7200));
    }

    #[tokio::test]
    async fn memory_enqueuer_records_tasks() {
        let enqueuer = MemoryEnqueuer::default();
        let task = Task::new(TaskType::Cleanup, &CleanupPayload { retention_days: 30 }, 1).unwrap();
        enqueuer.enqueue(task).await.unwrap();

        let tasks = enqueuer.tasks.lock().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, TaskType::Cleanup);
    }
}
