use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::config::Settings;
use crate::delivery::Sender;
use crate::dkim::KeyVault;
use crate::dns::DnsResolver;
use crate::models::{
    self, BroadcastRepository, BroadcastStatus, ContactRepository, DomainRepository,
    EmailEventRepository, EmailRepository, ImportJobRepository, ImportStatus,
    InboundEmailRepository, MetricsRepository, SuppressionRepository, TeamRepository,
    TrackingLinkRepository, WebhookEventRepository,
};
use crate::queue::{
    BroadcastPayload, ContactImportPayload, Enqueuer, HandlerError, SendEmailPayload, Task,
    TaskHandler, TaskType,
};
use crate::storage::BlobStore;
use crate::webhook::{WebhookDeliverer, WebhookDispatcher};

mod bounce;
mod broadcast;
mod domain;
mod import;
mod inbound;
mod maintenance;
mod send;
mod tracking;

/// The slice of configuration the handlers need at runtime.
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    /// Public base URL for tracking pixels and redirects.
    pub base_url: String,
    /// SPF include term domains must publish.
    pub spf_include: String,
    /// CNAME target for the per-domain bounce subdomain.
    pub return_path_target: String,
    pub suppress_on_hard_bounce: bool,
    pub suppress_on_complaint: bool,
    pub max_retries: u32,
}

impl HandlerSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            base_url: format!("https://{}", settings.smtp.hostname),
            spf_include: format!("include:spf.{}", settings.smtp.hostname),
            return_path_target: format!("rp.{}", settings.smtp.hostname),
            suppress_on_hard_bounce: settings.suppression.on_hard_bounce,
            suppress_on_complaint: settings.suppression.on_complaint,
            max_retries: settings.workers.max_retries,
        }
    }
}

/// Every typed task handler behind one dispatch surface. Cloning is
/// cheap; all fields are pools, channels or Arcs.
#[derive(Clone)]
pub struct Handlers {
    pub(crate) emails: EmailRepository,
    pub(crate) events: EmailEventRepository,
    pub(crate) domains: DomainRepository,
    pub(crate) suppressions: SuppressionRepository,
    pub(crate) teams: TeamRepository,
    pub(crate) broadcasts: BroadcastRepository,
    pub(crate) contacts: ContactRepository,
    pub(crate) import_jobs: ImportJobRepository,
    pub(crate) inbound: InboundEmailRepository,
    pub(crate) metrics: MetricsRepository,
    pub(crate) tracking: TrackingLinkRepository,
    pub(crate) webhook_events: WebhookEventRepository,
    pub(crate) sender: Sender,
    pub(crate) resolver: DnsResolver,
    pub(crate) vault: Arc<KeyVault>,
    pub(crate) dispatcher: WebhookDispatcher,
    pub(crate) deliverer: WebhookDeliverer,
    pub(crate) enqueuer: Arc<dyn Enqueuer>,
    pub(crate) storage: Arc<dyn BlobStore>,
    pub(crate) settings: HandlerSettings,
    pub(crate) shutdown: CancellationToken,
}

impl Handlers {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        sender: Sender,
        resolver: DnsResolver,
        vault: Arc<KeyVault>,
        dispatcher: WebhookDispatcher,
        deliverer: WebhookDeliverer,
        enqueuer: Arc<dyn Enqueuer>,
        storage: Arc<dyn BlobStore>,
        settings: HandlerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            emails: EmailRepository::new(pool.clone()),
            events: EmailEventRepository::new(pool.clone()),
            domains: DomainRepository::new(pool.clone()),
            suppressions: SuppressionRepository::new(pool.clone()),
            teams: TeamRepository::new(pool.clone()),
            broadcasts: BroadcastRepository::new(pool.clone()),
            contacts: ContactRepository::new(pool.clone()),
            import_jobs: ImportJobRepository::new(pool.clone()),
            inbound: InboundEmailRepository::new(pool.clone()),
            metrics: MetricsRepository::new(pool.clone()),
            tracking: TrackingLinkRepository::new(pool.clone()),
            webhook_events: WebhookEventRepository::new(pool),
            sender,
            resolver,
            vault,
            dispatcher,
            deliverer,
            enqueuer,
            storage,
            settings,
            shutdown,
        }
    }

    /// Payload decoding failure is permanent: the bytes will not improve
    /// on retry.
    fn payload<T: serde::de::DeserializeOwned>(task: &Task) -> Result<T, HandlerError> {
        task.payload_as()
            .map_err(|err| HandlerError::permanent(format!("malformed payload: {err}")))
    }
}

/// Database and repository errors are transient unless the row is gone.
pub(crate) fn repo_error(err: models::Error) -> HandlerError {
    match err {
        models::Error::NotFound(what) => {
            HandlerError::permanent(format!("entity not found: {what}"))
        }
        other => HandlerError::transient(other),
    }
}

#[async_trait]
impl TaskHandler for Handlers {
    async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
        match task.task_type {
            TaskType::EmailSend => {
                let payload: SendEmailPayload = Self::payload(task)?;
                self.handle_send(payload.email_id).await
            }
            TaskType::EmailBatch => self.handle_batch(task).await,
            TaskType::BroadcastSend => {
                let payload: BroadcastPayload = Self::payload(task)?;
                self.handle_broadcast(payload.broadcast_id, task.max_retries).await
            }
            TaskType::DomainVerify => {
                let payload: crate::queue::DomainVerifyPayload = Self::payload(task)?;
                self.handle_domain_verify(payload.domain_id).await
            }
            TaskType::BounceParse => self.handle_bounce_parse(task).await,
            TaskType::InboundProcess => self.handle_inbound(task).await,
            TaskType::WebhookDeliver => {
                let payload: crate::queue::WebhookDeliverPayload = Self::payload(task)?;
                self.handle_webhook_deliver(payload.webhook_event_id).await
            }
            TaskType::MetricsAggregate => self.handle_metrics(task).await,
            TaskType::ContactImport => {
                let payload: ContactImportPayload = Self::payload(task)?;
                self.handle_import(payload.import_job_id).await
            }
            TaskType::Cleanup => self.handle_cleanup(task).await,
        }
    }

    async fn on_terminal_failure(&self, task: &Task, error: &HandlerError) {
        match task.task_type {
            TaskType::EmailSend => {
                let Ok(payload) = task.payload_as::<SendEmailPayload>() else {
                    return;
                };
                if let Err(err) = self
                    .emails
                    .mark_failed(payload.email_id, &error.to_string())
                    .await
                {
                    error!(email_id = %payload.email_id, "failed to mark email failed: {err}");
                    return;
                }
                self.notify_email_failed(payload.email_id, &error.to_string())
                    .await;
            }
            TaskType::BroadcastSend => {
                let Ok(payload) = task.payload_as::<BroadcastPayload>() else {
                    return;
                };
                if let Err(err) = self
                    .broadcasts
                    .update_status(payload.broadcast_id, BroadcastStatus::Canceled)
                    .await
                {
                    error!(broadcast_id = %payload.broadcast_id, "failed to cancel broadcast: {err}");
                }
            }
            TaskType::ContactImport => {
                let Ok(payload) = task.payload_as::<ContactImportPayload>() else {
                    return;
                };
                if let Err(err) = self
                    .import_jobs
                    .finish(
                        payload.import_job_id,
                        ImportStatus::Failed,
                        0,
                        0,
                        0,
                        Some(&error.to_string()),
                    )
                    .await
                {
                    error!(import_job_id = %payload.import_job_id, "failed to mark import failed: {err}");
                }
            }
            // webhook:deliver records its own terminal state; the rest
            // have no owning entity to update
            _ => {
                warn!(
                    task_type = task.task_type.as_str(),
                    "task failed terminally: {error}"
                );
            }
        }
    }
}

impl Handlers {
    async fn handle_batch(&self, task: &Task) -> Result<(), HandlerError> {
        let payload: crate::queue::BatchPayload = Self::payload(task)?;

        for email_id in payload.email_ids {
            let send = Task::new(
                TaskType::EmailSend,
                &SendEmailPayload { email_id },
                task.max_retries,
            )
            .map_err(HandlerError::transient)?;

            self.enqueuer
                .enqueue(send)
                .await
                .map_err(HandlerError::transient)?;
        }

        Ok(())
    }

    async fn handle_webhook_deliver(
        &self,
        id: crate::models::WebhookEventId,
    ) -> Result<(), HandlerError> {
        use crate::webhook::DeliveryOutcome;

        match self.deliverer.deliver(id).await.map_err(repo_error)? {
            DeliveryOutcome::Delivered => Ok(()),
            // the queue drives the retry; the event row already carries
            // next_retry_at
            DeliveryOutcome::Retrying => Err(HandlerError::transient("delivery failed, retrying")),
            DeliveryOutcome::Exhausted => {
                Err(HandlerError::permanent("delivery attempts exhausted"))
            }
        }
    }

    async fn notify_email_failed(&self, email_id: crate::models::EmailId, reason: &str) {
        let Ok(email) = self.emails.get(email_id).await else {
            return;
        };

        let payload = serde_json::json!({
            "email_id": email_id,
            "reason": reason,
        });
        if let Err(err) = self
            .dispatcher
            .dispatch(email.team_id, "email.failed", payload)
            .await
        {
            error!(%email_id, "failed to dispatch email.failed webhook: {err}");
        }
    }
}
