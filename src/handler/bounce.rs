use base64ct::{Base64, Encoding};
use tracing::{info, instrument, warn};

use crate::bounce::{self, BounceKind};
use crate::handler::{Handlers, repo_error};
use crate::models::{EmailEventType, EmailStatus, SuppressionReason};
use crate::queue::{BounceParsePayload, HandlerError, Task};

impl Handlers {
    /// Classify a raw DSN, record the bounce against the original email
    /// when known, suppress the recipient when policy says so, and fan
    /// the webhook out.
    #[instrument(skip(self, task))]
    pub(super) async fn handle_bounce_parse(&self, task: &Task) -> Result<(), HandlerError> {
        let payload: BounceParsePayload = Self::payload(task)?;

        let raw = Base64::decode_vec(&payload.raw_message)
            .map_err(|_| HandlerError::permanent("bounce payload is not valid base64"))?;

        let Some(verdict) = bounce::classify_dsn(&raw) else {
            info!("message is not a delivery status notification, ignoring");
            return Ok(());
        };

        info!(
            kind = ?verdict.kind,
            code = verdict.code,
            recipient = verdict.recipient.as_deref().unwrap_or("-"),
            "classified bounce"
        );

        let event_type = match verdict.kind {
            BounceKind::Hard => EmailEventType::Bounced,
            BounceKind::Complaint => EmailEventType::Complained,
            BounceKind::Soft => EmailEventType::Deferred,
        };

        if let Some(email_id) = payload.email_id {
            self.events
                .insert(
                    email_id,
                    event_type,
                    Some(verdict.code as i32),
                    Some(&verdict.message),
                    verdict.recipient.as_deref(),
                )
                .await
                .map_err(repo_error)?;

            if verdict.permanent {
                self.emails
                    .update_status(email_id, EmailStatus::Bounced)
                    .await
                    .map_err(repo_error)?;
            }
        }

        if let Some(recipient) = &verdict.recipient {
            let reason = match verdict.kind {
                BounceKind::Hard if verdict.permanent => Some(SuppressionReason::HardBounce),
                BounceKind::Complaint => Some(SuppressionReason::Complaint),
                _ => None,
            };

            if let Some(reason) = reason {
                if self.suppression_permitted(payload.team_id, reason).await {
                    self.suppressions
                        .insert(payload.team_id, recipient, reason)
                        .await
                        .map_err(repo_error)?;
                    info!(recipient = %recipient, reason = reason.as_str(), "recipient suppressed");
                }
            }
        }

        let webhook_event = match verdict.kind {
            BounceKind::Complaint => "email.complained",
            _ => "email.bounced",
        };
        let webhook_payload = serde_json::json!({
            "email_id": payload.email_id,
            "recipient": verdict.recipient,
            "code": verdict.code,
            "message": verdict.message,
            "permanent": verdict.permanent,
        });
        if let Err(err) = self
            .dispatcher
            .dispatch(payload.team_id, webhook_event, webhook_payload)
            .await
        {
            warn!("failed to dispatch bounce webhook: {err}");
        }

        Ok(())
    }

    /// Suppression needs both the deployment default and the tenant's
    /// own policy to agree.
    async fn suppression_permitted(
        &self,
        tenant: crate::models::TenantId,
        reason: SuppressionReason,
    ) -> bool {
        let global = match reason {
            SuppressionReason::HardBounce => self.settings.suppress_on_hard_bounce,
            SuppressionReason::Complaint => self.settings.suppress_on_complaint,
            SuppressionReason::Manual => true,
        };
        if !global {
            return false;
        }

        match self.teams.suppression_policy(tenant).await {
            Ok(policy) => match reason {
                SuppressionReason::HardBounce => policy.suppress_on_hard_bounce,
                SuppressionReason::Complaint => policy.suppress_on_complaint,
                SuppressionReason::Manual => true,
            },
            Err(err) => {
                warn!("could not load tenant suppression policy, not suppressing: {err}");
                false
            }
        }
    }
}
