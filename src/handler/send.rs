use std::collections::HashMap;
use tracing::{info, instrument, warn};

use crate::bounce::{self, BounceKind};
use crate::delivery::{RecipientOutcome, RecipientStatus};
use crate::handler::{Handlers, repo_error};
use crate::models::{DomainStatus, EmailEventType, EmailId, EmailStatus};
use crate::queue::HandlerError;

impl Handlers {
    /// Load, sign and deliver one email, then record per-recipient
    /// events and fan delivery webhooks out. Safe to re-run: recipients
    /// with a terminal event are not attempted again.
    #[instrument(skip(self), fields(email_id = %email_id))]
    pub(super) async fn handle_send(&self, email_id: EmailId) -> Result<(), HandlerError> {
        let email = self.emails.get(email_id).await.map_err(repo_error)?;

        if email.status.is_terminal() {
            info!(status = email.status.as_str(), "email already settled");
            return Ok(());
        }

        // suppression check precedes any side effect
        let all_recipients: Vec<String> = email
            .to_emails
            .iter()
            .chain(&email.cc_emails)
            .chain(&email.bcc_emails)
            .cloned()
            .collect();
        let suppressed = self
            .suppressions
            .suppressed_among(email.team_id, &all_recipients)
            .await
            .map_err(repo_error)?;

        if !suppressed.is_empty() {
            warn!(?suppressed, "refusing to send to suppressed recipients");
            for recipient in &suppressed {
                self.events
                    .insert(
                        email.id,
                        EmailEventType::Bounced,
                        None,
                        Some("recipient is on the suppression list"),
                        Some(recipient),
                    )
                    .await
                    .map_err(repo_error)?;
            }
            return Err(HandlerError::permanent(format!(
                "{} recipient(s) are suppressed",
                suppressed.len()
            )));
        }

        let domain = self
            .domains
            .find_for_sender(email.team_id, email.sender_domain())
            .await
            .map_err(repo_error)?
            .ok_or_else(|| {
                HandlerError::permanent(format!(
                    "sending domain {} is not registered for this team",
                    email.sender_domain()
                ))
            })?;

        if domain.status != DomainStatus::Verified {
            return Err(HandlerError::permanent(format!(
                "sending domain {} is not verified",
                domain.name
            )));
        }

        self.emails
            .update_status(email.id, EmailStatus::Sending)
            .await
            .map_err(repo_error)?;

        let mut outgoing = email.to_outgoing();

        // a retried task only covers recipients without a settled outcome
        let settled = self
            .events
            .settled_recipients(email.id)
            .await
            .map_err(repo_error)?;
        if !settled.is_empty() {
            let keep = |addr: &String| !settled.contains(&addr.trim().to_lowercase());
            outgoing.to.retain(keep);
            outgoing.cc.retain(keep);
            outgoing.bcc.retain(keep);

            if outgoing.collect_recipients().is_empty() {
                info!("every recipient already settled, finalizing");
                return self.finalize(&email, &HashMap::new()).await;
            }
        }

        if domain.click_tracking || domain.open_tracking {
            if let Some(html) = outgoing.html_body.take() {
                let html = self
                    .inject_tracking(
                        &html,
                        email.id,
                        domain.click_tracking,
                        domain.open_tracking,
                    )
                    .await
                    .map_err(repo_error)?;
                outgoing.html_body = Some(html);
            }
        }

        // PermanentDeliveryError: a key that does not decrypt will not
        // start decrypting on retry
        let signing_key = domain
            .signing_key(&self.vault)
            .map_err(|err| HandlerError::permanent(format!("DKIM signing failed: {err}")))?;

        let result = self
            .sender
            .send(&outgoing, Some(signing_key), domain.tls_policy, &self.shutdown)
            .await
            .map_err(|err| match err {
                crate::delivery::SendError::Dkim(err) => {
                    HandlerError::permanent(format!("DKIM signing failed: {err}"))
                }
                other => HandlerError::permanent(other),
            })?;

        for (recipient, outcome) in &result.recipients {
            self.events
                .insert(
                    email.id,
                    event_for_outcome(outcome),
                    (outcome.code > 0).then_some(outcome.code as i32),
                    Some(&outcome.message),
                    Some(recipient),
                )
                .await
                .map_err(repo_error)?;
        }

        self.finalize(&email, &result.recipients).await
    }

    /// Fold the recipient outcomes into the email status, fan out the
    /// webhooks, and decide whether the queue should retry.
    async fn finalize(
        &self,
        email: &crate::models::Email,
        outcomes: &HashMap<String, RecipientOutcome>,
    ) -> Result<(), HandlerError> {
        // a finalize on retry still sees old events
        let events = self.events.list_for(email.id).await.map_err(repo_error)?;
        let status = dominant_status(outcomes, had_sent_event(&events));

        let changed = self
            .emails
            .update_status(email.id, status)
            .await
            .map_err(repo_error)?;

        if changed {
            if let Some(broadcast_id) = email.broadcast_id {
                let sent = status == EmailStatus::Sent;
                if status == EmailStatus::Sent || status == EmailStatus::Failed || status == EmailStatus::Bounced {
                    if let Err(err) = self
                        .broadcasts
                        .record_outcome(crate::models::BroadcastId::from(broadcast_id), sent)
                        .await
                    {
                        warn!("failed to update broadcast counters: {err}");
                    }
                }
            }
        }

        for (event_type, statuses) in [
            ("email.sent", RecipientStatus::Sent),
            ("email.deferred", RecipientStatus::Deferred),
        ]
        .map(|(name, wanted)| (name, recipients_with(outcomes, wanted)))
        {
            if !statuses.is_empty() {
                self.dispatch_email_event(email, event_type, &statuses).await;
            }
        }

        let bounced = failed_recipients(outcomes, false);
        if !bounced.is_empty() {
            self.dispatch_email_event(email, "email.bounced", &bounced).await;
        }
        let complained = failed_recipients(outcomes, true);
        if !complained.is_empty() {
            self.dispatch_email_event(email, "email.complained", &complained).await;
        }

        if status == EmailStatus::Deferred {
            self.emails
                .increment_retry(email.id)
                .await
                .map_err(repo_error)?;
            return Err(HandlerError::transient(
                "one or more recipients deferred, retrying",
            ));
        }

        Ok(())
    }

    async fn dispatch_email_event(
        &self,
        email: &crate::models::Email,
        event_type: &str,
        recipients: &[String],
    ) {
        let payload = serde_json::json!({
            "email_id": email.id,
            "message_id": email.message_id,
            "from": email.from_email,
            "subject": email.subject,
            "recipients": recipients,
        });

        if let Err(err) = self
            .dispatcher
            .dispatch(email.team_id, event_type, payload)
            .await
        {
            warn!(event_type, "failed to dispatch webhook event: {err}");
        }
    }
}

/// Which append-only event a recipient outcome produces.
fn event_for_outcome(outcome: &RecipientOutcome) -> EmailEventType {
    match outcome.status {
        RecipientStatus::Sent => EmailEventType::Sent,
        RecipientStatus::Deferred => EmailEventType::Deferred,
        RecipientStatus::Failed => {
            if outcome.permanent
                && bounce::classify(outcome.code, &outcome.message).kind == BounceKind::Complaint
            {
                EmailEventType::Complained
            } else if outcome.permanent {
                EmailEventType::Bounced
            } else {
                // failed without a verdict (e.g. cancellation)
                EmailEventType::Deferred
            }
        }
    }
}

/// The email-level status that dominates a set of recipient outcomes.
/// Deferred wins so the task retries; then partial success counts as
/// sent; a fully-failed send distinguishes bounces from other failures.
fn dominant_status(
    outcomes: &HashMap<String, RecipientOutcome>,
    previously_sent: bool,
) -> EmailStatus {
    let any = |status: RecipientStatus| outcomes.values().any(|o| o.status == status);

    if any(RecipientStatus::Deferred)
        || outcomes
            .values()
            .any(|o| o.status == RecipientStatus::Failed && !o.permanent)
    {
        EmailStatus::Deferred
    } else if any(RecipientStatus::Sent) || previously_sent {
        EmailStatus::Sent
    } else if outcomes
        .values()
        .any(|o| o.status == RecipientStatus::Failed && o.permanent)
    {
        EmailStatus::Bounced
    } else {
        EmailStatus::Sent
    }
}

fn had_sent_event(events: &[crate::models::EmailEvent]) -> bool {
    events
        .iter()
        .any(|event| event.event_type == EmailEventType::Sent)
}

fn recipients_with(
    outcomes: &HashMap<String, RecipientOutcome>,
    wanted: RecipientStatus,
) -> Vec<String> {
    let mut recipients: Vec<String> = outcomes
        .iter()
        .filter(|(_, o)| o.status == wanted)
        .map(|(r, _)| r.clone())
        .collect();
    recipients.sort();
    recipients
}

/// Permanently failed recipients, split into complaints and bounces.
fn failed_recipients(
    outcomes: &HashMap<String, RecipientOutcome>,
    complaints: bool,
) -> Vec<String> {
    let mut recipients: Vec<String> = outcomes
        .iter()
        .filter(|(_, o)| o.status == RecipientStatus::Failed && o.permanent)
        .filter(|(_, o)| {
            let is_complaint =
                bounce::classify(o.code, &o.message).kind == BounceKind::Complaint;
            is_complaint == complaints
        })
        .map(|(r, _)| r.clone())
        .collect();
    recipients.sort();
    recipients
}

#[cfg(test)]
mod test {
    use super::*;

    fn outcome(status: RecipientStatus, code: u16, message: &str, permanent: bool) -> RecipientOutcome {
        RecipientOutcome {
            status,
            code,
            message: message.to_string(),
            permanent,
        }
    }

    fn outcomes(entries: &[(&str, RecipientOutcome)]) -> HashMap<String, RecipientOutcome> {
        entries
            .iter()
            .map(|(r, o)| (r.to_string(), o.clone()))
            .collect()
    }

    #[test]
    fn all_sent_is_sent() {
        let set = outcomes(&[
            ("a@x", outcome(RecipientStatus::Sent, 250, "ok", false)),
            ("b@x", outcome(RecipientStatus::Sent, 250, "ok", false)),
        ]);
        assert_eq!(dominant_status(&set, false), EmailStatus::Sent);
    }

    #[test]
    fn any_deferral_dominates() {
        let set = outcomes(&[
            ("a@x", outcome(RecipientStatus::Sent, 250, "ok", false)),
            ("b@x", outcome(RecipientStatus::Deferred, 421, "busy", false)),
        ]);
        assert_eq!(dominant_status(&set, false), EmailStatus::Deferred);
    }

    #[test]
    fn all_hard_failures_bounce() {
        let set = outcomes(&[
            ("a@x", outcome(RecipientStatus::Failed, 550, "unknown", true)),
        ]);
        assert_eq!(dominant_status(&set, false), EmailStatus::Bounced);
    }

    #[test]
    fn partial_success_counts_as_sent() {
        let set = outcomes(&[
            ("a@x", outcome(RecipientStatus::Sent, 250, "ok", false)),
            ("b@x", outcome(RecipientStatus::Failed, 550, "unknown", true)),
        ]);
        assert_eq!(dominant_status(&set, false), EmailStatus::Sent);
    }

    #[test]
    fn empty_outcomes_fall_back_to_event_history() {
        assert_eq!(dominant_status(&HashMap::new(), true), EmailStatus::Sent);
        // nothing attempted, nothing settled before: nothing to say but sent
        assert_eq!(dominant_status(&HashMap::new(), false), EmailStatus::Sent);
    }

    #[test]
    fn outcome_events_follow_classification() {
        assert_eq!(
            event_for_outcome(&outcome(RecipientStatus::Sent, 250, "ok", false)),
            EmailEventType::Sent
        );
        assert_eq!(
            event_for_outcome(&outcome(RecipientStatus::Deferred, 421, "busy", false)),
            EmailEventType::Deferred
        );
        assert_eq!(
            event_for_outcome(&outcome(RecipientStatus::Failed, 550, "user unknown", true)),
            EmailEventType::Bounced
        );
        assert_eq!(
            event_for_outcome(&outcome(
                RecipientStatus::Failed,
                554,
                "rejected as spam",
                true
            )),
            EmailEventType::Complained
        );
        // cancellation carries no verdict
        assert_eq!(
            event_for_outcome(&outcome(RecipientStatus::Failed, 0, "context cancelled", false)),
            EmailEventType::Deferred
        );
    }

    #[test]
    fn failed_recipients_split_by_complaint() {
        let set = outcomes(&[
            ("spam@x", outcome(RecipientStatus::Failed, 554, "blocked for spam", true)),
            ("gone@x", outcome(RecipientStatus::Failed, 550, "user unknown", true)),
            ("ok@x", outcome(RecipientStatus::Sent, 250, "ok", false)),
        ]);

        assert_eq!(failed_recipients(&set, true), vec!["spam@x"]);
        assert_eq!(failed_recipients(&set, false), vec!["gone@x"]);
        assert_eq!(recipients_with(&set, RecipientStatus::Sent), vec!["ok@x"]);
    }
}
