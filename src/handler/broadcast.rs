use tracing::{info, instrument, warn};

use crate::handler::{Handlers, repo_error};
use crate::models::{BroadcastId, BroadcastStatus, NewEmail};
use crate::queue::{HandlerError, SendEmailPayload, Task, TaskType};

const PAGE_SIZE: i64 = 500;

impl Handlers {
    /// Fan a broadcast out into individual sends, paging through the
    /// audience by contact id. The dispatch cursor is persisted after
    /// every page, so a crashed or retried task resumes where it
    /// stopped instead of double-enqueueing the whole audience.
    #[instrument(skip(self), fields(broadcast_id = %broadcast_id))]
    pub(super) async fn handle_broadcast(
        &self,
        broadcast_id: BroadcastId,
        max_retries: u32,
    ) -> Result<(), HandlerError> {
        let broadcast = self.broadcasts.get(broadcast_id).await.map_err(repo_error)?;

        match broadcast.status {
            BroadcastStatus::Sent | BroadcastStatus::Canceled => {
                info!(status = broadcast.status.as_str(), "broadcast already settled");
                return Ok(());
            }
            BroadcastStatus::Draft => {
                return Err(HandlerError::permanent(
                    "broadcast is still a draft, refusing to send",
                ));
            }
            BroadcastStatus::Queued | BroadcastStatus::Sending => {}
        }

        self.broadcasts
            .update_status(broadcast.id, BroadcastStatus::Sending)
            .await
            .map_err(repo_error)?;

        let mut cursor = broadcast.last_contact_id;
        loop {
            let page = self
                .contacts
                .page_after(broadcast.audience_id, cursor, PAGE_SIZE)
                .await
                .map_err(repo_error)?;

            if page.is_empty() {
                break;
            }

            let mut enqueued = 0;
            let last_id = page.last().expect("page is non-empty").id;

            for contact in page {
                if contact.unsubscribed {
                    continue;
                }
                if self
                    .suppressions
                    .is_suppressed(broadcast.team_id, &contact.email)
                    .await
                    .map_err(repo_error)?
                {
                    continue;
                }

                let email = match self
                    .emails
                    .create(NewEmail {
                        team_id: broadcast.team_id,
                        broadcast_id: Some(*broadcast.id),
                        from_email: broadcast.from_email.clone(),
                        to_emails: vec![contact.email.clone()],
                        subject: broadcast.subject.clone(),
                        html_body: broadcast.html_body.clone(),
                        text_body: broadcast.text_body.clone(),
                        ..Default::default()
                    })
                    .await
                {
                    Ok(email) => email,
                    Err(err) => {
                        warn!(contact = %contact.email, "failed to create broadcast email: {err}");
                        continue;
                    }
                };

                let task = Task::new(
                    TaskType::EmailSend,
                    &SendEmailPayload { email_id: email.id },
                    max_retries,
                )
                .map_err(HandlerError::transient)?;
                self.enqueuer
                    .enqueue(task)
                    .await
                    .map_err(HandlerError::transient)?;
                enqueued += 1;
            }

            self.broadcasts
                .advance_cursor(broadcast.id, last_id, enqueued)
                .await
                .map_err(repo_error)?;
            cursor = last_id;
        }

        self.broadcasts
            .update_status(broadcast.id, BroadcastStatus::Sent)
            .await
            .map_err(repo_error)?;

        info!("broadcast fan-out complete");
        Ok(())
    }
}
