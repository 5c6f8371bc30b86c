use base64ct::{Base64, Encoding};
use mail_parser::{MessageParser, MimeHeaders};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::handler::{Handlers, repo_error};
use crate::models::{InboundAttachment, NewInboundEmail};
use crate::queue::{HandlerError, InboundPayload, Task};

impl Handlers {
    /// Normalize a raw inbound message: extract envelope and bodies,
    /// move attachment payloads into blob storage, persist the record,
    /// and announce it to the tenant's webhooks.
    #[instrument(skip(self, task))]
    pub(super) async fn handle_inbound(&self, task: &Task) -> Result<(), HandlerError> {
        let payload: InboundPayload = Self::payload(task)?;

        let raw = Base64::decode_vec(&payload.raw_message)
            .map_err(|_| HandlerError::permanent("inbound payload is not valid base64"))?;

        let Some(parsed) = MessageParser::default().parse(&raw) else {
            return Err(HandlerError::permanent("inbound message does not parse"));
        };

        let from_email = parsed
            .from()
            .and_then(|from| from.iter().next())
            .and_then(|addr| addr.address())
            .unwrap_or_default()
            .to_string();

        let to_emails: Vec<String> = parsed
            .to()
            .map(|to| {
                to.iter()
                    .filter_map(|addr| addr.address())
                    .map(|a| a.to_string())
                    .collect()
            })
            .unwrap_or_default();

        let subject = parsed.subject().unwrap_or_default().to_string();
        let text_body = parsed.body_text(0).map(|body| body.into_owned());
        let html_body = parsed.body_html(0).map(|body| body.into_owned());

        let mut attachments = Vec::new();
        for part in parsed.attachments() {
            let filename = part
                .attachment_name()
                .unwrap_or("attachment.bin")
                .to_string();
            let content_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(subtype) => format!("{}/{subtype}", ct.ctype()),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());

            let contents = part.contents();
            let blob_key = format!("inbound/{}/{}", Uuid::new_v4(), sanitize(&filename));

            if let Err(err) = self.storage.put(&blob_key, contents).await {
                warn!(filename = %filename, "failed to store attachment: {err}");
                continue;
            }

            attachments.push(InboundAttachment {
                filename,
                content_type,
                size: contents.len(),
                blob_key,
            });
        }

        let stored = self
            .inbound
            .insert(NewInboundEmail {
                team_id: payload.team_id,
                from_email: from_email.clone(),
                to_emails: to_emails.clone(),
                subject: subject.clone(),
                text_body,
                html_body,
                attachments,
            })
            .await
            .map_err(repo_error)?;

        info!(inbound_id = %stored.id, from = %from_email, "stored inbound message");

        let webhook_payload = serde_json::json!({
            "inbound_email_id": stored.id,
            "from": from_email,
            "to": to_emails,
            "subject": subject,
        });
        if let Err(err) = self
            .dispatcher
            .dispatch(payload.team_id, "email.received", webhook_payload)
            .await
        {
            warn!("failed to dispatch email.received webhook: {err}");
        }

        Ok(())
    }
}

/// Keep attachment-derived blob keys path-safe.
fn sanitize(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.trim_matches(['.', '_']).is_empty() {
        "attachment.bin".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn filenames_become_path_safe() {
        assert_eq!(sanitize("report.pdf"), "report.pdf");
        assert_eq!(sanitize("../../etc/passwd"), "______etc_passwd");
        assert_eq!(sanitize("résumé.doc"), "r_sum_.doc");
        assert_eq!(sanitize("..."), "attachment.bin");
        assert_eq!(sanitize(""), "attachment.bin");
    }
}
