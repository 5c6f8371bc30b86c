use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Error, TenantId};

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref,
    sqlx::Type, FromStr,
)]
#[sqlx(transparent)]
pub struct InboundEmailId(Uuid);

/// A message received for one of the platform's domains, normalized from
/// its raw form. Attachment payloads live in blob storage; only their
/// metadata is kept here.
#[derive(Debug, Clone)]
pub struct NewInboundEmail {
    pub team_id: TenantId,
    pub from_email: String,
    pub to_emails: Vec<String>,
    pub subject: String,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub attachments: Vec<InboundAttachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundAttachment {
    pub filename: String,
    pub content_type: String,
    pub size: usize,
    /// Key in the blob store where the payload was written.
    pub blob_key: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InboundEmail {
    pub id: InboundEmailId,
    pub team_id: TenantId,
    pub from_email: String,
    pub to_emails: Vec<String>,
    pub subject: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct InboundEmailRepository {
    pool: sqlx::PgPool,
}

impl InboundEmailRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, new: NewInboundEmail) -> Result<InboundEmail, Error> {
        let inbound = sqlx::query_as::<_, InboundEmail>(
            r#"
            INSERT INTO inbound_emails (team_id, from_email, to_emails, subject,
                                        text_body, html_body, attachments)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, team_id, from_email, to_emails, subject, created_at
            "#,
        )
        .bind(new.team_id)
        .bind(&new.from_email)
        .bind(&new.to_emails)
        .bind(&new.subject)
        .bind(&new.text_body)
        .bind(&new.html_body)
        .bind(serde_json::to_value(&new.attachments)?)
        .fetch_one(&self.pool)
        .await?;

        Ok(inbound)
    }
}
