use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{Attachment, OutgoingMessage};
use crate::models::{Error, TenantId, text_enum};

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref,
    sqlx::Type, FromStr,
)]
#[sqlx(transparent)]
pub struct EmailId(Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    Queued,
    Sending,
    Sent,
    Delivered,
    Bounced,
    Failed,
    Deferred,
    Canceled,
}

text_enum!(EmailStatus {
    Queued => "queued",
    Sending => "sending",
    Sent => "sent",
    Delivered => "delivered",
    Bounced => "bounced",
    Failed => "failed",
    Deferred => "deferred",
    Canceled => "canceled",
});

impl EmailStatus {
    /// Terminal states are never left again, with the single exception of
    /// a delivery confirmation arriving for a sent message.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Sent | Self::Delivered | Self::Bounced | Self::Failed | Self::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailEventType {
    Queued,
    Sent,
    Delivered,
    Deferred,
    Bounced,
    Complained,
    Opened,
    Clicked,
    Unsubscribed,
}

text_enum!(EmailEventType {
    Queued => "queued",
    Sent => "sent",
    Delivered => "delivered",
    Deferred => "deferred",
    Bounced => "bounced",
    Complained => "complained",
    Opened => "opened",
    Clicked => "clicked",
    Unsubscribed => "unsubscribed",
});

#[derive(Debug, Clone)]
pub struct Email {
    pub id: EmailId,
    pub team_id: TenantId,
    pub broadcast_id: Option<Uuid>,
    pub from_email: String,
    pub to_emails: Vec<String>,
    pub cc_emails: Vec<String>,
    pub bcc_emails: Vec<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub headers: Vec<(String, String)>,
    pub attachments: Vec<Attachment>,
    pub status: EmailStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub idempotency_key: Option<String>,
    pub message_id: String,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Email {
    pub fn to_outgoing(&self) -> OutgoingMessage {
        OutgoingMessage {
            from: self.from_email.clone(),
            to: self.to_emails.clone(),
            cc: self.cc_emails.clone(),
            bcc: self.bcc_emails.clone(),
            reply_to: self.reply_to.clone(),
            subject: self.subject.clone(),
            text_body: self.text_body.clone(),
            html_body: self.html_body.clone(),
            attachments: self.attachments.clone(),
            headers: self.headers.clone(),
            message_id: self.message_id.clone(),
        }
    }

    pub fn sender_domain(&self) -> &str {
        self.from_email.rsplit_once('@').map(|(_, d)| d).unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct NewEmail {
    pub team_id: TenantId,
    pub broadcast_id: Option<Uuid>,
    pub from_email: String,
    pub to_emails: Vec<String>,
    pub cc_emails: Vec<String>,
    pub bcc_emails: Vec<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub headers: Vec<(String, String)>,
    pub attachments: Vec<Attachment>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

#[derive(sqlx::FromRow)]
struct PgEmail {
    id: EmailId,
    team_id: TenantId,
    broadcast_id: Option<Uuid>,
    from_email: String,
    to_emails: Vec<String>,
    cc_emails: Vec<String>,
    bcc_emails: Vec<String>,
    reply_to: Option<String>,
    subject: String,
    html_body: Option<String>,
    text_body: Option<String>,
    headers: serde_json::Value,
    attachments: serde_json::Value,
    status: String,
    scheduled_at: Option<DateTime<Utc>>,
    retry_count: i32,
    idempotency_key: Option<String>,
    message_id: String,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<PgEmail> for Email {
    type Error = Error;

    fn try_from(pg: PgEmail) -> Result<Self, Self::Error> {
        Ok(Self {
            id: pg.id,
            team_id: pg.team_id,
            broadcast_id: pg.broadcast_id,
            from_email: pg.from_email,
            to_emails: pg.to_emails,
            cc_emails: pg.cc_emails,
            bcc_emails: pg.bcc_emails,
            reply_to: pg.reply_to,
            subject: pg.subject,
            html_body: pg.html_body,
            text_body: pg.text_body,
            headers: serde_json::from_value(pg.headers)?,
            attachments: serde_json::from_value(pg.attachments)?,
            status: pg.status.parse()?,
            scheduled_at: pg.scheduled_at,
            retry_count: pg.retry_count,
            idempotency_key: pg.idempotency_key,
            message_id: pg.message_id,
            failure_reason: pg.failure_reason,
            created_at: pg.created_at,
        })
    }
}

const EMAIL_COLUMNS: &str = r#"
    id, team_id, broadcast_id, from_email, to_emails, cc_emails, bcc_emails,
    reply_to, subject, html_body, text_body, headers, attachments, status,
    scheduled_at, retry_count, idempotency_key, message_id, failure_reason,
    created_at
"#;

#[derive(Debug, Clone)]
pub struct EmailRepository {
    pool: sqlx::PgPool,
}

impl EmailRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: NewEmail) -> Result<Email, Error> {
        let message_id = format!(
            "{}@{}",
            Uuid::new_v4(),
            new.from_email.rsplit_once('@').map(|(_, d)| d).unwrap_or("localhost")
        );

        let row = sqlx::query_as::<_, PgEmail>(&format!(
            r#"
            INSERT INTO emails (team_id, broadcast_id, from_email, to_emails, cc_emails,
                                bcc_emails, reply_to, subject, html_body, text_body,
                                headers, attachments, scheduled_at, idempotency_key,
                                message_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING {EMAIL_COLUMNS}
            "#
        ))
        .bind(new.team_id)
        .bind(new.broadcast_id)
        .bind(&new.from_email)
        .bind(&new.to_emails)
        .bind(&new.cc_emails)
        .bind(&new.bcc_emails)
        .bind(&new.reply_to)
        .bind(&new.subject)
        .bind(&new.html_body)
        .bind(&new.text_body)
        .bind(serde_json::to_value(&new.headers)?)
        .bind(serde_json::to_value(&new.attachments)?)
        .bind(new.scheduled_at)
        .bind(&new.idempotency_key)
        .bind(&message_id)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    pub async fn get(&self, id: EmailId) -> Result<Email, Error> {
        sqlx::query_as::<_, PgEmail>(&format!(
            "SELECT {EMAIL_COLUMNS} FROM emails WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await?
        .try_into()
    }

    pub async fn find_by_idempotency_key(
        &self,
        tenant: TenantId,
        key: &str,
    ) -> Result<Option<Email>, Error> {
        sqlx::query_as::<_, PgEmail>(&format!(
            "SELECT {EMAIL_COLUMNS} FROM emails WHERE team_id = $1 AND idempotency_key = $2"
        ))
        .bind(tenant)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }

    /// Move an email into a new status. Transitions out of a terminal
    /// state are refused (sent → delivered being the one exception);
    /// returns whether a row actually changed.
    pub async fn update_status(&self, id: EmailId, status: EmailStatus) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            UPDATE emails
            SET status = $2, updated_at = now()
            WHERE id = $1
              AND (status IN ('queued', 'sending', 'deferred')
                   OR (status = 'sent' AND $2 = 'delivered'))
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_failed(&self, id: EmailId, reason: &str) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE emails
            SET status = 'failed', failure_reason = $2, updated_at = now()
            WHERE id = $1 AND status IN ('queued', 'sending', 'deferred')
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn increment_retry(&self, id: EmailId) -> Result<i32, Error> {
        let count = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE emails
            SET retry_count = retry_count + 1, updated_at = now()
            WHERE id = $1
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}

#[derive(Debug, Clone)]
pub struct EmailEvent {
    pub id: Uuid,
    pub email_id: EmailId,
    pub event_type: EmailEventType,
    pub code: Option<i32>,
    pub message: Option<String>,
    pub recipient: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct PgEmailEvent {
    id: Uuid,
    email_id: EmailId,
    event_type: String,
    code: Option<i32>,
    message: Option<String>,
    recipient: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<PgEmailEvent> for EmailEvent {
    type Error = Error;

    fn try_from(pg: PgEmailEvent) -> Result<Self, Self::Error> {
        Ok(Self {
            id: pg.id,
            email_id: pg.email_id,
            event_type: pg.event_type.parse()?,
            code: pg.code,
            message: pg.message,
            recipient: pg.recipient,
            created_at: pg.created_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EmailEventRepository {
    pool: sqlx::PgPool,
}

impl EmailEventRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        email_id: EmailId,
        event_type: EmailEventType,
        code: Option<i32>,
        message: Option<&str>,
        recipient: Option<&str>,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO email_events (email_id, event_type, code, message, recipient)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(email_id)
        .bind(event_type.as_str())
        .bind(code)
        .bind(message)
        .bind(recipient)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_for(&self, email_id: EmailId) -> Result<Vec<EmailEvent>, Error> {
        sqlx::query_as::<_, PgEmailEvent>(
            r#"
            SELECT id, email_id, event_type, code, message, recipient, created_at
            FROM email_events
            WHERE email_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(email_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
    }

    /// Recipients of this email that already reached a terminal outcome.
    /// A retried send task skips these.
    pub async fn settled_recipients(&self, email_id: EmailId) -> Result<Vec<String>, Error> {
        let recipients = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT recipient
            FROM email_events
            WHERE email_id = $1
              AND recipient IS NOT NULL
              AND event_type IN ('sent', 'bounced', 'complained')
            "#,
        )
        .bind(email_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(recipients)
    }

    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query("DELETE FROM email_events WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone)]
pub struct TrackingLinkRepository {
    pool: sqlx::PgPool,
}

impl TrackingLinkRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Register a rewritten link and return the id embedded in the
    /// redirect URL.
    pub async fn create(&self, email_id: EmailId, url: &str) -> Result<Uuid, Error> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO tracking_links (email_id, url)
            VALUES ($1, $2)
            RETURNING id
            "#,
        )
        .bind(email_id)
        .bind(url)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn statuses_round_trip_through_text() {
        for status in [
            EmailStatus::Queued,
            EmailStatus::Sending,
            EmailStatus::Sent,
            EmailStatus::Delivered,
            EmailStatus::Bounced,
            EmailStatus::Failed,
            EmailStatus::Deferred,
            EmailStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<EmailStatus>().unwrap(), status);
        }

        assert!("nonsense".parse::<EmailStatus>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(EmailStatus::Sent.is_terminal());
        assert!(EmailStatus::Canceled.is_terminal());
        assert!(!EmailStatus::Queued.is_terminal());
        assert!(!EmailStatus::Deferred.is_terminal());
    }

    #[test]
    fn sender_domain_is_extracted() {
        let mut email = Email {
            id: EmailId::from(Uuid::nil()),
            team_id: TenantId::default(),
            broadcast_id: None,
            from_email: "news@mail.example.com".to_string(),
            to_emails: vec![],
            cc_emails: vec![],
            bcc_emails: vec![],
            reply_to: None,
            subject: String::new(),
            html_body: None,
            text_body: None,
            headers: vec![],
            attachments: vec![],
            status: EmailStatus::Queued,
            scheduled_at: None,
            retry_count: 0,
            idempotency_key: None,
            message_id: "x@mail.example.com".to_string(),
            failure_reason: None,
            created_at: Utc::now(),
        };
        assert_eq!(email.sender_domain(), "mail.example.com");

        email.from_email = "bogus".to_string();
        assert_eq!(email.sender_domain(), "");
    }
}
