use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Error, TenantId, text_enum};

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref,
    sqlx::Type, FromStr,
)]
#[sqlx(transparent)]
pub struct BroadcastId(Uuid);

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref,
    sqlx::Type, FromStr,
)]
#[sqlx(transparent)]
pub struct AudienceId(Uuid);

/// Contacts use a sequential id so broadcast dispatch can keyset-page and
/// persist a resume cursor.
#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash, From,
    Display, Deref, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct ContactId(i64);

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref,
    sqlx::Type, FromStr,
)]
#[sqlx(transparent)]
pub struct ImportJobId(Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastStatus {
    Draft,
    Queued,
    Sending,
    Sent,
    Canceled,
}

text_enum!(BroadcastStatus {
    Draft => "draft",
    Queued => "queued",
    Sending => "sending",
    Sent => "sent",
    Canceled => "canceled",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

text_enum!(ImportStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

#[derive(Debug, Clone)]
pub struct Broadcast {
    pub id: BroadcastId,
    pub team_id: TenantId,
    pub audience_id: AudienceId,
    pub segment_id: Option<Uuid>,
    pub from_email: String,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub status: BroadcastStatus,
    pub total_recipients: i32,
    pub sent_count: i32,
    pub failed_count: i32,
    /// Highest contact id already fanned out; dispatch resumes above it.
    pub last_contact_id: ContactId,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct PgBroadcast {
    id: BroadcastId,
    team_id: TenantId,
    audience_id: AudienceId,
    segment_id: Option<Uuid>,
    from_email: String,
    subject: String,
    html_body: Option<String>,
    text_body: Option<String>,
    status: String,
    total_recipients: i32,
    sent_count: i32,
    failed_count: i32,
    last_contact_id: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<PgBroadcast> for Broadcast {
    type Error = Error;

    fn try_from(pg: PgBroadcast) -> Result<Self, Self::Error> {
        Ok(Self {
            id: pg.id,
            team_id: pg.team_id,
            audience_id: pg.audience_id,
            segment_id: pg.segment_id,
            from_email: pg.from_email,
            subject: pg.subject,
            html_body: pg.html_body,
            text_body: pg.text_body,
            status: pg.status.parse()?,
            total_recipients: pg.total_recipients,
            sent_count: pg.sent_count,
            failed_count: pg.failed_count,
            last_contact_id: ContactId::from(pg.last_contact_id),
            created_at: pg.created_at,
        })
    }
}

const BROADCAST_COLUMNS: &str = r#"
    id, team_id, audience_id, segment_id, from_email, subject, html_body,
    text_body, status, total_recipients, sent_count, failed_count,
    last_contact_id, created_at
"#;

#[derive(Clone)]
pub struct BroadcastRepository {
    pool: sqlx::PgPool,
}

impl BroadcastRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: BroadcastId) -> Result<Broadcast, Error> {
        sqlx::query_as::<_, PgBroadcast>(&format!(
            "SELECT {BROADCAST_COLUMNS} FROM broadcasts WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await?
        .try_into()
    }

    pub async fn update_status(
        &self,
        id: BroadcastId,
        status: BroadcastStatus,
    ) -> Result<(), Error> {
        sqlx::query("UPDATE broadcasts SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Advance the dispatch cursor. The cursor only moves forward so a
    /// restarted task never re-enqueues contacts below it.
    pub async fn advance_cursor(
        &self,
        id: BroadcastId,
        last_contact: ContactId,
        enqueued: i32,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE broadcasts
            SET last_contact_id  = GREATEST(last_contact_id, $2),
                total_recipients = total_recipients + $3,
                updated_at       = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(last_contact)
        .bind(enqueued)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn record_outcome(&self, id: BroadcastId, sent: bool) -> Result<(), Error> {
        let column = if sent { "sent_count" } else { "failed_count" };
        sqlx::query(&format!(
            "UPDATE broadcasts SET {column} = {column} + 1, updated_at = now() WHERE id = $1"
        ))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Contact {
    pub id: ContactId,
    pub audience_id: AudienceId,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub unsubscribed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ContactRepository {
    pool: sqlx::PgPool,
}

impl ContactRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// One keyset page of contacts with ids above `after`.
    pub async fn page_after(
        &self,
        audience: AudienceId,
        after: ContactId,
        limit: i64,
    ) -> Result<Vec<Contact>, Error> {
        let contacts = sqlx::query_as::<_, Contact>(
            r#"
            SELECT id, audience_id, email, first_name, last_name, unsubscribed, created_at
            FROM contacts
            WHERE audience_id = $1 AND id > $2
            ORDER BY id
            LIMIT $3
            "#,
        )
        .bind(audience)
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(contacts)
    }

    /// Insert or refresh a contact keyed by (audience, lowercased email).
    pub async fn upsert(
        &self,
        audience: AudienceId,
        email: &str,
        first_name: Option<&str>,
        last_name: Option<&str>,
    ) -> Result<ContactId, Error> {
        let id = sqlx::query_scalar::<_, ContactId>(
            r#"
            INSERT INTO contacts (audience_id, email, first_name, last_name)
            VALUES ($1, lower($2), $3, $4)
            ON CONFLICT (audience_id, email)
                DO UPDATE SET first_name = COALESCE(EXCLUDED.first_name, contacts.first_name),
                              last_name  = COALESCE(EXCLUDED.last_name, contacts.last_name),
                              updated_at = now()
            RETURNING id
            "#,
        )
        .bind(audience)
        .bind(email)
        .bind(first_name)
        .bind(last_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }
}

#[derive(Debug, Clone)]
pub struct ContactImportJob {
    pub id: ImportJobId,
    pub team_id: TenantId,
    pub audience_id: AudienceId,
    pub csv_data: String,
    pub status: ImportStatus,
    pub total_rows: i32,
    pub imported_rows: i32,
    pub failed_rows: i32,
    pub error: Option<String>,
}

#[derive(sqlx::FromRow)]
struct PgImportJob {
    id: ImportJobId,
    team_id: TenantId,
    audience_id: AudienceId,
    csv_data: String,
    status: String,
    total_rows: i32,
    imported_rows: i32,
    failed_rows: i32,
    error: Option<String>,
}

impl TryFrom<PgImportJob> for ContactImportJob {
    type Error = Error;

    fn try_from(pg: PgImportJob) -> Result<Self, Self::Error> {
        Ok(Self {
            id: pg.id,
            team_id: pg.team_id,
            audience_id: pg.audience_id,
            csv_data: pg.csv_data,
            status: pg.status.parse()?,
            total_rows: pg.total_rows,
            imported_rows: pg.imported_rows,
            failed_rows: pg.failed_rows,
            error: pg.error,
        })
    }
}

#[derive(Clone)]
pub struct ImportJobRepository {
    pool: sqlx::PgPool,
}

impl ImportJobRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: ImportJobId) -> Result<ContactImportJob, Error> {
        sqlx::query_as::<_, PgImportJob>(
            r#"
            SELECT id, team_id, audience_id, csv_data, status, total_rows,
                   imported_rows, failed_rows, error
            FROM contact_import_jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?
        .try_into()
    }

    pub async fn update_status(&self, id: ImportJobId, status: ImportStatus) -> Result<(), Error> {
        sqlx::query("UPDATE contact_import_jobs SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn finish(
        &self,
        id: ImportJobId,
        status: ImportStatus,
        total: i32,
        imported: i32,
        failed: i32,
        error: Option<&str>,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE contact_import_jobs
            SET status        = $2,
                total_rows    = $3,
                imported_rows = $4,
                failed_rows   = $5,
                error         = $6,
                updated_at    = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(total)
        .bind(imported)
        .bind(failed)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
