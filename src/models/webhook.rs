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
pub struct WebhookId(Uuid);

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref,
    sqlx::Type, FromStr,
)]
#[sqlx(transparent)]
pub struct WebhookEventId(Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Pending,
    Delivered,
    Failed,
}

text_enum!(WebhookEventStatus {
    Pending => "pending",
    Delivered => "delivered",
    Failed => "failed",
});

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Webhook {
    pub id: WebhookId,
    pub team_id: TenantId,
    pub url: String,
    /// Subscribed event types; `*` subscribes to everything.
    pub events: Vec<String>,
    pub signing_secret: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Webhook {
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.events.iter().any(|e| e == "*" || e == event_type)
    }
}

#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub id: WebhookEventId,
    pub webhook_id: WebhookId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: WebhookEventStatus,
    pub attempts: i32,
    pub response_code: Option<i32>,
    pub response_body: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct PgWebhookEvent {
    id: WebhookEventId,
    webhook_id: WebhookId,
    event_type: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    response_code: Option<i32>,
    response_body: Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<PgWebhookEvent> for WebhookEvent {
    type Error = Error;

    fn try_from(pg: PgWebhookEvent) -> Result<Self, Self::Error> {
        Ok(Self {
            id: pg.id,
            webhook_id: pg.webhook_id,
            event_type: pg.event_type,
            payload: pg.payload,
            status: pg.status.parse()?,
            attempts: pg.attempts,
            response_code: pg.response_code,
            response_body: pg.response_body,
            next_retry_at: pg.next_retry_at,
            created_at: pg.created_at,
        })
    }
}

const WEBHOOK_COLUMNS: &str =
    "id, team_id, url, events, signing_secret, active, created_at";

const WEBHOOK_EVENT_COLUMNS: &str = r#"
    id, webhook_id, event_type, payload, status, attempts, response_code,
    response_body, next_retry_at, created_at
"#;

#[derive(Debug, Clone)]
pub struct WebhookRepository {
    pool: sqlx::PgPool,
}

impl WebhookRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        tenant: TenantId,
        url: &str,
        events: &[String],
        signing_secret: &str,
    ) -> Result<Webhook, Error> {
        let parsed = url::Url::parse(url)
            .map_err(|err| Error::BadRequest(format!("invalid webhook url: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::BadRequest(
                "webhook url must be http or https".to_string(),
            ));
        }

        let webhook = sqlx::query_as::<_, Webhook>(&format!(
            r#"
            INSERT INTO webhooks (team_id, url, events, signing_secret)
            VALUES ($1, $2, $3, $4)
            RETURNING {WEBHOOK_COLUMNS}
            "#
        ))
        .bind(tenant)
        .bind(url)
        .bind(events)
        .bind(signing_secret)
        .fetch_one(&self.pool)
        .await?;

        Ok(webhook)
    }

    pub async fn get(&self, id: WebhookId) -> Result<Webhook, Error> {
        let webhook = sqlx::query_as::<_, Webhook>(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(webhook)
    }

    pub async fn list_for_tenant(&self, tenant: TenantId) -> Result<Vec<Webhook>, Error> {
        let webhooks = sqlx::query_as::<_, Webhook>(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE team_id = $1"
        ))
        .bind(tenant)
        .fetch_all(&self.pool)
        .await?;

        Ok(webhooks)
    }
}

#[derive(Debug, Clone)]
pub struct WebhookEventRepository {
    pool: sqlx::PgPool,
}

impl WebhookEventRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        webhook_id: WebhookId,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<WebhookEvent, Error> {
        sqlx::query_as::<_, PgWebhookEvent>(&format!(
            r#"
            INSERT INTO webhook_events (webhook_id, event_type, payload)
            VALUES ($1, $2, $3)
            RETURNING {WEBHOOK_EVENT_COLUMNS}
            "#
        ))
        .bind(webhook_id)
        .bind(event_type)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?
        .try_into()
    }

    pub async fn get(&self, id: WebhookEventId) -> Result<WebhookEvent, Error> {
        sqlx::query_as::<_, PgWebhookEvent>(&format!(
            "SELECT {WEBHOOK_EVENT_COLUMNS} FROM webhook_events WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await?
        .try_into()
    }

    /// Record the outcome of one delivery attempt.
    pub async fn record_attempt(
        &self,
        id: WebhookEventId,
        status: WebhookEventStatus,
        response_code: Option<i32>,
        response_body: Option<&str>,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status        = $2,
                attempts      = attempts + 1,
                response_code = $3,
                response_body = $4,
                next_retry_at = $5,
                updated_at    = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(response_code)
        .bind(response_body)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query(
            "DELETE FROM webhook_events WHERE created_at < $1 AND status <> 'pending'",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn webhook(events: &[&str]) -> Webhook {
        Webhook {
            id: WebhookId::from(Uuid::nil()),
            team_id: TenantId::default(),
            url: "https://hooks.example.com/in".to_string(),
            events: events.iter().map(|e| e.to_string()).collect(),
            signing_secret: "whsec".to_string(),
            active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn wildcard_subscribes_to_everything() {
        let hook = webhook(&["*"]);
        assert!(hook.subscribes_to("email.sent"));
        assert!(hook.subscribes_to("email.bounced"));
    }

    #[test]
    fn typed_subscription_is_exact() {
        let hook = webhook(&["email.sent", "email.delivered"]);
        assert!(hook.subscribes_to("email.sent"));
        assert!(!hook.subscribes_to("email.bounced"));
    }
}
