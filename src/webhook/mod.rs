use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::models::{
    self, TenantId, Webhook, WebhookEvent, WebhookEventId, WebhookEventRepository,
    WebhookEventStatus, WebhookRepository,
};
use crate::queue::{Backoff, Enqueuer, Task, TaskType, WebhookDeliverPayload};

type HmacSha256 = Hmac<Sha256>;

/// Response bodies are stored for debugging, capped at 4 KiB.
const MAX_STORED_BODY: usize = 4096;

/// Hex HMAC-SHA256 over `"{timestamp}.{body}"`, the signature receivers
/// recompute.
pub fn sign(secret: &str, timestamp: i64, body: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(format!("{timestamp}.{body}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification for webhook receivers.
pub fn verify_signature(body: &str, secret: &str, timestamp: i64, signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(format!("{timestamp}.{body}").as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// Active webhooks whose subscription covers this event type.
fn subscribers<'a>(webhooks: &'a [Webhook], event_type: &str) -> Vec<&'a Webhook> {
    webhooks
        .iter()
        .filter(|w| w.active && w.subscribes_to(event_type))
        .collect()
}

/// Fans a tenant event out to its subscribed webhooks: one durable
/// `WebhookEvent` and one `webhook:deliver` task per match.
#[derive(Clone)]
pub struct WebhookDispatcher {
    webhooks: WebhookRepository,
    events: WebhookEventRepository,
    enqueuer: Arc<dyn Enqueuer>,
    max_retries: u32,
}

impl WebhookDispatcher {
    pub fn new(
        pool: sqlx::PgPool,
        enqueuer: Arc<dyn Enqueuer>,
        max_retries: u32,
    ) -> Self {
        Self {
            webhooks: WebhookRepository::new(pool.clone()),
            events: WebhookEventRepository::new(pool),
            enqueuer,
            max_retries,
        }
    }

    /// Returns how many deliveries were enqueued. A failure for one
    /// webhook never blocks its peers; those are logged and skipped.
    pub async fn dispatch(
        &self,
        tenant: TenantId,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<usize, models::Error> {
        let webhooks = self.webhooks.list_for_tenant(tenant).await?;
        let matching = subscribers(&webhooks, event_type);

        if matching.is_empty() {
            debug!(%tenant, event_type, "no webhook subscribes to this event");
            return Ok(0);
        }

        let mut enqueued = 0;
        for webhook in matching {
            let event = match self.events.create(webhook.id, event_type, &payload).await {
                Ok(event) => event,
                Err(err) => {
                    error!(webhook_id = %webhook.id, "failed to persist webhook event: {err}");
                    continue;
                }
            };

            let task = match Task::new(
                TaskType::WebhookDeliver,
                &WebhookDeliverPayload {
                    webhook_event_id: event.id,
                },
                self.max_retries,
            ) {
                Ok(task) => task,
                Err(err) => {
                    error!(webhook_id = %webhook.id, "failed to build deliver task: {err}");
                    continue;
                }
            };

            if let Err(err) = self.enqueuer.enqueue(task).await {
                error!(webhook_id = %webhook.id, "failed to enqueue delivery: {err}");
                continue;
            }
            enqueued += 1;
        }

        info!(%tenant, event_type, enqueued, "dispatched webhook event");
        Ok(enqueued)
    }
}

/// What one HTTP attempt produced.
#[derive(Debug)]
pub struct AttemptResult {
    pub delivered: bool,
    pub code: Option<u16>,
    pub body: String,
}

/// The end state `deliver` reports back to the queue.
#[derive(Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Failed but another attempt is scheduled.
    Retrying,
    /// Failed for good; the event record is terminal.
    Exhausted,
}

#[derive(Clone)]
pub struct WebhookDeliverer {
    webhooks: WebhookRepository,
    events: WebhookEventRepository,
    client: reqwest::Client,
    backoff: Backoff,
    max_retries: u32,
}

impl WebhookDeliverer {
    pub fn new(
        pool: sqlx::PgPool,
        timeout: Duration,
        backoff: Backoff,
        max_retries: u32,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client configuration is static");

        Self {
            webhooks: WebhookRepository::new(pool.clone()),
            events: WebhookEventRepository::new(pool),
            client,
            backoff,
            max_retries,
        }
    }

    /// Perform one delivery attempt for a stored event. Attempts within a
    /// single event are serialized by construction: the queue holds at
    /// most one in-flight task per event id.
    pub async fn deliver(&self, id: WebhookEventId) -> Result<DeliveryOutcome, models::Error> {
        let event = self.events.get(id).await?;
        if event.status == WebhookEventStatus::Delivered {
            // a retried task that already succeeded
            return Ok(DeliveryOutcome::Delivered);
        }

        let webhook = self.webhooks.get(event.webhook_id).await?;
        let result = self.post_event(&webhook, &event).await;

        let attempts_now = event.attempts + 1;

        if result.delivered {
            self.events
                .record_attempt(
                    event.id,
                    WebhookEventStatus::Delivered,
                    result.code.map(i32::from),
                    Some(truncate_body(&result.body)),
                    None,
                )
                .await?;
            return Ok(DeliveryOutcome::Delivered);
        }

        let retrying = (attempts_now as u32) < self.max_retries;
        let next_retry_at = retrying.then(|| {
            let delay = self.backoff.delay(attempts_now.saturating_sub(1) as u32);
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero())
        });

        self.events
            .record_attempt(
                event.id,
                WebhookEventStatus::Failed,
                result.code.map(i32::from),
                Some(truncate_body(&result.body)),
                next_retry_at,
            )
            .await?;

        warn!(
            webhook_event_id = %event.id,
            code = result.code,
            attempts = attempts_now,
            retrying,
            "webhook delivery failed"
        );

        Ok(if retrying {
            DeliveryOutcome::Retrying
        } else {
            DeliveryOutcome::Exhausted
        })
    }

    /// The HTTP leg: signed POST, response classification.
    async fn post_event(&self, webhook: &Webhook, event: &WebhookEvent) -> AttemptResult {
        let body = serde_json::json!({
            "type": event.event_type,
            "created_at": created_at_rfc3339(event.created_at),
            "data": event.payload,
        })
        .to_string();

        let timestamp = Utc::now().timestamp();
        let signature = sign(&webhook.signing_secret, timestamp, &body);

        let response = self
            .client
            .post(&webhook.url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-ID", event.id.to_string())
            .header("X-Webhook-Timestamp", timestamp.to_string())
            .header("X-Webhook-Signature", signature)
            .body(body)
            .send()
            .await;

        match response {
            Ok(response) => {
                let code = response.status().as_u16();
                let delivered = response.status().is_success();
                let body = response.text().await.unwrap_or_default();
                AttemptResult {
                    delivered,
                    code: Some(code),
                    body,
                }
            }
            Err(err) => AttemptResult {
                delivered: false,
                code: None,
                body: err.to_string(),
            },
        }
    }
}

fn created_at_rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Cut a response body at the storage cap without splitting a character.
fn truncate_body(body: &str) -> &str {
    if body.len() <= MAX_STORED_BODY {
        return body;
    }

    let mut end = MAX_STORED_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::WebhookId;
    use uuid::Uuid;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn signature_round_trips() {
        let body = r#"{"type":"email.sent"}"#;
        let signature = sign("whsec_topsecret", 1717243200, body);

        assert!(verify_signature(body, "whsec_topsecret", 1717243200, &signature));
    }

    #[test]
    fn any_mutation_breaks_the_signature() {
        let body = r#"{"type":"email.sent"}"#;
        let ts = 1717243200;
        let signature = sign("whsec_topsecret", ts, body);

        assert!(!verify_signature("{}", "whsec_topsecret", ts, &signature));
        assert!(!verify_signature(body, "whsec_other", ts, &signature));
        assert!(!verify_signature(body, "whsec_topsecret", ts + 1, &signature));
        assert!(!verify_signature(body, "whsec_topsecret", ts, "deadbeef"));
        assert!(!verify_signature(body, "whsec_topsecret", ts, "not hex at all"));
    }

    fn webhook_with(events: &[&str], active: bool, url: &str) -> Webhook {
        Webhook {
            id: WebhookId::from(Uuid::new_v4()),
            team_id: TenantId::default(),
            url: url.to_string(),
            events: events.iter().map(|e| e.to_string()).collect(),
            signing_secret: "whsec_test".to_string(),
            active,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn fan_out_matches_wildcard_and_typed_subscriptions() {
        let webhooks = vec![
            webhook_with(&["email.sent"], true, "https://a.example"),
            webhook_with(&["*"], true, "https://b.example"),
        ];

        // only the wildcard subscriber sees a bounce
        let matched = subscribers(&webhooks, "email.bounced");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].url, "https://b.example");

        // both see a sent event
        assert_eq!(subscribers(&webhooks, "email.sent").len(), 2);
    }

    #[test]
    fn inactive_webhooks_never_match() {
        let webhooks = vec![webhook_with(&["*"], false, "https://a.example")];
        assert!(subscribers(&webhooks, "email.sent").is_empty());
    }

    #[test]
    fn bodies_are_truncated_at_a_char_boundary() {
        let body = "x".repeat(5000);
        assert_eq!(truncate_body(&body).len(), MAX_STORED_BODY);

        let multibyte = "é".repeat(4096);
        let cut = truncate_body(&multibyte);
        assert!(cut.len() <= MAX_STORED_BODY);
        assert!(multibyte.is_char_boundary(cut.len()));

        assert_eq!(truncate_body("short"), "short");
    }

    fn deliverer_for_tests() -> WebhookDeliverer {
        // the pool is never touched by post_event
        let pool = sqlx::PgPool::connect_lazy("postgres://localhost/unused")
            .expect("lazy pool needs no server");
        WebhookDeliverer::new(
            pool,
            Duration::from_secs(5),
            Backoff::default(),
            5,
        )
    }

    fn event_for(webhook: &Webhook) -> WebhookEvent {
        WebhookEvent {
            id: WebhookEventId::from(Uuid::new_v4()),
            webhook_id: webhook.id,
            event_type: "email.sent".to_string(),
            payload: serde_json::json!({"email_id": "abc"}),
            status: WebhookEventStatus::Pending,
            attempts: 0,
            response_code: None,
            response_body: None,
            next_retry_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn posts_are_signed_and_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks"))
            .and(header_exists("X-Webhook-ID"))
            .and(header_exists("X-Webhook-Timestamp"))
            .and(header_exists("X-Webhook-Signature"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let webhook = webhook_with(&["*"], true, &format!("{}/hooks", server.uri()));
        let event = event_for(&webhook);

        let deliverer = deliverer_for_tests();
        let result = deliverer.post_event(&webhook, &event).await;

        assert!(result.delivered);
        assert_eq!(result.code, Some(200));
        assert_eq!(result.body, "ok");

        // the signature verifies against the body that went over the wire
        let requests = server.received_requests().await.unwrap();
        let request = &requests[0];
        let body = String::from_utf8(request.body.clone()).unwrap();
        let ts: i64 = request
            .headers
            .get("X-Webhook-Timestamp")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let signature = request
            .headers
            .get("X-Webhook-Signature")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(verify_signature(&body, "whsec_test", ts, signature));

        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["type"], "email.sent");
        assert_eq!(parsed["data"]["email_id"], "abc");
        assert!(parsed["created_at"].as_str().unwrap().contains('T'));
    }

    #[tokio::test]
    async fn non_2xx_responses_are_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let webhook = webhook_with(&["*"], true, &server.uri());
        let event = event_for(&webhook);

        let result = deliverer_for_tests().post_event(&webhook, &event).await;
        assert!(!result.delivered);
        assert_eq!(result.code, Some(500));
        assert_eq!(result.body, "boom");
    }

    #[tokio::test]
    async fn network_errors_carry_no_code() {
        // a port nobody listens on
        let webhook = webhook_with(&["*"], true, "http://127.0.0.1:9/hooks");
        let event = event_for(&webhook);

        let result = deliverer_for_tests().post_event(&webhook, &event).await;
        assert!(!result.delivered);
        assert_eq!(result.code, None);
        assert!(!result.body.is_empty());
    }
}
