use chrono::Utc;
use mail_send::SmtpClientBuilder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tokio_rustls::rustls::{crypto, crypto::CryptoProvider};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bounce::{self, BounceKind};
use crate::config::{SendMode, SmtpSettings};
use crate::dkim::SigningKey;
use crate::dns::DnsResolver;
use crate::message::OutgoingMessage;
use crate::models::TlsPolicy;

pub mod breaker;
pub mod session;

pub use breaker::CircuitBreaker;
use session::{DeliveryRequest, SessionError};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("message has no recipients")]
    NoRecipients,
    #[error("{count} recipients exceeds the limit of {max}")]
    TooManyRecipients { count: usize, max: usize },
    #[error(transparent)]
    Dkim(#[from] crate::dkim::DkimError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Sent,
    Failed,
    Deferred,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecipientOutcome {
    pub status: RecipientStatus,
    pub code: u16,
    pub message: String,
    pub permanent: bool,
}

impl RecipientOutcome {
    fn cancelled() -> Self {
        Self {
            status: RecipientStatus::Failed,
            code: 0,
            message: "context cancelled".to_string(),
            permanent: false,
        }
    }

    /// Derive an outcome from a session-scope failure, using the bounce
    /// classifier so quota/complaint text is honored.
    fn from_failure(code: u16, message: &str) -> Self {
        let bounce = bounce::classify(code, message);
        let status = match bounce.kind {
            BounceKind::Hard | BounceKind::Complaint => RecipientStatus::Failed,
            BounceKind::Soft => RecipientStatus::Deferred,
        };
        Self {
            status,
            code,
            message: message.to_string(),
            permanent: bounce.permanent,
        }
    }
}

#[derive(Debug)]
pub struct SendResult {
    pub message_id: String,
    pub recipients: HashMap<String, RecipientOutcome>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub helo_domain: String,
    pub mode: SendMode,
    pub relay: Option<RelayConfig>,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub max_recipients: usize,
    /// Destination port for direct delivery. Overridden in tests.
    pub smtp_port: u16,
}

impl SenderConfig {
    pub fn from_settings(smtp: &SmtpSettings) -> Self {
        let relay = (!smtp.relay_host.is_empty()).then(|| RelayConfig {
            host: smtp.relay_host.clone(),
            port: smtp.relay_port,
            username: smtp.relay_username.clone(),
            password: smtp.relay_password.clone(),
        });

        Self {
            helo_domain: smtp.helo_domain().to_string(),
            mode: smtp.mode,
            relay,
            connect_timeout: smtp.connect_timeout(),
            send_timeout: smtp.send_timeout(),
            max_recipients: smtp.max_recipients,
            smtp_port: 25,
        }
    }
}

/// Delivers signed messages to recipient mail exchangers, one SMTP
/// session per recipient domain (or per recipient through the relay).
/// Safe to share across worker tasks; the circuit breaker is the only
/// cross-call state.
#[derive(Clone)]
pub struct Sender {
    config: Arc<SenderConfig>,
    resolver: DnsResolver,
    breaker: Arc<CircuitBreaker>,
}

impl Sender {
    pub fn new(config: SenderConfig, resolver: DnsResolver) -> Self {
        if CryptoProvider::get_default().is_none() {
            // a concurrent caller may win the race, which is fine
            let _ = CryptoProvider::install_default(crypto::aws_lc_rs::default_provider());
        }

        Self {
            config: Arc::new(config),
            resolver,
            breaker: Arc::new(CircuitBreaker::default()),
        }
    }

    #[tracing::instrument(skip_all, fields(message_id = message.message_id))]
    pub async fn send(
        &self,
        message: &OutgoingMessage,
        dkim: Option<SigningKey>,
        tls_policy: TlsPolicy,
        cancel: &CancellationToken,
    ) -> Result<SendResult, SendError> {
        let recipients = message.collect_recipients();
        if recipients.is_empty() {
            return Err(SendError::NoRecipients);
        }
        if recipients.len() > self.config.max_recipients {
            return Err(SendError::TooManyRecipients {
                count: recipients.len(),
                max: self.config.max_recipients,
            });
        }

        let mut raw = message.build(Utc::now());
        if let Some(key) = dkim {
            let header = key.sign_header(&raw)?;
            let mut signed = header.into_bytes();
            signed.extend_from_slice(&raw);
            raw = signed;
        }

        info!(recipients = recipients.len(), "sending message");

        let mut outcomes = HashMap::new();
        match self.config.mode {
            SendMode::Relay => {
                self.send_via_relay(&message.from, &recipients, &raw, cancel, &mut outcomes)
                    .await;
            }
            SendMode::Direct => {
                for (domain, group) in group_by_domain(&recipients) {
                    if cancel.is_cancelled() {
                        mark_cancelled(&group, &mut outcomes);
                        continue;
                    }
                    self.send_direct(&message.from, &domain, &group, &raw, tls_policy, cancel, &mut outcomes)
                        .await;
                }
            }
        }

        Ok(SendResult {
            message_id: message.message_id.clone(),
            recipients: outcomes,
        })
    }

    /// Walk the MX hosts of one recipient domain until a session
    /// completes. Hosts behind an open circuit are skipped; a completed
    /// session (even one that rejected recipients) closes the walk.
    #[allow(clippy::too_many_arguments)]
    async fn send_direct(
        &self,
        mail_from: &str,
        domain: &str,
        recipients: &[String],
        raw: &[u8],
        tls_policy: TlsPolicy,
        cancel: &CancellationToken,
        outcomes: &mut HashMap<String, RecipientOutcome>,
    ) {
        let mx_hosts = match self.resolver.lookup_mx(domain).await {
            Ok(hosts) => hosts,
            Err(err) => {
                warn!(domain, "could not resolve mail domain: {err}");
                let outcome = RecipientOutcome::from_failure(421, &err.to_string());
                for recipient in recipients {
                    outcomes.insert(recipient.clone(), outcome.clone());
                }
                return;
            }
        };

        let mut last_error: Option<SessionError> = None;

        for mx in &mx_hosts {
            let pending: Vec<String> = recipients
                .iter()
                .filter(|r| !outcomes.contains_key(*r))
                .cloned()
                .collect();
            if pending.is_empty() {
                return;
            }

            if cancel.is_cancelled() {
                mark_cancelled(&pending, outcomes);
                return;
            }

            if !self.breaker.allow(&mx.host) {
                debug!(host = %mx.host, "circuit open, skipping exchanger");
                continue;
            }

            let request = DeliveryRequest {
                host: &mx.host,
                port: self.config.smtp_port,
                helo: &self.config.helo_domain,
                mail_from,
                recipients: &pending,
                data: raw,
                tls_policy,
                connect_timeout: self.config.connect_timeout,
            };

            // the session records into its own map so a cancellation can
            // interrupt it without fighting the borrow
            let mut session_outcomes = HashMap::new();
            let attempt = tokio::select! {
                _ = cancel.cancelled() => None,
                attempt = timeout(
                    self.config.send_timeout,
                    session::deliver(&request, &mut session_outcomes),
                ) => Some(attempt),
            };

            // outcomes recorded before an interruption stand
            outcomes.extend(session_outcomes);

            let Some(attempt) = attempt else {
                mark_cancelled(&pending, outcomes);
                return;
            };

            match attempt {
                Ok(Ok(())) => {
                    debug!(host = %mx.host, domain, "session completed");
                    self.breaker.record_success(&mx.host);
                    return;
                }
                Ok(Err(err)) => {
                    info!(host = %mx.host, domain, "could not use exchanger: {err}");
                    self.breaker.record_failure(&mx.host);
                    last_error = Some(err);
                }
                Err(_) => {
                    info!(host = %mx.host, domain, "session deadline exceeded");
                    self.breaker.record_failure(&mx.host);
                    last_error = Some(SessionError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "session timed out",
                    )));
                }
            }
        }

        // every exchanger refused us; pending recipients inherit the last error
        let (code, message) = match &last_error {
            Some(err) => (err.smtp_code(), err.to_string()),
            None => (421, format!("no usable mail exchanger for {domain}")),
        };
        let outcome = RecipientOutcome::from_failure(code, &message);
        for recipient in recipients {
            outcomes
                .entry(recipient.clone())
                .or_insert_with(|| outcome.clone());
        }
    }

    /// Relay mode: one authenticated session per recipient through the
    /// configured smarthost.
    async fn send_via_relay(
        &self,
        mail_from: &str,
        recipients: &[String],
        raw: &[u8],
        cancel: &CancellationToken,
        outcomes: &mut HashMap<String, RecipientOutcome>,
    ) {
        let Some(relay) = &self.config.relay else {
            let outcome = RecipientOutcome::from_failure(554, "relay host not configured");
            for recipient in recipients {
                outcomes.insert(recipient.clone(), outcome.clone());
            }
            return;
        };

        for recipient in recipients {
            if cancel.is_cancelled() {
                outcomes.insert(recipient.clone(), RecipientOutcome::cancelled());
                continue;
            }

            let message = mail_send::smtp::message::Message {
                mail_from: mail_from.into(),
                rcpt_to: vec![recipient.as_str().into()],
                body: raw.into(),
            };

            let builder = SmtpClientBuilder::new(relay.host.as_str(), relay.port)
                .implicit_tls(false)
                .helo_host(&self.config.helo_domain)
                .timeout(self.config.send_timeout)
                .credentials((relay.username.as_str(), relay.password.as_str()));

            let result = match builder.connect().await {
                Ok(mut client) => {
                    let result = client.send(message).await;
                    client
                        .quit()
                        .await
                        .inspect_err(|err| {
                            warn!("failed to close relay connection with {}: {err}", relay.host);
                        })
                        .ok();
                    result
                }
                Err(err) => Err(err),
            };

            let outcome = match result {
                Ok(()) => RecipientOutcome {
                    status: RecipientStatus::Sent,
                    code: 250,
                    message: "accepted by relay".to_string(),
                    permanent: false,
                },
                Err(err) => relay_outcome(err),
            };
            outcomes.insert(recipient.clone(), outcome);
        }
    }
}

/// Group recipients by their address domain, preserving recipient order
/// within each group.
fn group_by_domain(recipients: &[String]) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for recipient in recipients {
        let domain = recipient
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .unwrap_or_default()
            .to_string();
        groups.entry(domain).or_default().push(recipient.clone());
    }
    groups
}

fn mark_cancelled(recipients: &[String], outcomes: &mut HashMap<String, RecipientOutcome>) {
    for recipient in recipients {
        outcomes
            .entry(recipient.clone())
            .or_insert_with(RecipientOutcome::cancelled);
    }
}

/// Map a relay transport error onto a recipient outcome. 4xx replies are
/// transient, 5xx permanent; transport-level problems defer.
fn relay_outcome(err: mail_send::Error) -> RecipientOutcome {
    match err {
        mail_send::Error::UnexpectedReply(response)
        | mail_send::Error::AuthenticationFailed(response) => {
            let transient =
                response.severity() == smtp_proto::Severity::TransientNegativeCompletion;
            RecipientOutcome {
                status: if transient {
                    RecipientStatus::Deferred
                } else {
                    RecipientStatus::Failed
                },
                code: response.code,
                message: response.message,
                permanent: !transient,
            }
        }
        mail_send::Error::MissingCredentials
        | mail_send::Error::MissingMailFrom
        | mail_send::Error::MissingRcptTo
        | mail_send::Error::UnsupportedAuthMechanism
        | mail_send::Error::MissingStartTls => RecipientOutcome {
            status: RecipientStatus::Failed,
            code: 550,
            message: err.to_string(),
            permanent: true,
        },
        other => RecipientOutcome::from_failure(421, &other.to_string()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dns::mock;
    use mailcrab::TestMailServerHandle;
    use std::net::Ipv4Addr;

    fn sender_config(port: u16) -> SenderConfig {
        SenderConfig {
            helo_domain: "mail.sendmill.test".to_string(),
            mode: SendMode::Direct,
            relay: None,
            connect_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(10),
            max_recipients: 10,
            smtp_port: port,
        }
    }

    fn random_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn grouping_preserves_order_per_domain() {
        let recipients = vec![
            "a@one.test".to_string(),
            "b@two.test".to_string(),
            "c@one.test".to_string(),
        ];

        let groups = group_by_domain(&recipients);
        assert_eq!(groups["one.test"], vec!["a@one.test", "c@one.test"]);
        assert_eq!(groups["two.test"], vec!["b@two.test"]);
    }

    #[test]
    fn failure_outcomes_follow_bounce_classification() {
        let hard = RecipientOutcome::from_failure(550, "user unknown");
        assert_eq!(hard.status, RecipientStatus::Failed);
        assert!(hard.permanent);

        let soft = RecipientOutcome::from_failure(421, "service unavailable");
        assert_eq!(soft.status, RecipientStatus::Deferred);
        assert!(!soft.permanent);

        let complaint = RecipientOutcome::from_failure(250, "blocked for spam");
        assert_eq!(complaint.status, RecipientStatus::Failed);
        assert!(complaint.permanent);
    }

    #[tokio::test]
    async fn rejects_recipient_counts_over_the_limit() {
        let sender = Sender::new(
            sender_config(25),
            DnsResolver::mock(mock::Resolver::default()),
        );

        let message = OutgoingMessage {
            from: "a@sendmill.test".to_string(),
            to: (0..11).map(|i| format!("r{i}@example.test")).collect(),
            message_id: "m@sendmill.test".to_string(),
            ..Default::default()
        };

        let err = sender
            .send(
                &message,
                None,
                TlsPolicy::Opportunistic,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::TooManyRecipients { count: 11, max: 10 }));
    }

    #[tokio::test]
    async fn empty_recipient_list_is_an_error() {
        let sender = Sender::new(
            sender_config(25),
            DnsResolver::mock(mock::Resolver::default()),
        );

        let message = OutgoingMessage {
            from: "a@sendmill.test".to_string(),
            message_id: "m@sendmill.test".to_string(),
            ..Default::default()
        };

        assert!(matches!(
            sender
                .send(&message, None, TlsPolicy::Opportunistic, &CancellationToken::new())
                .await,
            Err(SendError::NoRecipients)
        ));
    }

    #[tokio::test]
    async fn cancelled_send_marks_recipients_failed() {
        let sender = Sender::new(
            sender_config(25),
            DnsResolver::mock(mock::Resolver::default().with_mx("localhost", 10)),
        );

        let cancel = CancellationToken::new();
        cancel.cancel();

        let message = OutgoingMessage {
            from: "a@sendmill.test".to_string(),
            to: vec!["b@example.test".to_string()],
            message_id: "m@sendmill.test".to_string(),
            ..Default::default()
        };

        let result = sender
            .send(&message, None, TlsPolicy::Opportunistic, &cancel)
            .await
            .unwrap();

        let outcome = &result.recipients["b@example.test"];
        assert_eq!(outcome.status, RecipientStatus::Failed);
        assert_eq!(outcome.message, "context cancelled");
    }

    #[tokio::test]
    async fn delivers_through_a_local_mail_sink() {
        let port = random_port();
        let TestMailServerHandle { token, rx: mut mail_rx } =
            mailcrab::development_mail_server(Ipv4Addr::new(127, 0, 0, 1), port).await;
        let _drop_guard = token.drop_guard();

        let sender = Sender::new(
            sender_config(port),
            DnsResolver::mock(mock::Resolver::default().with_mx("localhost", 10)),
        );

        let message = OutgoingMessage {
            from: "news@sendmill.test".to_string(),
            to: vec!["reader@example.test".to_string()],
            subject: "Hello".to_string(),
            text_body: Some("Hello world".to_string()),
            message_id: "m1@sendmill.test".to_string(),
            ..Default::default()
        };

        let result = sender
            .send(
                &message,
                None,
                TlsPolicy::Opportunistic,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let outcome = &result.recipients["reader@example.test"];
        assert_eq!(outcome.status, RecipientStatus::Sent, "{outcome:?}");
        assert_eq!(outcome.code, 250);

        let received = mail_rx.recv().await.unwrap();
        assert_eq!(received.envelope_from.as_str(), "news@sendmill.test");
    }

    #[tokio::test]
    async fn unreachable_exchangers_defer_and_trip_the_breaker() {
        let port = random_port(); // nothing listens here
        let sender = Sender::new(
            sender_config(port),
            DnsResolver::mock(mock::Resolver::default().with_mx("localhost", 10)),
        );

        let message = OutgoingMessage {
            from: "news@sendmill.test".to_string(),
            to: vec!["reader@example.test".to_string()],
            message_id: "m2@sendmill.test".to_string(),
            ..Default::default()
        };

        let result = sender
            .send(
                &message,
                None,
                TlsPolicy::Opportunistic,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let outcome = &result.recipients["reader@example.test"];
        assert_eq!(outcome.status, RecipientStatus::Deferred);
        assert_eq!(outcome.code, 421);
    }
}
