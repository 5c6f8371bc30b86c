use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, RootCertStore, pki_types::ServerName},
};
use tracing::{debug, trace, warn};

use crate::bounce::{self, BounceKind};
use crate::delivery::{RecipientOutcome, RecipientStatus};
use crate::models::TlsPolicy;

const MAX_REPLY_LINE: u64 = 2048;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("TLS handshake with {0} failed")]
    Tls(String),
    #[error("server does not offer STARTTLS")]
    StartTlsUnavailable,
    #[error("unexpected reply: {code} {message}")]
    Rejected { code: u16, message: String },
    #[error("malformed reply from server")]
    MalformedReply,
}

impl SessionError {
    /// The SMTP code standing in for this session failure. Errors without
    /// a code from the wire are classified by substring: timeouts and
    /// refused connections map to 421.
    pub fn smtp_code(&self) -> u16 {
        match self {
            SessionError::Rejected { code, .. } => *code,
            SessionError::Io(err) => {
                let text = err.to_string().to_lowercase();
                if text.contains("timed out")
                    || text.contains("timeout")
                    || text.contains("connection refused")
                {
                    421
                } else {
                    451
                }
            }
            SessionError::ConnectTimeout => 421,
            _ => 451,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmtpReply {
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Default)]
struct Extensions {
    starttls: bool,
}

/// One delivery attempt against a single mail exchanger.
pub struct DeliveryRequest<'a> {
    pub host: &'a str,
    pub port: u16,
    pub helo: &'a str,
    pub mail_from: &'a str,
    pub recipients: &'a [String],
    pub data: &'a [u8],
    pub tls_policy: TlsPolicy,
    pub connect_timeout: Duration,
}

/// Run a full SMTP transaction against `req.host`.
///
/// Per-recipient rejections land in `outcomes` and do not abort the
/// session; an `Err` means the host itself was unusable and the caller
/// should walk to the next exchanger. Outcomes recorded before such an
/// error stand — a rejected recipient is not retried on the next host.
pub async fn deliver(
    req: &DeliveryRequest<'_>,
    outcomes: &mut HashMap<String, RecipientOutcome>,
) -> Result<(), SessionError> {
    match attempt(req, outcomes, true).await {
        Err(SessionError::Tls(host)) if req.tls_policy == TlsPolicy::Opportunistic => {
            // the failed handshake killed the connection; start over in
            // the clear, as the policy allows
            warn!(%host, "STARTTLS failed, retrying without TLS (opportunistic policy)");
            attempt(req, outcomes, false).await
        }
        other => other,
    }
}

async fn attempt(
    req: &DeliveryRequest<'_>,
    outcomes: &mut HashMap<String, RecipientOutcome>,
    use_tls: bool,
) -> Result<(), SessionError> {
    let tcp = timeout(
        req.connect_timeout,
        TcpStream::connect((req.host, req.port)),
    )
    .await
    .map_err(|_| SessionError::ConnectTimeout)??;

    let mut session = Session::new(tcp);
    session.expect_greeting().await?;
    let extensions = session.ehlo(req.helo).await?;

    if extensions.starttls && use_tls {
        match session.command("STARTTLS", 220).await {
            Ok(_) => {}
            Err(SessionError::Rejected { code, message })
                if req.tls_policy == TlsPolicy::Opportunistic =>
            {
                // the session survives a rejected STARTTLS
                warn!(host = req.host, code, message = %message, "STARTTLS rejected, continuing in cleartext");
                return run_envelope(&mut session, req, outcomes).await;
            }
            Err(err) => return Err(err),
        }

        let server_name = ServerName::try_from(req.host.to_string())
            .map_err(|_| SessionError::Tls(req.host.to_string()))?;
        let tls = tls_connector()
            .connect(server_name, session.into_inner())
            .await
            .map_err(|err| {
                warn!(host = req.host, "TLS handshake failed: {err}");
                SessionError::Tls(req.host.to_string())
            })?;

        let mut session = Session::new(tls);
        // the pre-TLS EHLO response no longer counts
        session.ehlo(req.helo).await?;
        run_envelope(&mut session, req, outcomes).await
    } else if req.tls_policy == TlsPolicy::Enforce {
        Err(SessionError::StartTlsUnavailable)
    } else {
        debug!(host = req.host, "server offers no STARTTLS, continuing in cleartext");
        run_envelope(&mut session, req, outcomes).await
    }
}

/// MAIL FROM through DATA on an established session.
async fn run_envelope<S: AsyncRead + AsyncWrite + Unpin>(
    session: &mut Session<S>,
    req: &DeliveryRequest<'_>,
    outcomes: &mut HashMap<String, RecipientOutcome>,
) -> Result<(), SessionError> {
    session
        .command(&format!("MAIL FROM:<{}>", req.mail_from), 250)
        .await?;

    let mut accepted = Vec::new();
    for recipient in req.recipients {
        let reply = session.send(&format!("RCPT TO:<{recipient}>")).await?;

        if (200..300).contains(&reply.code) {
            accepted.push(recipient.clone());
            continue;
        }

        // recipient-scoped rejection, session continues
        let bounce = bounce::classify(reply.code, &reply.message);
        let status = match bounce.kind {
            BounceKind::Hard | BounceKind::Complaint => RecipientStatus::Failed,
            BounceKind::Soft => RecipientStatus::Deferred,
        };
        debug!(recipient = %recipient, code = reply.code, "recipient rejected");
        outcomes.insert(
            recipient.clone(),
            RecipientOutcome {
                status,
                code: reply.code,
                message: reply.message,
                permanent: bounce.permanent,
            },
        );
    }

    if accepted.is_empty() {
        session.send("RSET").await.ok();
        session.quit().await;
        return Ok(());
    }

    let data_reply = match session.command("DATA", 354).await {
        Ok(reply) => {
            session.write_data(req.data).await?;
            session.read_reply().await?
        }
        Err(SessionError::Rejected { code, message }) => SmtpReply { code, message },
        Err(err) => return Err(err),
    };

    if (200..300).contains(&data_reply.code) {
        for recipient in accepted {
            outcomes.insert(
                recipient,
                RecipientOutcome {
                    status: RecipientStatus::Sent,
                    code: data_reply.code,
                    message: data_reply.message.clone(),
                    permanent: false,
                },
            );
        }
    } else {
        // the whole transaction failed; still-valid recipients inherit it
        let status = if data_reply.code >= 500 {
            RecipientStatus::Failed
        } else {
            RecipientStatus::Deferred
        };
        for recipient in accepted {
            outcomes.insert(
                recipient,
                RecipientOutcome {
                    status,
                    code: data_reply.code,
                    message: data_reply.message.clone(),
                    permanent: data_reply.code >= 500,
                },
            );
        }
    }

    session.quit().await;
    Ok(())
}

fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

struct Session<S> {
    stream: BufStream<S>,
    buffer: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    fn new(stream: S) -> Self {
        Self {
            stream: BufStream::new(stream),
            buffer: Vec::with_capacity(256),
        }
    }

    fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    async fn expect_greeting(&mut self) -> Result<(), SessionError> {
        let greeting = self.read_reply().await?;
        if (200..300).contains(&greeting.code) {
            Ok(())
        } else {
            Err(SessionError::Rejected {
                code: greeting.code,
                message: greeting.message,
            })
        }
    }

    async fn ehlo(&mut self, helo: &str) -> Result<Extensions, SessionError> {
        let reply = self.send(&format!("EHLO {helo}")).await?;
        if !(200..300).contains(&reply.code) {
            return Err(SessionError::Rejected {
                code: reply.code,
                message: reply.message,
            });
        }

        let mut extensions = Extensions::default();
        for line in reply.message.lines() {
            if line.trim().eq_ignore_ascii_case("STARTTLS") {
                extensions.starttls = true;
            }
        }
        Ok(extensions)
    }

    /// Send a command and require the given reply code.
    async fn command(&mut self, line: &str, expect: u16) -> Result<SmtpReply, SessionError> {
        let reply = self.send(line).await?;
        if reply.code == expect || (expect == 250 && (200..300).contains(&reply.code)) {
            Ok(reply)
        } else {
            Err(SessionError::Rejected {
                code: reply.code,
                message: reply.message,
            })
        }
    }

    async fn send(&mut self, line: &str) -> Result<SmtpReply, SessionError> {
        trace!(">> {line}");
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        self.read_reply().await
    }

    /// Read one (possibly multiline) SMTP reply.
    async fn read_reply(&mut self) -> Result<SmtpReply, SessionError> {
        let mut code = 0u16;
        let mut lines: Vec<String> = Vec::new();

        loop {
            self.buffer.clear();
            let n = (&mut self.stream)
                .take(MAX_REPLY_LINE)
                .read_until(b'\n', &mut self.buffer)
                .await?;
            if n == 0 {
                return Err(SessionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                )));
            }

            let line = String::from_utf8_lossy(&self.buffer);
            let line = line.trim_end_matches(['\r', '\n']);
            trace!("<< {line}");

            if line.len() < 3 {
                return Err(SessionError::MalformedReply);
            }
            code = line[..3].parse().map_err(|_| SessionError::MalformedReply)?;

            let (separator, rest) = match line.as_bytes().get(3) {
                Some(b'-') => ('-', line.get(4..).unwrap_or("")),
                Some(_) => (' ', line.get(4..).unwrap_or("").trim_start()),
                None => (' ', ""),
            };
            lines.push(rest.to_string());

            if separator == ' ' {
                break;
            }
        }

        Ok(SmtpReply {
            code,
            message: lines.join("\n"),
        })
    }

    /// Transmit the message body with dot stuffing and the terminating
    /// sequence.
    async fn write_data(&mut self, data: &[u8]) -> Result<(), SessionError> {
        let mut lines: Vec<&[u8]> = split_lines(data).collect();
        if data.ends_with(b"\n") {
            // a trailing terminator is not an extra empty line
            lines.pop();
        }

        for line in lines {
            if line.first() == Some(&b'.') {
                self.stream.write_all(b".").await?;
            }
            self.stream.write_all(line).await?;
            self.stream.write_all(b"\r\n").await?;
        }
        self.stream.write_all(b".\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn quit(&mut self) {
        if let Err(err) = async {
            self.stream.write_all(b"QUIT\r\n").await?;
            self.stream.flush().await
        }
        .await
        {
            debug!("failed to close session cleanly: {err}");
        }
    }
}

/// Split message bytes into lines without their terminators, accepting
/// both CRLF and bare LF input.
fn split_lines(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn request<'a>(recipients: &'a [String]) -> DeliveryRequest<'a> {
        DeliveryRequest {
            host: "mx.example.net",
            port: 25,
            helo: "mail.sendmill.test",
            mail_from: "news@sendmill.test",
            recipients,
            data: b"Subject: hi\r\n\r\nbody\r\n.leading dot\r\n",
            tls_policy: TlsPolicy::Opportunistic,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Drive `run_envelope` against a canned reply stream and capture what
    /// the client wrote.
    async fn scripted_envelope(
        replies: &str,
        recipients: &[String],
    ) -> (HashMap<String, RecipientOutcome>, String) {
        let (client, mut server) = tokio::io::duplex(64 * 1024);

        let mut session = Session::new(client);
        let mut outcomes = HashMap::new();

        let replies = replies.to_string();
        let server_task = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            server.write_all(replies.as_bytes()).await.unwrap();
            let mut sent = Vec::new();
            server.read_to_end(&mut sent).await.ok();
            String::from_utf8_lossy(&sent).into_owned()
        });

        let req = request(recipients);
        run_envelope(&mut session, &req, &mut outcomes)
            .await
            .unwrap();
        drop(session);

        (outcomes, server_task.await.unwrap())
    }

    #[tokio::test]
    async fn mixed_rcpt_outcomes_share_one_session() {
        let recipients = vec![
            "good@example.net".to_string(),
            "gone@example.net".to_string(),
            "full@example.net".to_string(),
        ];

        let replies = "250 ok\r\n\
                       250 ok\r\n\
                       550 5.1.1 User unknown\r\n\
                       452 4.2.2 Mailbox full\r\n\
                       354 go ahead\r\n\
                       250 accepted\r\n\
                       221 bye\r\n";

        let (outcomes, sent) = scripted_envelope(replies, &recipients).await;

        let good = &outcomes["good@example.net"];
        assert_eq!(good.status, RecipientStatus::Sent);
        assert_eq!(good.code, 250);

        let gone = &outcomes["gone@example.net"];
        assert_eq!(gone.status, RecipientStatus::Failed);
        assert_eq!(gone.code, 550);
        assert!(gone.permanent);

        let full = &outcomes["full@example.net"];
        assert_eq!(full.status, RecipientStatus::Deferred);
        assert_eq!(full.code, 452);
        assert!(!full.permanent);

        // dot stuffing applied, terminator sent
        assert!(sent.contains("\r\n..leading dot\r\n"));
        assert!(sent.contains("\r\n.\r\n"));
        assert!(sent.ends_with("QUIT\r\n"));
    }

    #[tokio::test]
    async fn all_rejected_resets_instead_of_data() {
        let recipients = vec!["gone@example.net".to_string()];

        let replies = "250 ok\r\n\
                       550 no such user\r\n\
                       250 reset\r\n\
                       221 bye\r\n";

        let (outcomes, sent) = scripted_envelope(replies, &recipients).await;

        assert_eq!(outcomes["gone@example.net"].status, RecipientStatus::Failed);
        assert!(sent.contains("RSET\r\n"));
        assert!(!sent.contains("DATA"));
    }

    #[tokio::test]
    async fn data_rejection_is_inherited_by_accepted_recipients() {
        let recipients = vec![
            "a@example.net".to_string(),
            "b@example.net".to_string(),
        ];

        // DATA refused outright with a permanent code
        let replies = "250 ok\r\n\
                       250 ok\r\n\
                       250 ok\r\n\
                       554 no thanks\r\n\
                       221 bye\r\n";

        let (outcomes, _) = scripted_envelope(replies, &recipients).await;

        for recipient in &recipients {
            let outcome = &outcomes[recipient];
            assert_eq!(outcome.status, RecipientStatus::Failed);
            assert_eq!(outcome.code, 554);
            assert!(outcome.permanent);
        }
    }

    #[tokio::test]
    async fn transient_data_failure_defers() {
        let recipients = vec!["a@example.net".to_string()];

        let replies = "250 ok\r\n\
                       250 ok\r\n\
                       451 try again later\r\n\
                       221 bye\r\n";

        let (outcomes, _) = scripted_envelope(replies, &recipients).await;
        let outcome = &outcomes["a@example.net"];
        assert_eq!(outcome.status, RecipientStatus::Deferred);
        assert!(!outcome.permanent);
    }

    #[tokio::test]
    async fn multiline_replies_are_joined() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut session = Session::new(client);

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            server
                .write_all(b"250-mx.example.net greets you\r\n250-SIZE 1000000\r\n250 STARTTLS\r\n")
                .await
                .unwrap();
            let mut buf = vec![0u8; 64];
            server.read(&mut buf).await.ok();
        });

        let reply = session.read_reply().await.unwrap();
        assert_eq!(reply.code, 250);
        assert_eq!(reply.message.lines().count(), 3);
        assert!(reply.message.contains("STARTTLS"));
    }

    #[test]
    fn session_error_codes_classify_by_substring() {
        let refused = SessionError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert_eq!(refused.smtp_code(), 421);

        assert_eq!(SessionError::ConnectTimeout.smtp_code(), 421);

        let rejected = SessionError::Rejected {
            code: 554,
            message: "bad".to_string(),
        };
        assert_eq!(rejected.smtp_code(), 554);
    }

    #[test]
    fn lines_split_with_and_without_cr() {
        let lines: Vec<&[u8]> = split_lines(b"a\r\nb\nc").collect();
        assert_eq!(lines, vec![b"a".as_ref(), b"b".as_ref(), b"c".as_ref()]);
    }
}
