use mail_parser::{MessageParser, MimeHeaders, PartType};
use serde::{Deserialize, Serialize};

/// Keywords that mark a reply as a recipient complaint regardless of the
/// SMTP code that carried it.
const COMPLAINT_KEYWORDS: [&str; 5] = [
    "spam",
    "unsolicited",
    "abuse",
    "complaint",
    "blocked for spam",
];

/// Keywords on a 552 reply that indicate a full mailbox rather than a
/// rejected one.
const QUOTA_KEYWORDS: [&str; 4] = ["quota", "mailbox full", "over quota", "storage"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BounceKind {
    Hard,
    Soft,
    Complaint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounce {
    pub kind: BounceKind,
    pub code: u16,
    pub message: String,
    pub recipient: Option<String>,
    pub permanent: bool,
}

impl Bounce {
    fn new(kind: BounceKind, code: u16, message: &str, permanent: bool) -> Self {
        Self {
            kind,
            code,
            message: message.to_string(),
            recipient: None,
            permanent,
        }
    }
}

/// Classify an SMTP reply into a bounce verdict.
///
/// This is a total function: every (code, message) pair yields a
/// classification, and unknown codes deliberately land on the soft side so
/// that nobody gets suppressed on the strength of a reply we do not
/// understand.
pub fn classify(code: u16, message: &str) -> Bounce {
    let lowered = message.to_lowercase();

    if COMPLAINT_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
        return Bounce::new(BounceKind::Complaint, code, message, true);
    }

    match code {
        552 if QUOTA_KEYWORDS.iter().any(|kw| lowered.contains(kw)) => {
            Bounce::new(BounceKind::Soft, code, message, false)
        }
        500..=599 => Bounce::new(BounceKind::Hard, code, message, true),
        400..=499 => Bounce::new(BounceKind::Soft, code, message, false),
        _ => Bounce::new(BounceKind::Soft, code, message, false),
    }
}

/// Fields pulled out of the `message/delivery-status` part of a DSN.
#[derive(Debug, Default)]
struct DsnFields {
    final_recipient: Option<String>,
    original_recipient: Option<String>,
    action: Option<String>,
    status: Option<String>,
    diagnostic_code: Option<String>,
}

/// Classify an RFC 3464 delivery status notification.
///
/// Accepts `multipart/report` messages whose `report-type` parameter is
/// `delivery-status` or absent (some MTAs omit it). Returns `None` when the
/// input is not a DSN, carries no `message/delivery-status` part, or its
/// enhanced status reports success (class 2).
pub fn classify_dsn(raw: &[u8]) -> Option<Bounce> {
    let message = MessageParser::default().parse(raw)?;

    let content_type = message.content_type()?;
    if !content_type.ctype().eq_ignore_ascii_case("multipart")
        || !content_type
            .subtype()
            .is_some_and(|s| s.eq_ignore_ascii_case("report"))
    {
        return None;
    }
    if let Some(report_type) = content_type.attribute("report-type")
        && !report_type.eq_ignore_ascii_case("delivery-status")
    {
        return None;
    }

    let status_body = message.parts.iter().find_map(|part| {
        let ct = part.content_type()?;
        if ct.ctype().eq_ignore_ascii_case("message")
            && ct
                .subtype()
                .is_some_and(|s| s.eq_ignore_ascii_case("delivery-status"))
        {
            match &part.body {
                PartType::Text(text) => Some(text.to_string()),
                PartType::Binary(bytes) | PartType::InlineBinary(bytes) => {
                    Some(String::from_utf8_lossy(bytes).into_owned())
                }
                _ => None,
            }
        } else {
            None
        }
    })?;

    let fields = parse_status_fields(&status_body);

    let recipient = fields
        .final_recipient
        .as_deref()
        .or(fields.original_recipient.as_deref())
        .map(strip_address_type);

    // Action gives the baseline, the diagnostic SMTP code sharpens it, and
    // the enhanced status code has the last word on hard vs soft.
    let mut bounce = match fields.action.as_deref() {
        Some("failed") => Bounce::new(BounceKind::Hard, 0, "", true),
        Some("delayed") | Some("relayed") | Some("expanded") => {
            Bounce::new(BounceKind::Soft, 0, "", false)
        }
        _ => Bounce::new(BounceKind::Soft, 0, "", false),
    };

    if let Some(diagnostic) = fields.diagnostic_code.as_deref() {
        let text = diagnostic
            .split_once(';')
            .map(|(_, rest)| rest.trim())
            .unwrap_or(diagnostic.trim());
        bounce.message = text.to_string();

        if let Some(code) = leading_smtp_code(text) {
            let classified = classify(code, text);
            bounce.kind = classified.kind;
            bounce.code = classified.code;
            bounce.permanent = classified.permanent;
        }
    }

    if let Some(status) = fields.status.as_deref()
        && let Some((class, subject, detail)) = parse_enhanced_status(status)
    {
        match class {
            2 => return None,
            5 => {
                if (subject, detail) == (2, 2) {
                    // mailbox full reported as permanent by some MTAs
                    bounce.kind = BounceKind::Soft;
                    bounce.permanent = false;
                } else if bounce.kind != BounceKind::Complaint {
                    bounce.kind = BounceKind::Hard;
                    bounce.permanent = true;
                }
                if bounce.code == 0 {
                    bounce.code = match subject {
                        3 | 4 | 7 => 554,
                        _ => 550,
                    };
                }
            }
            4 => {
                if bounce.kind != BounceKind::Complaint {
                    bounce.kind = BounceKind::Soft;
                    bounce.permanent = false;
                }
                if bounce.code == 0 {
                    bounce.code = match subject {
                        2 => 452,
                        4 => 421,
                        _ => 450,
                    };
                }
            }
            _ => {}
        }

        if bounce.message.is_empty() {
            bounce.message = format!("delivery status {status}");
        }
    }

    if bounce.code == 0 {
        bounce.code = match bounce.kind {
            BounceKind::Soft => 450,
            _ => 550,
        };
    }

    bounce.recipient = recipient;
    Some(bounce)
}

/// Parse `Key: value` groups from a delivery-status body. Groups are
/// separated by blank lines; the first value seen for a key wins, which
/// keeps the first recipient block when a DSN reports several.
fn parse_status_fields(body: &str) -> DsnFields {
    let mut fields = DsnFields::default();

    for line in body.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim().to_lowercase().as_str() {
            "final-recipient" if fields.final_recipient.is_none() => {
                fields.final_recipient = Some(value.to_string());
            }
            "original-recipient" if fields.original_recipient.is_none() => {
                fields.original_recipient = Some(value.to_string());
            }
            "action" if fields.action.is_none() => {
                fields.action = Some(value.to_lowercase());
            }
            "status" if fields.status.is_none() => {
                fields.status = Some(value.to_string());
            }
            "diagnostic-code" if fields.diagnostic_code.is_none() => {
                fields.diagnostic_code = Some(value.to_string());
            }
            _ => {}
        }
    }

    fields
}

/// Strip the RFC 3464 address-type prefix, e.g. `rfc822;bob@example.com`.
fn strip_address_type(value: &str) -> String {
    value
        .split_once(';')
        .map(|(_, address)| address.trim())
        .unwrap_or(value.trim())
        .to_string()
}

/// The leading three-digit SMTP code of a diagnostic text, when plausible.
fn leading_smtp_code(text: &str) -> Option<u16> {
    let token = text.split_whitespace().next()?;
    let code: u16 = token.parse().ok()?;
    (200..=599).contains(&code).then_some(code)
}

/// An RFC 3463 `class.subject.detail` triple.
fn parse_enhanced_status(status: &str) -> Option<(u8, u8, u8)> {
    let mut parts = status.trim().splitn(3, '.');
    let class = parts.next()?.parse().ok()?;
    let subject = parts.next()?.parse().ok()?;
    let detail = parts.next()?.parse().ok()?;
    Some((class, subject, detail))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hard_bounce_on_permanent_failure() {
        let bounce = classify(550, "User unknown");
        assert_eq!(bounce.kind, BounceKind::Hard);
        assert_eq!(bounce.code, 550);
        assert!(bounce.permanent);
    }

    #[test]
    fn soft_bounce_on_transient_failure() {
        let bounce = classify(452, "Insufficient system storage");
        assert_eq!(bounce.kind, BounceKind::Soft);
        assert_eq!(bounce.code, 452);
        assert!(!bounce.permanent);
    }

    #[test]
    fn complaint_keywords_dominate_every_code() {
        for code in [250, 421, 450, 550, 554] {
            let bounce = classify(code, "Message rejected as spam by content filter");
            assert_eq!(bounce.kind, BounceKind::Complaint, "code {code}");
            assert!(bounce.permanent, "code {code}");
        }
    }

    #[test]
    fn quota_on_552_is_soft() {
        let bounce = classify(552, "Requested action aborted: mailbox full");
        assert_eq!(bounce.kind, BounceKind::Soft);
        assert!(!bounce.permanent);

        // without a quota keyword 552 stays hard
        let bounce = classify(552, "Message size exceeds limit");
        assert_eq!(bounce.kind, BounceKind::Hard);
        assert!(bounce.permanent);
    }

    #[test]
    fn unknown_codes_never_suppress() {
        let bounce = classify(299, "completely made up");
        assert_eq!(bounce.kind, BounceKind::Soft);
        assert!(!bounce.permanent);
    }

    #[test]
    fn classification_is_pure() {
        assert_eq!(
            classify(550, "User unknown"),
            classify(550, "User unknown")
        );
    }

    fn dsn_fixture(status_block: &str) -> Vec<u8> {
        format!(
            "From: MAILER-DAEMON@mx.example.net\r\n\
             To: sender@example.org\r\n\
             Subject: Delivery Status Notification (Failure)\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: multipart/report; report-type=delivery-status; boundary=\"dsn\"\r\n\
             \r\n\
             --dsn\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             The following message could not be delivered.\r\n\
             --dsn\r\n\
             Content-Type: message/delivery-status\r\n\
             \r\n\
             Reporting-MTA: dns; mx.example.net\r\n\
             \r\n\
             {status_block}\r\n\
             --dsn--\r\n"
        )
        .into_bytes()
    }

    #[test]
    fn dsn_hard_bounce_with_diagnostic() {
        let raw = dsn_fixture(
            "Final-Recipient: rfc822;bob@example.com\r\n\
             Action: failed\r\n\
             Status: 5.1.1\r\n\
             Diagnostic-Code: smtp; 550 5.1.1 User unknown",
        );

        let bounce = classify_dsn(&raw).unwrap();
        assert_eq!(bounce.recipient.as_deref(), Some("bob@example.com"));
        assert_eq!(bounce.code, 550);
        assert_eq!(bounce.kind, BounceKind::Hard);
        assert!(bounce.permanent);
    }

    #[test]
    fn dsn_falls_back_to_original_recipient() {
        let raw = dsn_fixture(
            "Original-Recipient: rfc822;carol@example.com\r\n\
             Action: failed\r\n\
             Status: 5.7.1",
        );

        let bounce = classify_dsn(&raw).unwrap();
        assert_eq!(bounce.recipient.as_deref(), Some("carol@example.com"));
        assert_eq!(bounce.code, 554);
        assert_eq!(bounce.kind, BounceKind::Hard);
    }

    #[test]
    fn dsn_delayed_action_is_soft() {
        let raw = dsn_fixture(
            "Final-Recipient: rfc822;dave@example.com\r\n\
             Action: delayed\r\n\
             Status: 4.4.1",
        );

        let bounce = classify_dsn(&raw).unwrap();
        assert_eq!(bounce.kind, BounceKind::Soft);
        assert_eq!(bounce.code, 421);
        assert!(!bounce.permanent);
    }

    #[test]
    fn dsn_mailbox_full_demoted_to_soft() {
        let raw = dsn_fixture(
            "Final-Recipient: rfc822;erin@example.com\r\n\
             Action: failed\r\n\
             Status: 5.2.2",
        );

        let bounce = classify_dsn(&raw).unwrap();
        assert_eq!(bounce.kind, BounceKind::Soft);
        assert!(!bounce.permanent);
    }

    #[test]
    fn dsn_success_class_is_not_a_bounce() {
        let raw = dsn_fixture(
            "Final-Recipient: rfc822;frank@example.com\r\n\
             Action: relayed\r\n\
             Status: 2.0.0",
        );

        assert!(classify_dsn(&raw).is_none());
    }

    #[test]
    fn dsn_requires_delivery_status_report_type() {
        let raw = b"From: a@b.c\r\n\
            Content-Type: multipart/report; report-type=disposition-notification; boundary=\"x\"\r\n\
            \r\n\
            --x\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            hi\r\n\
            --x--\r\n";

        assert!(classify_dsn(raw).is_none());
    }

    #[test]
    fn dsn_rejects_plain_messages() {
        assert!(classify_dsn(b"Subject: hi\r\n\r\nhello\r\n").is_none());
    }
}
