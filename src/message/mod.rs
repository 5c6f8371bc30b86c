use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod encoding;

use encoding::{base64_wrapped, encode_header_value, quoted_printable};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: Option<String>,
    pub content: Vec<u8>,
}

/// A fully specified message on its way out, before MIME assembly and
/// DKIM signing.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub attachments: Vec<Attachment>,
    pub headers: Vec<(String, String)>,
    pub message_id: String,
}

impl OutgoingMessage {
    /// Every unique envelope recipient across To, Cc and Bcc: lowercased,
    /// trimmed, empties skipped, first-seen order preserved.
    pub fn collect_recipients(&self) -> Vec<String> {
        let mut seen = Vec::new();

        for address in self.to.iter().chain(&self.cc).chain(&self.bcc) {
            let normalized = address.trim().to_lowercase();
            if normalized.is_empty() || seen.contains(&normalized) {
                continue;
            }
            seen.push(normalized);
        }

        seen
    }

    /// Assemble the RFC 5322 wire form. The header order is fixed and the
    /// multipart boundaries derive from the Message-ID, so rebuilding the
    /// same message with the same clock yields identical bytes — a
    /// requirement for reproducible DKIM signatures.
    pub fn build(&self, date: DateTime<Utc>) -> Vec<u8> {
        let mut out = String::new();

        push_header(&mut out, "From", &self.from);
        if !self.to.is_empty() {
            push_header(&mut out, "To", &self.to.join(", "));
        }
        if !self.cc.is_empty() {
            push_header(&mut out, "Cc", &self.cc.join(", "));
        }
        if let Some(reply_to) = &self.reply_to {
            push_header(&mut out, "Reply-To", reply_to);
        }
        push_header(&mut out, "Subject", &encode_header_value(&self.subject));
        push_header(&mut out, "Date", &date.to_rfc2822());
        push_header(&mut out, "Message-ID", &format!("<{}>", self.message_id));
        push_header(&mut out, "MIME-Version", "1.0");

        let body = self.build_body(&mut out);

        for (name, value) in &self.headers {
            push_header(&mut out, name, &encode_header_value(value));
        }

        out.push_str("\r\n");
        out.push_str(&body);

        out.into_bytes()
    }

    /// Write the Content-Type header for the selected body shape into
    /// `headers` and return the corresponding body text.
    fn build_body(&self, headers: &mut String) -> String {
        let has_text = self.text_body.is_some();
        let has_html = self.html_body.is_some();

        if !self.attachments.is_empty() {
            let boundary = self.boundary("mixed");
            push_header(
                headers,
                "Content-Type",
                &format!("multipart/mixed; boundary=\"{boundary}\""),
            );

            let mut body = String::new();
            body.push_str(&format!("--{boundary}\r\n"));
            if has_text && has_html {
                body.push_str(&self.alternative_part());
            } else {
                body.push_str(&self.single_part());
            }
            for attachment in &self.attachments {
                body.push_str(&format!("--{boundary}\r\n"));
                body.push_str(&attachment_part(attachment));
            }
            body.push_str(&format!("--{boundary}--\r\n"));
            body
        } else if has_text && has_html {
            let boundary = self.boundary("alt");
            push_header(
                headers,
                "Content-Type",
                &format!("multipart/alternative; boundary=\"{boundary}\""),
            );

            let mut body = String::new();
            body.push_str(&format!("--{boundary}\r\n"));
            body.push_str(&text_part(
                "text/plain",
                self.text_body.as_deref().unwrap_or_default(),
            ));
            body.push_str(&format!("--{boundary}\r\n"));
            body.push_str(&text_part(
                "text/html",
                self.html_body.as_deref().unwrap_or_default(),
            ));
            body.push_str(&format!("--{boundary}--\r\n"));
            body
        } else if has_html {
            push_header(headers, "Content-Type", "text/html; charset=utf-8");
            push_header(headers, "Content-Transfer-Encoding", "quoted-printable");
            let mut body = quoted_printable(self.html_body.as_deref().unwrap_or_default());
            body.push_str("\r\n");
            body
        } else {
            push_header(headers, "Content-Type", "text/plain; charset=utf-8");
            push_header(headers, "Content-Transfer-Encoding", "quoted-printable");
            let mut body = quoted_printable(self.text_body.as_deref().unwrap_or_default());
            body.push_str("\r\n");
            body
        }
    }

    /// The alternative part nested inside a mixed message, with its own
    /// headers and boundary.
    fn alternative_part(&self) -> String {
        let boundary = self.boundary("alt");
        let mut part = String::new();
        part.push_str(&format!(
            "Content-Type: multipart/alternative; boundary=\"{boundary}\"\r\n\r\n"
        ));
        part.push_str(&format!("--{boundary}\r\n"));
        part.push_str(&text_part(
            "text/plain",
            self.text_body.as_deref().unwrap_or_default(),
        ));
        part.push_str(&format!("--{boundary}\r\n"));
        part.push_str(&text_part(
            "text/html",
            self.html_body.as_deref().unwrap_or_default(),
        ));
        part.push_str(&format!("--{boundary}--\r\n"));
        part
    }

    fn single_part(&self) -> String {
        if let Some(html) = &self.html_body {
            text_part("text/html", html)
        } else {
            text_part("text/plain", self.text_body.as_deref().unwrap_or_default())
        }
    }

    /// A boundary that is unique per message and per nesting level, but
    /// stable across rebuilds of the same message.
    fn boundary(&self, level: &str) -> String {
        let digest = Sha256::digest(format!("{}:{level}", self.message_id).as_bytes());
        format!("=_sm_{}", hex::encode(&digest[..12]))
    }
}

fn push_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str("\r\n");
}

fn text_part(content_type: &str, body: &str) -> String {
    format!(
        "Content-Type: {content_type}; charset=utf-8\r\n\
         Content-Transfer-Encoding: quoted-printable\r\n\
         \r\n\
         {}\r\n",
        quoted_printable(body)
    )
}

fn attachment_part(attachment: &Attachment) -> String {
    let content_type = attachment
        .content_type
        .as_deref()
        .unwrap_or("application/octet-stream");

    format!(
        "Content-Type: {content_type}\r\n\
         Content-Transfer-Encoding: base64\r\n\
         Content-Disposition: attachment; filename=\"{}\"\r\n\
         \r\n\
         {}",
        attachment.filename.replace('"', ""),
        base64_wrapped(&attachment.content)
    )
}

#[cfg(test)]
mod test {
    use super::*;

    fn message() -> OutgoingMessage {
        OutgoingMessage {
            from: "a@x".to_string(),
            to: vec!["b@y".to_string()],
            subject: "Dual".to_string(),
            text_body: Some("t".to_string()),
            html_body: Some("<p>h</p>".to_string()),
            message_id: "msg-1@x".to_string(),
            ..Default::default()
        }
    }

    fn fixed_date() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .into()
    }

    #[test]
    fn recipients_are_deduped_lowercased_in_order() {
        let msg = OutgoingMessage {
            to: vec!["A@x.com ".to_string(), "b@y.com".to_string()],
            cc: vec!["a@x.com".to_string(), "".to_string(), "C@z.com".to_string()],
            bcc: vec!["b@Y.com".to_string(), "d@w.com".to_string()],
            ..Default::default()
        };

        assert_eq!(
            msg.collect_recipients(),
            vec!["a@x.com", "b@y.com", "c@z.com", "d@w.com"]
        );
    }

    #[test]
    fn dual_body_builds_multipart_alternative() {
        let raw = String::from_utf8(message().build(fixed_date())).unwrap();

        assert!(raw.contains("Content-Type: multipart/alternative"));
        assert!(!raw.contains("multipart/mixed"));
        assert!(raw.contains("Content-Type: text/plain; charset=utf-8"));
        assert!(raw.contains("Content-Type: text/html; charset=utf-8"));
        assert!(raw.contains("<p>h</p>"));
    }

    #[test]
    fn bcc_never_reaches_the_wire() {
        let mut msg = message();
        msg.bcc = vec!["secret@hidden.example".to_string()];

        let raw = String::from_utf8(msg.build(fixed_date())).unwrap();
        assert!(!raw.contains("secret@hidden.example"));
        assert!(!raw.contains("Bcc"));
        // but the envelope still sees it
        assert!(msg.collect_recipients().contains(&"secret@hidden.example".to_string()));
    }

    #[test]
    fn header_order_is_fixed() {
        let mut msg = message();
        msg.cc = vec!["c@z".to_string()];
        msg.reply_to = Some("r@x".to_string());
        msg.headers = vec![("X-Entity-Ref".to_string(), "abc".to_string())];

        let raw = String::from_utf8(msg.build(fixed_date())).unwrap();
        let positions: Vec<usize> = [
            "From:", "To:", "Cc:", "Reply-To:", "Subject:", "Date:", "Message-ID:",
            "MIME-Version:", "Content-Type:", "X-Entity-Ref:",
        ]
        .iter()
        .map(|header| raw.find(header).unwrap_or_else(|| panic!("missing {header}")))
        .collect();

        for window in positions.windows(2) {
            assert!(window[0] < window[1]);
        }
    }

    #[test]
    fn rebuild_is_byte_identical() {
        let msg = message();
        assert_eq!(msg.build(fixed_date()), msg.build(fixed_date()));
    }

    #[test]
    fn html_only_is_a_single_part() {
        let mut msg = message();
        msg.text_body = None;

        let raw = String::from_utf8(msg.build(fixed_date())).unwrap();
        assert!(raw.contains("Content-Type: text/html; charset=utf-8"));
        assert!(!raw.contains("multipart"));
    }

    #[test]
    fn empty_message_is_plain_text() {
        let mut msg = message();
        msg.text_body = None;
        msg.html_body = None;

        let raw = String::from_utf8(msg.build(fixed_date())).unwrap();
        assert!(raw.contains("Content-Type: text/plain; charset=utf-8"));
    }

    #[test]
    fn attachments_force_multipart_mixed() {
        let mut msg = message();
        msg.attachments = vec![Attachment {
            filename: "report.pdf".to_string(),
            content_type: Some("application/pdf".to_string()),
            content: vec![1, 2, 3, 4],
        }];

        let raw = String::from_utf8(msg.build(fixed_date())).unwrap();
        assert!(raw.contains("multipart/mixed"));
        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains("Content-Disposition: attachment; filename=\"report.pdf\""));
        assert!(raw.contains("Content-Transfer-Encoding: base64"));
    }

    #[test]
    fn attachment_without_type_defaults_to_octet_stream() {
        let mut msg = message();
        msg.text_body = None;
        msg.html_body = None;
        msg.attachments = vec![Attachment {
            filename: "blob".to_string(),
            content_type: None,
            content: vec![0; 64],
        }];

        let raw = String::from_utf8(msg.build(fixed_date())).unwrap();
        assert!(raw.contains("Content-Type: application/octet-stream"));
    }

    #[test]
    fn unicode_subject_is_rfc2047_encoded() {
        let mut msg = message();
        msg.subject = "Grüße".to_string();

        let raw = String::from_utf8(msg.build(fixed_date())).unwrap();
        assert!(raw.contains("Subject: =?utf-8?B?"));
        assert!(!raw.contains("Grüße"));
    }

    #[test]
    fn message_id_is_angle_wrapped() {
        let raw = String::from_utf8(message().build(fixed_date())).unwrap();
        assert!(raw.contains("Message-ID: <msg-1@x>"));
    }
}
