use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::handler::Handlers;
use crate::models::{self, EmailId};

static HREF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"href="([^"]*)""#).expect("static pattern"));

impl Handlers {
    /// Rewrite an HTML body for click and open tracking. Each outbound
    /// link gets a durable `TrackingLink` row and a redirect URL; the
    /// open pixel lands just before `</body>`.
    pub(super) async fn inject_tracking(
        &self,
        html: &str,
        email_id: EmailId,
        click: bool,
        open: bool,
    ) -> Result<String, models::Error> {
        let mut html = html.to_string();

        if click {
            let mut redirects = HashMap::new();
            for url in trackable_urls(&html) {
                let link_id = self.tracking.create(email_id, &url).await?;
                redirects.insert(url, format!("{}/t/c/{link_id}", self.settings.base_url));
            }
            html = rewrite_links(&html, |url| redirects.get(url).cloned());
        }

        if open {
            let pixel = format!(
                r#"<img src="{}/t/o/{email_id}.png" width="1" height="1" alt="" />"#,
                self.settings.base_url
            );
            html = append_pixel(&html, &pixel);
        }

        Ok(html)
    }
}

/// Unique http(s) link targets in document order.
pub(super) fn trackable_urls(html: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for captures in HREF.captures_iter(html) {
        let url = &captures[1];
        if is_trackable(url) && !seen.iter().any(|s| s == url) {
            seen.push(url.to_string());
        }
    }
    seen
}

/// Mail clients choke on rewritten mailto:, tel: and fragment links, so
/// only web URLs are redirected.
fn is_trackable(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

pub(super) fn rewrite_links(
    html: &str,
    map: impl Fn(&str) -> Option<String>,
) -> String {
    HREF.replace_all(html, |captures: &regex::Captures| {
        match map(&captures[1]) {
            Some(tracked) => format!(r#"href="{tracked}""#),
            None => captures[0].to_string(),
        }
    })
    .into_owned()
}

pub(super) fn append_pixel(html: &str, pixel: &str) -> String {
    let lowered = html.to_lowercase();
    if let Some(position) = lowered.rfind("</body>") {
        let mut out = String::with_capacity(html.len() + pixel.len());
        out.push_str(&html[..position]);
        out.push_str(pixel);
        out.push_str(&html[position..]);
        out
    } else {
        format!("{html}{pixel}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn urls_are_collected_once_in_order() {
        let html = r##"<a href="https://a.test/x">1</a>
                      <a href="https://b.test/y">2</a>
                      <a href="https://a.test/x">again</a>
                      <a href="mailto:hi@a.test">mail</a>
                      <a href="#section">anchor</a>"##;

        assert_eq!(
            trackable_urls(html),
            vec!["https://a.test/x", "https://b.test/y"]
        );
    }

    #[test]
    fn links_are_rewritten_but_untracked_targets_stay() {
        let html = r#"<a href="https://a.test/x">1</a> <a href="mailto:x@y">m</a>"#;

        let rewritten = rewrite_links(html, |url| {
            (url == "https://a.test/x").then(|| "https://sm.test/t/c/1".to_string())
        });

        assert!(rewritten.contains(r#"href="https://sm.test/t/c/1""#));
        assert!(rewritten.contains(r#"href="mailto:x@y""#));
        assert!(!rewritten.contains(r#"href="https://a.test/x""#));
    }

    #[test]
    fn pixel_lands_before_the_closing_body_tag() {
        let html = "<html><body><p>hi</p></body></html>";
        let out = append_pixel(html, "<img src=\"px\" />");
        assert_eq!(out, "<html><body><p>hi</p><img src=\"px\" /></body></html>");
    }

    #[test]
    fn pixel_appends_when_no_body_tag_exists() {
        let out = append_pixel("<p>hi</p>", "<img/>");
        assert_eq!(out, "<p>hi</p><img/>");
    }

    #[test]
    fn uppercase_body_tag_is_found() {
        let out = append_pixel("<BODY>x</BODY>", "<img/>");
        assert_eq!(out, "<BODY>x<img/></BODY>");
    }
}
