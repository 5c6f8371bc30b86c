use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::models::TlsPolicy;

/// Prefix for environment overrides. The rest of the variable name walks
/// the settings tree with `_` as the path separator, e.g.
/// `SENDMILL_SMTP_HOSTNAME` sets `smtp.hostname`.
const ENV_PREFIX: &str = "SENDMILL";

/// Every overridable key. Environment lookup goes key → variable, never
/// the other way around, so underscores inside leaf names stay unambiguous.
const ENV_KEYS: &[&str] = &[
    "server.address",
    "server.request_timeout_secs",
    "server.shutdown_timeout_secs",
    "database.host",
    "database.port",
    "database.user",
    "database.password",
    "database.name",
    "database.max_connections",
    "redis.url",
    "redis.db",
    "auth.jwt_secret",
    "auth.jwt_expiry_hours",
    "auth.api_key_prefix",
    "auth.bcrypt_cost",
    "smtp.hostname",
    "smtp.helo_domain",
    "smtp.tls_policy",
    "smtp.mode",
    "smtp.connect_timeout_secs",
    "smtp.send_timeout_secs",
    "smtp.max_recipients",
    "smtp.relay_host",
    "smtp.relay_port",
    "smtp.relay_username",
    "smtp.relay_password",
    "smtp_inbound.enabled",
    "smtp_inbound.address",
    "smtp_inbound.domain",
    "smtp_inbound.max_message_bytes",
    "smtp_inbound.read_timeout_secs",
    "dkim.selector",
    "dkim.key_bits",
    "dkim.master_key",
    "workers.concurrency",
    "workers.critical_weight",
    "workers.default_weight",
    "workers.low_weight",
    "workers.max_retries",
    "workers.retry_delays_secs",
    "rate_limit.enabled",
    "rate_limit.default_rps",
    "rate_limit.send_rps",
    "rate_limit.batch_rps",
    "rate_limit.window_secs",
    "webhook.timeout_secs",
    "webhook.max_retries",
    "webhook.retry_delays_secs",
    "dns.nameserver",
    "dns.timeout_secs",
    "dns.cache_ttl_secs",
    "logging.level",
    "logging.format",
    "storage.kind",
    "storage.path",
    "suppression.on_hard_bounce",
    "suppression.on_complaint",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SendMode {
    #[default]
    Direct,
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    Local,
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub address: String,
    pub request_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8080".to_string(),
            request_timeout_secs: 30,
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "sendmill".to_string(),
            password: String::new(),
            name: "sendmill".to_string(),
            max_connections: 10,
        }
    }
}

impl DatabaseSettings {
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: String,
    pub db: i64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            db: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub jwt_secret: String,
    pub jwt_expiry_hours: u64,
    pub api_key_prefix: String,
    pub bcrypt_cost: u32,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            jwt_expiry_hours: 24,
            api_key_prefix: "re_".to_string(),
            bcrypt_cost: 12,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpSettings {
    /// Public hostname of this node, used for HELO/EHLO.
    pub hostname: String,
    pub helo_domain: Option<String>,
    pub tls_policy: TlsPolicy,
    pub mode: SendMode,
    pub connect_timeout_secs: u64,
    pub send_timeout_secs: u64,
    pub max_recipients: usize,
    pub relay_host: String,
    pub relay_port: u16,
    pub relay_username: String,
    pub relay_password: String,
}

impl Default for SmtpSettings {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            helo_domain: None,
            tls_policy: TlsPolicy::Opportunistic,
            mode: SendMode::Direct,
            connect_timeout_secs: 30,
            send_timeout_secs: 300,
            max_recipients: 50,
            relay_host: String::new(),
            relay_port: 587,
            relay_username: String::new(),
            relay_password: String::new(),
        }
    }
}

impl SmtpSettings {
    pub fn helo_domain(&self) -> &str {
        self.helo_domain.as_deref().unwrap_or(&self.hostname)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundSettings {
    pub enabled: bool,
    pub address: String,
    pub domain: String,
    pub max_message_bytes: usize,
    pub read_timeout_secs: u64,
}

impl Default for InboundSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "0.0.0.0:25".to_string(),
            domain: String::new(),
            max_message_bytes: 25 * 1024 * 1024,
            read_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DkimSettings {
    pub selector: String,
    pub key_bits: u32,
    /// Hex-encoded 32-byte master key encrypting private keys at rest.
    pub master_key: String,
}

impl Default for DkimSettings {
    fn default() -> Self {
        Self {
            selector: "sendmill".to_string(),
            key_bits: 2048,
            master_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub critical_weight: u8,
    pub default_weight: u8,
    pub low_weight: u8,
    pub max_retries: u32,
    pub retry_delays_secs: Vec<u64>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 10,
            critical_weight: 6,
            default_weight: 3,
            low_weight: 1,
            max_retries: 5,
            retry_delays_secs: vec![30, 120, 600, 1800, 7200],
        }
    }
}

impl WorkerSettings {
    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub default_rps: u32,
    pub send_rps: u32,
    pub batch_rps: u32,
    pub window_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_rps: 10,
            send_rps: 10,
            batch_rps: 2,
            window_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookSettings {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delays_secs: Vec<u64>,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 5,
            retry_delays_secs: vec![30, 120, 600, 1800, 7200],
        }
    }
}

impl WebhookSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSettings {
    pub nameserver: Option<String>,
    pub timeout_secs: u64,
    pub cache_ttl_secs: u64,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            nameserver: None,
            timeout_secs: 10,
            cache_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub kind: StorageKind,
    pub path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            kind: StorageKind::Local,
            path: "./storage".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuppressionSettings {
    pub on_hard_bounce: bool,
    pub on_complaint: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    pub auth: AuthSettings,
    pub smtp: SmtpSettings,
    pub smtp_inbound: InboundSettings,
    pub dkim: DkimSettings,
    pub workers: WorkerSettings,
    pub rate_limit: RateLimitSettings,
    pub webhook: WebhookSettings,
    pub dns: DnsSettings,
    pub logging: LoggingSettings,
    pub storage: StorageSettings,
    pub suppression: SuppressionSettings,
}

impl Settings {
    /// Defaults, overlaid with the YAML file (when given or present at
    /// ./sendmill.yaml) and `SENDMILL_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Settings::default())?);

        let file = path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "sendmill.yaml".to_string());
        builder = builder.add_source(File::new(&file, FileFormat::Yaml).required(path.is_some()));

        for key in ENV_KEYS {
            let variable = format!(
                "{ENV_PREFIX}_{}",
                key.replace('.', "_").to_ascii_uppercase()
            );
            let Ok(value) = std::env::var(&variable) else {
                continue;
            };

            // list-valued knobs take comma-separated values
            if key.ends_with("retry_delays_secs") {
                let parts: Vec<String> =
                    value.split(',').map(|v| v.trim().to_string()).collect();
                builder = builder.set_override(*key, parts)?;
            } else {
                builder = builder.set_override(*key, value)?;
            }
        }

        let settings: Settings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }

    /// Check the whole surface at once and report every violation in a
    /// single error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.auth.jwt_secret.is_empty() {
            problems.push("auth.jwt_secret is required".to_string());
        } else if self.auth.jwt_secret.len() < 32 {
            problems.push("auth.jwt_secret must be at least 32 characters".to_string());
        }

        if self.smtp.hostname.is_empty() {
            problems.push("smtp.hostname is required".to_string());
        }

        if self.dkim.master_key.is_empty() {
            problems.push("dkim.master_key is required".to_string());
        } else {
            match hex::decode(&self.dkim.master_key) {
                Ok(bytes) if bytes.len() == 32 => {}
                _ => problems
                    .push("dkim.master_key must be 64 hex characters (32 bytes)".to_string()),
            }
        }

        if self.dkim.key_bits < 1024 {
            problems.push("dkim.key_bits must be at least 1024".to_string());
        }

        if self.smtp.mode == SendMode::Relay && self.smtp.relay_host.is_empty() {
            problems.push("smtp.relay_host is required in relay mode".to_string());
        }

        if self.smtp.max_recipients == 0 {
            problems.push("smtp.max_recipients must be positive".to_string());
        }

        if self.workers.concurrency == 0 {
            problems.push("workers.concurrency must be positive".to_string());
        }

        if self.workers.retry_delays_secs.is_empty() {
            problems.push("workers.retry_delays_secs must not be empty".to_string());
        }

        if self.webhook.retry_delays_secs.is_empty() {
            problems.push("webhook.retry_delays_secs must not be empty".to_string());
        }

        if self.rate_limit.enabled {
            if self.rate_limit.window_secs == 0 {
                problems.push("rate_limit.window_secs must be positive".to_string());
            }
            for (name, rps) in [
                ("rate_limit.default_rps", self.rate_limit.default_rps),
                ("rate_limit.send_rps", self.rate_limit.send_rps),
                ("rate_limit.batch_rps", self.rate_limit.batch_rps),
            ] {
                if rps == 0 {
                    problems.push(format!("{name} must be positive"));
                }
            }
        }

        if self.smtp_inbound.enabled && self.smtp_inbound.max_message_bytes == 0 {
            problems.push("smtp_inbound.max_message_bytes must be positive".to_string());
        }

        if self.storage.kind == StorageKind::Local && self.storage.path.is_empty() {
            problems.push("storage.path is required for local storage".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems.join("; ")))
        }
    }
}

impl Default for SuppressionSettings {
    fn default() -> Self {
        Self {
            on_hard_bounce: true,
            on_complaint: true,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn valid() -> Settings {
        let mut settings = Settings::default();
        settings.auth.jwt_secret = "0123456789abcdef0123456789abcdef".to_string();
        settings.smtp.hostname = "mail.sendmill.test".to_string();
        settings.dkim.master_key = "00".repeat(32);
        settings
    }

    #[test]
    fn defaults_validate_once_required_fields_are_set() {
        valid().validate().unwrap();
    }

    #[test]
    fn all_missing_fields_are_reported_together() {
        let err = Settings::default().validate().unwrap_err();
        let message = err.to_string();

        assert!(message.contains("auth.jwt_secret"));
        assert!(message.contains("smtp.hostname"));
        assert!(message.contains("dkim.master_key"));
    }

    #[test]
    fn short_jwt_secret_is_rejected() {
        let mut settings = valid();
        settings.auth.jwt_secret = "too short".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("32 characters"));
    }

    #[test]
    fn master_key_must_be_32_hex_bytes() {
        let mut settings = valid();
        settings.dkim.master_key = "abcd".to_string();
        assert!(settings.validate().is_err());

        settings.dkim.master_key = "zz".repeat(32);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn relay_mode_requires_a_relay_host() {
        let mut settings = valid();
        settings.smtp.mode = SendMode::Relay;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("relay_host"));

        settings.smtp.relay_host = "smtp.upstream.test".to_string();
        settings.validate().unwrap();
    }

    #[test]
    fn default_retry_schedule_matches_policy() {
        assert_eq!(
            Settings::default().workers.retry_delays_secs,
            vec![30, 120, 600, 1800, 7200]
        );
    }

    #[test]
    fn helo_falls_back_to_hostname() {
        let mut settings = valid();
        assert_eq!(settings.smtp.helo_domain(), "mail.sendmill.test");
        settings.smtp.helo_domain = Some("helo.sendmill.test".to_string());
        assert_eq!(settings.smtp.helo_domain(), "helo.sendmill.test");
    }
}
