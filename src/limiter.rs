use redis::{AsyncCommands, aio::ConnectionManager};
use std::net::IpAddr;
use tracing::warn;

use crate::config::RateLimitSettings;
use crate::models::TenantId;

/// Which request budget a call draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitClass {
    Default,
    Send,
    Batch,
}

impl LimitClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitClass::Default => "default",
            LimitClass::Send => "send",
            LimitClass::Batch => "batch",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Unix second at which the current window has fully rotated out.
    pub reset: i64,
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    fn open(limit: u64, reset: i64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset,
            retry_after_secs: None,
        }
    }

    /// The standard rate-limit response headers, plus Retry-After when
    /// the request was refused.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset.to_string()),
        ];
        if let Some(retry_after) = self.retry_after_secs {
            headers.push(("Retry-After", retry_after.to_string()));
        }
        headers
    }
}

/// Redis sliding-window counters, one key per second per tenant and
/// class. When Redis is unreachable the limiter fails open: availability
/// beats enforcement here.
#[derive(Clone)]
pub struct RateLimiter {
    redis: ConnectionManager,
    settings: RateLimitSettings,
}

impl RateLimiter {
    pub fn new(redis: ConnectionManager, settings: RateLimitSettings) -> Self {
        Self { redis, settings }
    }

    fn rps_for(&self, class: LimitClass) -> u64 {
        match class {
            LimitClass::Default => self.settings.default_rps as u64,
            LimitClass::Send => self.settings.send_rps as u64,
            LimitClass::Batch => self.settings.batch_rps as u64,
        }
    }

    pub async fn check_tenant(&self, tenant: TenantId, class: LimitClass) -> RateLimitDecision {
        let now = chrono::Utc::now().timestamp();
        let window = self.settings.window_secs as i64;
        let limit = self.rps_for(class) * self.settings.window_secs as u64;
        let reset = now + window;

        if !self.settings.enabled {
            return RateLimitDecision::open(limit, reset);
        }

        let keys = tenant_window_keys(tenant, class, now, window);
        match self.count_window(&keys[0], &keys, window).await {
            Ok(count) => decide(count, limit, reset),
            Err(err) => {
                warn!("rate limiter failing open, redis unreachable: {err}");
                RateLimitDecision::open(limit, reset)
            }
        }
    }

    /// IP-scoped limiting for unauthenticated endpoints (registration,
    /// login). One bucket per window rather than per second.
    pub async fn check_ip(&self, path: &str, ip: IpAddr) -> RateLimitDecision {
        let now = chrono::Utc::now().timestamp();
        let window = self.settings.window_secs as i64;
        let limit = self.settings.default_rps as u64 * self.settings.window_secs as u64;
        let window_index = now / window.max(1);
        let reset = (window_index + 1) * window;

        if !self.settings.enabled {
            return RateLimitDecision::open(limit, reset);
        }

        let key = format!("ratelimit:ip:{path}:{ip}:{window_index}");
        match self.count_window(&key, std::slice::from_ref(&key), window).await {
            Ok(count) => decide(count, limit, reset),
            Err(err) => {
                warn!("rate limiter failing open, redis unreachable: {err}");
                RateLimitDecision::open(limit, reset)
            }
        }
    }

    /// INCR the current bucket, refresh its expiry to outlive the
    /// window twice over, and sum every bucket still inside the window.
    async fn count_window(
        &self,
        current_key: &str,
        keys: &[String],
        window: i64,
    ) -> Result<u64, redis::RedisError> {
        let mut redis = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.incr(current_key, 1u64);
        pipe.expire(current_key, window * 2).ignore();
        let (current,): (u64,) = pipe.query_async(&mut redis).await?;

        if keys.len() == 1 {
            return Ok(current);
        }

        let counts: Vec<Option<u64>> = redis.mget(keys).await?;
        let mut total: u64 = 0;
        for (key, count) in keys.iter().zip(&counts) {
            if key == current_key {
                total += current;
            } else {
                total += count.unwrap_or(0);
            }
        }
        Ok(total)
    }
}

fn decide(count: u64, limit: u64, reset: i64) -> RateLimitDecision {
    if count <= limit {
        RateLimitDecision {
            allowed: true,
            limit,
            remaining: limit - count,
            reset,
            retry_after_secs: None,
        }
    } else {
        RateLimitDecision {
            allowed: false,
            limit,
            remaining: 0,
            reset,
            retry_after_secs: Some(1),
        }
    }
}

/// The per-second bucket keys covering the window ending now; the
/// current second comes first.
fn tenant_window_keys(
    tenant: TenantId,
    class: LimitClass,
    now: i64,
    window: i64,
) -> Vec<String> {
    (0..window.max(1))
        .map(|offset| {
            format!(
                "ratelimit:{tenant}:{}:{}",
                class.as_str(),
                now - offset
            )
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn window_keys_cover_each_second_current_first() {
        let tenant = TenantId::from(Uuid::nil());
        let keys = tenant_window_keys(tenant, LimitClass::Send, 1_000_000, 3);

        assert_eq!(keys.len(), 3);
        assert!(keys[0].ends_with(":send:1000000"));
        assert!(keys[1].ends_with(":send:999999"));
        assert!(keys[2].ends_with(":send:999998"));
        assert!(keys[0].starts_with(&format!("ratelimit:{tenant}:")));
    }

    #[test]
    fn decisions_expose_rate_limit_headers() {
        let allowed = decide(3, 10, 1_000_010);
        assert!(allowed.allowed);
        let headers = allowed.headers();
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0], ("X-RateLimit-Limit", "10".to_string()));
        assert_eq!(headers[1], ("X-RateLimit-Remaining", "7".to_string()));

        let refused = decide(11, 10, 1_000_010);
        assert!(!refused.allowed);
        assert_eq!(refused.remaining, 0);
        let headers = refused.headers();
        assert_eq!(headers[3].0, "Retry-After");
    }

    #[test]
    fn counts_at_the_limit_still_pass() {
        assert!(decide(10, 10, 0).allowed);
        assert!(!decide(11, 10, 0).allowed);
    }
}
