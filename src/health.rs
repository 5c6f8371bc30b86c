use async_trait::async_trait;
use futures::future::join_all;
use redis::aio::ConnectionManager;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;
use tracing::error;

const PING_DEADLINE: Duration = Duration::from_secs(3);

/// A dependency that can be pinged for liveness.
#[async_trait]
pub trait Pinger: Send + Sync {
    fn name(&self) -> &'static str;
    async fn ping(&self) -> Result<(), String>;
}

pub struct DbPinger {
    pool: PgPool,
}

impl DbPinger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Pinger for DbPinger {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn ping(&self) -> Result<(), String> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|err| err.to_string())
    }
}

pub struct RedisPinger {
    redis: ConnectionManager,
}

impl RedisPinger {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl Pinger for RedisPinger {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<(), String> {
        let mut redis = self.redis.clone();
        redis::cmd("PING")
            .query_async::<()>(&mut redis)
            .await
            .map_err(|err| err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyState {
    Ok,
    Unavailable,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub dependencies: BTreeMap<&'static str, DependencyState>,
}

impl HealthReport {
    pub fn degraded(&self) -> bool {
        self.status != "ok"
    }
}

/// Aggregated health state: dependency pingers plus the readiness flag
/// that graceful shutdown flips before draining.
#[derive(Clone)]
pub struct Health {
    pingers: Arc<Vec<Box<dyn Pinger>>>,
    ready: Arc<AtomicBool>,
    deadline: Duration,
}

impl Health {
    pub fn new(pingers: Vec<Box<dyn Pinger>>) -> Self {
        Self {
            pingers: Arc::new(pingers),
            ready: Arc::new(AtomicBool::new(true)),
            deadline: PING_DEADLINE,
        }
    }

    #[cfg(test)]
    fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Ping every dependency concurrently under one deadline.
    pub async fn check(&self) -> HealthReport {
        let checks = self.pingers.iter().map(|pinger| async {
            let state = match tokio::time::timeout(self.deadline, pinger.ping()).await {
                Ok(Ok(())) => DependencyState::Ok,
                Ok(Err(err)) => {
                    error!(dependency = pinger.name(), "dependency ping failed: {err}");
                    DependencyState::Unavailable
                }
                Err(_) => {
                    error!(dependency = pinger.name(), "dependency ping timed out");
                    DependencyState::Unavailable
                }
            };
            (pinger.name(), state)
        });

        let dependencies: BTreeMap<_, _> = join_all(checks).await.into_iter().collect();
        let status = if dependencies
            .values()
            .all(|state| *state == DependencyState::Ok)
        {
            "ok"
        } else {
            "degraded"
        };

        HealthReport {
            status,
            dependencies,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct FixedPinger {
        name: &'static str,
        ok: bool,
        delay: Duration,
    }

    #[async_trait]
    impl Pinger for FixedPinger {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn ping(&self) -> Result<(), String> {
            tokio::time::sleep(self.delay).await;
            if self.ok {
                Ok(())
            } else {
                Err("down".to_string())
            }
        }
    }

    fn pinger(name: &'static str, ok: bool, delay: Duration) -> Box<dyn Pinger> {
        Box::new(FixedPinger { name, ok, delay })
    }

    #[tokio::test]
    async fn all_dependencies_ok() {
        let health = Health::new(vec![
            pinger("database", true, Duration::ZERO),
            pinger("redis", true, Duration::ZERO),
        ]);

        let report = health.check().await;
        assert_eq!(report.status, "ok");
        assert!(!report.degraded());
        assert_eq!(report.dependencies["database"], DependencyState::Ok);
        assert_eq!(report.dependencies["redis"], DependencyState::Ok);
    }

    #[tokio::test]
    async fn one_failure_degrades_the_report() {
        let health = Health::new(vec![
            pinger("database", true, Duration::ZERO),
            pinger("redis", false, Duration::ZERO),
        ]);

        let report = health.check().await;
        assert_eq!(report.status, "degraded");
        assert_eq!(report.dependencies["redis"], DependencyState::Unavailable);
        assert_eq!(report.dependencies["database"], DependencyState::Ok);
    }

    #[tokio::test]
    async fn slow_dependencies_hit_the_deadline() {
        let health = Health::new(vec![pinger(
            "database",
            true,
            Duration::from_millis(200),
        )])
        .with_deadline(Duration::from_millis(20));

        let report = health.check().await;
        assert_eq!(report.dependencies["database"], DependencyState::Unavailable);
    }

    #[tokio::test]
    async fn readiness_flag_flips() {
        let health = Health::new(vec![]);
        assert!(health.is_ready());
        health.set_ready(false);
        assert!(!health.is_ready());
    }
}
