use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod bounce;
pub mod config;
pub mod delivery;
pub mod dkim;
pub mod dns;
pub mod handler;
pub mod health;
pub mod limiter;
pub mod message;
pub mod models;
pub mod queue;
pub mod storage;
pub mod webhook;

pub use config::Settings;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub fn init_tracing(logging: &config::LoggingSettings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "{}={},tower_http=debug,info",
            env!("CARGO_CRATE_NAME"),
            logging.level
        )
        .into()
    });

    match logging.format {
        config::LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        config::LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

/// Run a fallible task on a fixed period until cancelled.
pub fn run_periodically<F, E, Fut>(task: F, period: std::time::Duration, cancel: CancellationToken)
where
    F: Fn() -> Fut + Send + 'static,
    E: std::error::Error,
    Fut: Future<Output = Result<(), E>> + Send,
{
    tokio::spawn(async move {
        loop {
            tokio::select!(
                _ = cancel.cancelled() => {
                    tracing::info!("periodic task cancelled");
                    return;
                },
                _ = tokio::time::sleep(period) => {
                    if let Err(err) = task().await {
                        tracing::error!("periodic task failed: {err}");
                    }
                }
            )
        }
    });
}

pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(not(test))]
mod serve {
    use super::*;
    use crate::delivery::{Sender, SenderConfig};
    use crate::dkim::KeyVault;
    use crate::dns::DnsResolver;
    use crate::handler::{HandlerSettings, Handlers};
    use crate::health::{DbPinger, Health, RedisPinger};
    use crate::queue::{
        Backoff, CleanupPayload, Enqueuer, MetricsAggregatePayload, Queue, Task, TaskType, Worker,
        worker::queue_rotation,
    };
    use crate::webhook::{WebhookDeliverer, WebhookDispatcher};
    use anyhow::Context;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;
    use std::time::Duration;
    use tracing::info;

    /// How long pruned event rows are kept around.
    const RETENTION_DAYS: u32 = 30;

    pub async fn connect_pool(settings: &Settings) -> anyhow::Result<sqlx::PgPool> {
        PgPoolOptions::new()
            .max_connections(settings.database.max_connections)
            .connect(&settings.database.url())
            .await
            .context("failed to connect to database")
    }

    /// Bring the whole platform up and block until shutdown completes.
    pub async fn run(settings: Settings, shutdown: CancellationToken) -> anyhow::Result<()> {
        let pool = connect_pool(&settings).await?;

        let redis_client =
            redis::Client::open(settings.redis.url.as_str()).context("invalid redis url")?;
        let redis = redis::aio::ConnectionManager::new(redis_client)
            .await
            .context("failed to connect to redis")?;

        let queue = Queue::from_connection(redis.clone());
        let enqueuer: Arc<dyn Enqueuer> = Arc::new(queue.clone());

        let vault = Arc::new(
            KeyVault::from_hex(&settings.dkim.master_key).context("invalid dkim.master_key")?,
        );

        let resolver = DnsResolver::new(
            settings.dns.nameserver.as_deref(),
            Duration::from_secs(settings.dns.timeout_secs),
            Duration::from_secs(settings.dns.cache_ttl_secs),
        )
        .context("failed to build dns resolver")?;

        let sender = Sender::new(SenderConfig::from_settings(&settings.smtp), resolver.clone());

        let dispatcher = WebhookDispatcher::new(
            pool.clone(),
            enqueuer.clone(),
            settings.webhook.max_retries,
        );
        let deliverer = WebhookDeliverer::new(
            pool.clone(),
            settings.webhook.timeout(),
            Backoff::new(settings.webhook.retry_delays()),
            settings.webhook.max_retries,
        );

        let storage =
            crate::storage::from_settings(&settings.storage).context("storage setup failed")?;

        let handlers = Handlers::new(
            pool.clone(),
            sender,
            resolver,
            vault,
            dispatcher,
            deliverer,
            enqueuer.clone(),
            storage,
            HandlerSettings::from_settings(&settings),
            shutdown.clone(),
        );

        let worker = Worker::new(
            queue.clone(),
            Arc::new(handlers),
            Backoff::new(settings.workers.retry_delays()),
            queue_rotation(
                settings.workers.critical_weight,
                settings.workers.default_weight,
                settings.workers.low_weight,
            ),
            settings.workers.concurrency,
            shutdown.clone(),
        );
        let worker_handle = worker.spawn();

        let health = Health::new(vec![
            Box::new(DbPinger::new(pool.clone())),
            Box::new(RedisPinger::new(redis)),
        ]);

        let socket = settings
            .server
            .address
            .parse()
            .with_context(|| format!("invalid server address {}", settings.server.address))?;
        api::ApiServer::new(
            socket,
            health.clone(),
            Duration::from_secs(settings.server.request_timeout_secs),
            shutdown.clone(),
        )
        .spawn();

        spawn_maintenance_schedule(
            enqueuer,
            settings.workers.max_retries,
            shutdown.clone(),
        );

        shutdown_signal(shutdown.clone()).await;
        info!("received shutdown signal, stopping services");
        health.set_ready(false);
        shutdown.cancel();

        // let the worker drain what it already picked up
        let drain = Duration::from_secs(settings.server.shutdown_timeout_secs);
        if tokio::time::timeout(drain, worker_handle).await.is_err() {
            tracing::warn!("worker did not drain within {}s", drain.as_secs());
        }

        Ok(())
    }

    /// Recurring rollup and pruning, enqueued like any other work.
    fn spawn_maintenance_schedule(
        enqueuer: Arc<dyn Enqueuer>,
        max_retries: u32,
        shutdown: CancellationToken,
    ) {
        let metrics_enqueuer = enqueuer.clone();
        run_periodically(
            move || {
                let enqueuer = metrics_enqueuer.clone();
                async move {
                    let task = Task::new(
                        TaskType::MetricsAggregate,
                        &MetricsAggregatePayload { window_hours: 25 },
                        max_retries,
                    )?;
                    enqueuer.enqueue(task).await
                }
            },
            Duration::from_secs(60 * 60),
            shutdown.clone(),
        );

        run_periodically(
            move || {
                let enqueuer = enqueuer.clone();
                async move {
                    let task = Task::new(
                        TaskType::Cleanup,
                        &CleanupPayload {
                            retention_days: RETENTION_DAYS,
                        },
                        max_retries,
                    )?;
                    enqueuer.enqueue(task).await
                }
            },
            Duration::from_secs(24 * 60 * 60),
            shutdown,
        );
    }
}

#[cfg(not(test))]
pub use serve::{connect_pool, run};
