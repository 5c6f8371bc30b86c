use chrono::{Duration, Utc};
use tracing::{info, instrument};

use crate::handler::{Handlers, repo_error};
use crate::queue::{CleanupPayload, HandlerError, MetricsAggregatePayload, Task};

impl Handlers {
    /// Roll recent email events up into the per-tenant daily counters.
    /// The rollup recomputes whole (tenant, day, type) cells, so an
    /// overlapping window is idempotent.
    #[instrument(skip(self, task))]
    pub(super) async fn handle_metrics(&self, task: &Task) -> Result<(), HandlerError> {
        let payload: MetricsAggregatePayload = Self::payload(task)?;

        let since = Utc::now() - Duration::hours(payload.window_hours.max(1) as i64);
        let rows = self
            .metrics
            .aggregate_since(since)
            .await
            .map_err(repo_error)?;

        info!(rows, window_hours = payload.window_hours, "metrics aggregated");
        Ok(())
    }

    /// Prune settled webhook events and old email events past the
    /// retention horizon.
    #[instrument(skip(self, task))]
    pub(super) async fn handle_cleanup(&self, task: &Task) -> Result<(), HandlerError> {
        let payload: CleanupPayload = Self::payload(task)?;

        let cutoff = Utc::now() - Duration::days(payload.retention_days.max(1) as i64);

        let webhook_events = self
            .webhook_events
            .prune_older_than(cutoff)
            .await
            .map_err(repo_error)?;
        let email_events = self
            .events
            .prune_older_than(cutoff)
            .await
            .map_err(repo_error)?;

        info!(
            webhook_events,
            email_events,
            retention_days = payload.retention_days,
            "cleanup complete"
        );
        Ok(())
    }
}
