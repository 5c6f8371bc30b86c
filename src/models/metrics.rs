use chrono::{DateTime, NaiveDate, Utc};

use crate::models::{Error, TenantId};

/// Daily per-tenant event counts, rolled up by the `metrics:aggregate`
/// task.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DailyMetric {
    pub team_id: TenantId,
    pub day: NaiveDate,
    pub event_type: String,
    pub count: i64,
}

#[derive(Clone)]
pub struct MetricsRepository {
    pool: sqlx::PgPool,
}

impl MetricsRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Fold email events since `since` into the daily rollup table.
    /// Re-running over an overlapping window is safe: counts are
    /// recomputed per (tenant, day, type), not incremented.
    pub async fn aggregate_since(&self, since: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO email_metrics (team_id, day, event_type, count)
            SELECT e.team_id, date(ev.created_at), ev.event_type, count(*)
            FROM email_events ev
                JOIN emails e ON e.id = ev.email_id
            WHERE ev.created_at >= date_trunc('day', $1::timestamptz)
            GROUP BY e.team_id, date(ev.created_at), ev.event_type
            ON CONFLICT (team_id, day, event_type)
                DO UPDATE SET count = EXCLUDED.count
            "#,
        )
        .bind(since)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn for_tenant(
        &self,
        tenant: TenantId,
        since: NaiveDate,
    ) -> Result<Vec<DailyMetric>, Error> {
        let metrics = sqlx::query_as::<_, DailyMetric>(
            r#"
            SELECT team_id, day, event_type, count
            FROM email_metrics
            WHERE team_id = $1 AND day >= $2
            ORDER BY day, event_type
            "#,
        )
        .bind(tenant)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(metrics)
    }
}
