use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Error, TenantId, text_enum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    HardBounce,
    Complaint,
    Manual,
}

text_enum!(SuppressionReason {
    HardBounce => "hard_bounce",
    Complaint => "complaint",
    Manual => "manual",
});

#[derive(Debug, Clone)]
pub struct SuppressionEntry {
    pub team_id: TenantId,
    pub email: String,
    pub reason: SuppressionReason,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct PgSuppression {
    team_id: TenantId,
    email: String,
    reason: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<PgSuppression> for SuppressionEntry {
    type Error = Error;

    fn try_from(pg: PgSuppression) -> Result<Self, Self::Error> {
        Ok(Self {
            team_id: pg.team_id,
            email: pg.email,
            reason: pg.reason.parse()?,
            created_at: pg.created_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SuppressionRepository {
    pool: sqlx::PgPool,
}

impl SuppressionRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Record a suppression. Addresses are lowercased on the way in;
    /// re-suppressing an address keeps the original entry.
    pub async fn insert(
        &self,
        tenant: TenantId,
        email: &str,
        reason: SuppressionReason,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO suppressions (team_id, email, reason)
            VALUES ($1, lower($2), $3)
            ON CONFLICT (team_id, email) DO NOTHING
            "#,
        )
        .bind(tenant)
        .bind(email)
        .bind(reason.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn remove(&self, tenant: TenantId, email: &str) -> Result<bool, Error> {
        let result = sqlx::query("DELETE FROM suppressions WHERE team_id = $1 AND email = lower($2)")
            .bind(tenant)
            .bind(email)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// The subset of `addresses` that is suppressed for this tenant.
    /// Comparison is on the lowercased address.
    pub async fn suppressed_among(
        &self,
        tenant: TenantId,
        addresses: &[String],
    ) -> Result<Vec<String>, Error> {
        let lowered: Vec<String> = addresses.iter().map(|a| a.to_lowercase()).collect();

        let found = sqlx::query_scalar::<_, String>(
            r#"
            SELECT email
            FROM suppressions
            WHERE team_id = $1 AND email = ANY($2)
            "#,
        )
        .bind(tenant)
        .bind(&lowered)
        .fetch_all(&self.pool)
        .await?;

        Ok(found)
    }

    pub async fn is_suppressed(&self, tenant: TenantId, address: &str) -> Result<bool, Error> {
        Ok(!self
            .suppressed_among(tenant, &[address.to_string()])
            .await?
            .is_empty())
    }

    pub async fn get(
        &self,
        tenant: TenantId,
        email: &str,
    ) -> Result<Option<SuppressionEntry>, Error> {
        sqlx::query_as::<_, PgSuppression>(
            r#"
            SELECT team_id, email, reason, created_at
            FROM suppressions
            WHERE team_id = $1 AND email = lower($2)
            "#,
        )
        .bind(tenant)
        .bind(email)
        .fetch_optional(&self.pool)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }
}
