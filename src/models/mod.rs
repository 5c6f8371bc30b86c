use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod broadcast;
mod domain;
mod email;
mod inbound;
mod metrics;
mod suppression;
mod webhook;

pub use broadcast::*;
pub use domain::*;
pub use email::*;
pub use inbound::*;
pub use metrics::*;
pub use suppression::*;
pub use webhook::*;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Database(sqlx::Error),
    #[error("foreign key violation")]
    ForeignKeyViolation,
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Email(#[from] email_address::Error),
    #[error(transparent)]
    Dkim(#[from] crate::dkim::DkimError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
    #[error("{0}")]
    NotFound(&'static str),
    #[error("conflict")]
    Conflict,
}

impl From<sqlx::Error> for Error {
    fn from(sql: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &sql {
            if db_err.is_unique_violation() {
                return Error::Conflict;
            }
            if db_err.is_foreign_key_violation() {
                return Error::ForeignKeyViolation;
            }
        }
        if matches!(sql, sqlx::Error::RowNotFound) {
            return Error::NotFound("not found");
        }
        Error::Database(sql)
    }
}

/// The ownership boundary for every user-visible entity. All queries
/// scope by this id.
#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref,
    sqlx::Type, FromStr,
)]
#[sqlx(transparent)]
pub struct TenantId(Uuid);

impl TenantId {
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self(Uuid::nil())
    }
}

/// Closed string-backed enums stored as `text` columns. The wire and
/// database representation is the snake_case name on the right.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::models::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(crate::models::Error::Internal(format!(
                        "unknown {} value: {other}",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

pub(crate) use text_enum;

/// Per-tenant suppression policy, loaded alongside the tenant row.
#[derive(Debug, Clone, Copy, sqlx::FromRow)]
pub struct SuppressionPolicy {
    pub suppress_on_hard_bounce: bool,
    pub suppress_on_complaint: bool,
}

#[derive(Clone)]
pub struct TeamRepository {
    pool: sqlx::PgPool,
}

impl TeamRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn suppression_policy(&self, tenant: TenantId) -> Result<SuppressionPolicy, Error> {
        let policy = sqlx::query_as::<_, SuppressionPolicy>(
            r#"
            SELECT suppress_on_hard_bounce, suppress_on_complaint
            FROM teams
            WHERE id = $1
            "#,
        )
        .bind(tenant)
        .fetch_one(&self.pool)
        .await?;

        Ok(policy)
    }
}
