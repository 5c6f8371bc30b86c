use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dkim::{self, KeyVault, SigningKey};
use crate::dns::DomainVerification;
use crate::models::{Error, TenantId, text_enum};

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref,
    sqlx::Type, FromStr,
)]
#[sqlx(transparent)]
pub struct DomainId(Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStatus {
    Pending,
    Verifying,
    Verified,
    Failed,
}

text_enum!(DomainStatus {
    Pending => "pending",
    Verifying => "verifying",
    Verified => "verified",
    Failed => "failed",
});

/// STARTTLS posture for deliveries from this domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TlsPolicy {
    #[default]
    Opportunistic,
    Enforce,
}

text_enum!(TlsPolicy {
    Opportunistic => "opportunistic",
    Enforce => "enforce",
});

#[derive(Debug)]
pub struct Domain {
    pub id: DomainId,
    pub team_id: TenantId,
    pub name: String,
    pub status: DomainStatus,
    pub dkim_selector: String,
    /// AEAD-sealed PKCS#8 DER, base64. Only opened right before signing.
    sealed_dkim_key: String,
    pub dkim_public_key: Vec<u8>,
    pub open_tracking: bool,
    pub click_tracking: bool,
    pub tls_policy: TlsPolicy,
    pub created_at: DateTime<Utc>,
}

impl Domain {
    /// Decrypt the stored private key and produce a signer for this
    /// domain's selector.
    pub fn signing_key(&self, vault: &KeyVault) -> Result<SigningKey, Error> {
        let der = vault.open(&self.sealed_dkim_key)?;
        Ok(SigningKey::from_pkcs8_der(&self.name, &self.dkim_selector, &der)?)
    }

    /// The TXT record the owner publishes at
    /// `{selector}._domainkey.{name}`.
    pub fn dkim_record(&self) -> String {
        use base64ct::{Base64, Encoding};
        format!("v=DKIM1; k=rsa; p={}", Base64::encode_string(&self.dkim_public_key))
    }
}

#[derive(sqlx::FromRow)]
struct PgDomain {
    id: DomainId,
    team_id: TenantId,
    name: String,
    status: String,
    dkim_selector: String,
    dkim_private_key: String,
    dkim_public_key: Vec<u8>,
    open_tracking: bool,
    click_tracking: bool,
    tls_policy: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<PgDomain> for Domain {
    type Error = Error;

    fn try_from(pg: PgDomain) -> Result<Self, Self::Error> {
        Ok(Self {
            id: pg.id,
            team_id: pg.team_id,
            name: pg.name,
            status: pg.status.parse()?,
            dkim_selector: pg.dkim_selector,
            sealed_dkim_key: pg.dkim_private_key,
            dkim_public_key: pg.dkim_public_key,
            open_tracking: pg.open_tracking,
            click_tracking: pg.click_tracking,
            tls_policy: pg.tls_policy.parse()?,
            created_at: pg.created_at,
        })
    }
}

const DOMAIN_COLUMNS: &str = r#"
    id, team_id, name, status, dkim_selector, dkim_private_key,
    dkim_public_key, open_tracking, click_tracking, tls_policy, created_at
"#;

#[derive(Clone)]
pub struct DomainRepository {
    pool: sqlx::PgPool,
}

impl DomainRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Register a domain and generate its DKIM key pair. The private key
    /// never touches the database in the clear.
    pub async fn create(
        &self,
        tenant: TenantId,
        name: &str,
        selector: &str,
        key_bits: u32,
        vault: &KeyVault,
    ) -> Result<Domain, Error> {
        let der = dkim::generate_key(key_bits)?;
        let public = dkim::public_key_der(&der)?;
        let sealed = vault.seal(&der)?;

        sqlx::query_as::<_, PgDomain>(&format!(
            r#"
            INSERT INTO domains (team_id, name, dkim_selector, dkim_private_key, dkim_public_key)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {DOMAIN_COLUMNS}
            "#
        ))
        .bind(tenant)
        .bind(name)
        .bind(selector)
        .bind(sealed)
        .bind(public)
        .fetch_one(&self.pool)
        .await?
        .try_into()
    }

    pub async fn get(&self, id: DomainId) -> Result<Domain, Error> {
        sqlx::query_as::<_, PgDomain>(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await?
        .try_into()
    }

    /// The tenant's domain matching a sender address domain, either
    /// exactly or as a parent of the given subdomain.
    pub async fn find_for_sender(
        &self,
        tenant: TenantId,
        sender_domain: &str,
    ) -> Result<Option<Domain>, Error> {
        sqlx::query_as::<_, PgDomain>(&format!(
            r#"
            SELECT {DOMAIN_COLUMNS}
            FROM domains
            WHERE team_id = $1
              AND ($2 = name OR $2 LIKE '%.' || name)
            ORDER BY length(name) DESC
            LIMIT 1
            "#
        ))
        .bind(tenant)
        .bind(sender_domain)
        .fetch_optional(&self.pool)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }

    pub async fn update_status(&self, id: DomainId, status: DomainStatus) -> Result<(), Error> {
        sqlx::query("UPDATE domains SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn save_verification(
        &self,
        id: DomainId,
        status: DomainStatus,
        verification: &DomainVerification,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE domains
            SET status = $2, verification = $3, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(serde_json::to_value(verification)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
