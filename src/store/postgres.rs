use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    Connection, PgPool, Row,
};
use std::{collections::HashMap, time::Duration};
use tracing::{info_span, Instrument, Span};
use uuid::Uuid;
use webauthn_rs::prelude::Passkey;

use super::{
    models::{deserialize_passkey, serialize_passkey},
    AuthToken, ConfigKey, ConfigStore, CredentialStore, StoredCredential, TokenStore, User,
    UserStore, UserWithCredentials,
};

const SCHEMA: &str = include_str!("../../sql/schema.sql");

const USER_COLUMNS: &str = "id, username, display_name, status, role, created_at";
const CREDENTIAL_COLUMNS: &str =
    "id, user_id, passkey, sign_count, transports, created_at, last_used_at";

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and make sure the schema exists.
    ///
    /// # Errors
    /// Returns error if the database is unreachable or the schema cannot be applied.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn)
            .await
            .context("Failed to connect to database")?;

        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Apply `sql/schema.sql`.
    ///
    /// # Errors
    /// Returns error if any statement fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .instrument(db_span("MIGRATE"))
            .await
            .context("Failed to apply database schema")?;
        Ok(())
    }

    async fn credentials_for(&self, user_id: Uuid) -> Result<Vec<StoredCredential>> {
        let query = format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM user_credentials WHERE user_id = $1 ORDER BY created_at"
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT"))
            .await?;
        rows.iter().map(credential_from_row).collect()
    }

    async fn with_credentials(&self, row: Option<PgRow>) -> Result<Option<UserWithCredentials>> {
        let Some(row) = row else {
            return Ok(None);
        };
        let user = user_from_row(&row)?;
        let credentials = self.credentials_for(user.id).await?;
        Ok(Some(UserWithCredentials { user, credentials }))
    }
}

fn db_span(operation: &'static str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation
    )
}

fn user_from_row(row: &PgRow) -> Result<User> {
    let status: String = row.try_get("status")?;
    let role: String = row.try_get("role")?;
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        display_name: row.try_get("display_name")?,
        status: status.parse()?,
        role: role.parse()?,
        created_at: row.try_get("created_at")?,
    })
}

fn credential_from_row(row: &PgRow) -> Result<StoredCredential> {
    let passkey: Vec<u8> = row.try_get("passkey")?;
    let sign_count: i64 = row.try_get("sign_count")?;
    Ok(StoredCredential {
        credential_id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        passkey: deserialize_passkey(&passkey)?,
        sign_count: u32::try_from(sign_count)
            .map_err(|_| anyhow!("sign count out of range: {sign_count}"))?,
        transports: row.try_get("transports")?,
        created_at: row.try_get("created_at")?,
        last_used_at: row.try_get::<Option<DateTime<Utc>>, _>("last_used_at")?,
    })
}

#[async_trait]
impl UserStore for PgStore {
    async fn create_with_credential(
        &self,
        user: &User,
        credential: &StoredCredential,
    ) -> Result<()> {
        let passkey = serialize_passkey(&credential.passkey)?;
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query(
            "INSERT INTO users (id, username, display_name, status, role, created_at) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.display_name)
        .bind(user.status.as_str())
        .bind(user.role.as_str())
        .bind(user.created_at)
        .execute(&mut *tx)
        .instrument(db_span("INSERT"))
        .await
        .context("Failed to insert user")?;

        sqlx::query(
            "INSERT INTO user_credentials (id, user_id, passkey, sign_count, transports, created_at) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&credential.credential_id)
        .bind(credential.user_id)
        .bind(passkey)
        .bind(i64::from(credential.sign_count))
        .bind(&credential.transports)
        .bind(credential.created_at)
        .execute(&mut *tx)
        .instrument(db_span("INSERT"))
        .await
        .context("Failed to insert credential")?;

        tx.commit().await.context("Failed to commit transaction")?;
        Ok(())
    }

    async fn user_by_username_with_credentials(
        &self,
        username: &str,
    ) -> Result<Option<UserWithCredentials>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1");
        let row = sqlx::query(&query)
            .bind(username)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT"))
            .await?;
        self.with_credentials(row).await
    }

    async fn user_by_id_with_credentials(&self, id: Uuid) -> Result<Option<UserWithCredentials>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT"))
            .await?;
        self.with_credentials(row).await
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn credentials_by_user(&self, user_id: Uuid) -> Result<Vec<StoredCredential>> {
        self.credentials_for(user_id).await
    }

    async fn update_after_login(
        &self,
        credential_id: &[u8],
        sign_count: u32,
        passkey: &Passkey,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE user_credentials SET sign_count = $2, passkey = $3, last_used_at = NOW() WHERE id = $1",
        )
        .bind(credential_id)
        .bind(i64::from(sign_count))
        .bind(serialize_passkey(passkey)?)
        .execute(&self.pool)
        .instrument(db_span("UPDATE"))
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("credential not found"));
        }
        Ok(())
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn create_token(&self, token: &AuthToken) -> Result<()> {
        sqlx::query("INSERT INTO user_tokens (id, user_id, expires_at) VALUES ($1, $2, $3)")
            .bind(token.id)
            .bind(token.user_id)
            .bind(token.expires_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT"))
            .await
            .context("Failed to insert token")?;
        Ok(())
    }

    async fn token_with_user(&self, id: Uuid) -> Result<Option<(AuthToken, User)>> {
        let row = sqlx::query(
            "SELECT t.id AS token_id, t.expires_at, u.id, u.username, u.display_name, u.status, u.role, u.created_at \
             FROM user_tokens t JOIN users u ON u.id = t.user_id WHERE t.id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .instrument(db_span("SELECT"))
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let user = user_from_row(&row)?;
        let token = AuthToken {
            id: row.try_get("token_id")?,
            user_id: user.id,
            expires_at: row.try_get("expires_at")?,
        };
        Ok(Some((token, user)))
    }
}

#[async_trait]
impl ConfigStore for PgStore {
    async fn get_all(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT key, value FROM config")
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT"))
            .await?;
        rows.iter()
            .map(|row| -> Result<(String, String)> {
                Ok((row.try_get("key")?, row.try_get("value")?))
            })
            .collect()
    }

    async fn set(&self, key: ConfigKey, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO config (key, value) VALUES ($1, $2) ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key.as_str())
        .bind(value)
        .execute(&self.pool)
        .instrument(db_span("UPSERT"))
        .await
        .with_context(|| format!("Failed to set config key {}", key.as_str()))?;
        Ok(())
    }

    async fn increment_and_get(&self, key: ConfigKey) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO config (key, value) VALUES ($1, '1') \
             ON CONFLICT (key) DO UPDATE SET value = (COALESCE(NULLIF(config.value, ''), '0')::BIGINT + 1)::TEXT \
             RETURNING value",
        )
        .bind(key.as_str())
        .fetch_one(&self.pool)
        .instrument(db_span("UPSERT"))
        .await
        .with_context(|| format!("Failed to increment config key {}", key.as_str()))?;

        let value: String = row.try_get("value")?;
        value
            .parse()
            .with_context(|| format!("Non-numeric value for {}: {value}", key.as_str()))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .instrument(info_span!(
                "db.acquire",
                db.system = "postgresql",
                db.operation = "ACQUIRE"
            ))
            .await?;
        conn.ping()
            .instrument(info_span!(
                "db.ping",
                db.system = "postgresql",
                db.operation = "PING"
            ))
            .await?;
        Ok(())
    }
}
