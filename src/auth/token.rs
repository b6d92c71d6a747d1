//! Server-side auth tokens with a fixed lifetime.
//!
//! A token is valid strictly before `expires_at`. There is no sliding expiry
//! and no revocation; expired rows are simply never honoured.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::store::{AuthToken, TokenStore, User};

pub const DEFAULT_TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("auth token not found")]
    NotFound,
    #[error("auth token expired")]
    Expired,
    #[error("token store failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

pub struct AuthTokenService {
    store: Arc<dyn TokenStore>,
    ttl: Duration,
}

impl AuthTokenService {
    #[must_use]
    pub fn new(store: Arc<dyn TokenStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue and persist a token for `user_id`.
    ///
    /// # Errors
    /// Returns `TokenError::Store` if the token cannot be persisted.
    pub async fn issue(&self, user_id: Uuid) -> Result<AuthToken, TokenError> {
        self.issue_at(user_id, Utc::now()).await
    }

    pub(crate) async fn issue_at(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<AuthToken, TokenError> {
        let token = AuthToken {
            id: Uuid::new_v4(),
            user_id,
            expires_at: now + self.ttl,
        };
        self.store.create_token(&token).await?;
        debug!(%user_id, expires_at = %token.expires_at, "issued auth token");
        Ok(token)
    }

    /// Resolve the user owning a live token.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown ids, `Expired` once `now >= expires_at`.
    pub async fn validate_and_resolve_user(&self, token_id: Uuid) -> Result<User, TokenError> {
        self.validate_at(token_id, Utc::now()).await
    }

    pub(crate) async fn validate_at(
        &self,
        token_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<User, TokenError> {
        let (token, user) = self
            .store
            .token_with_user(token_id)
            .await?
            .ok_or(TokenError::NotFound)?;

        if !token.is_valid_at(now) {
            return Err(TokenError::Expired);
        }
        Ok(user)
    }
}

/// Parse the `auth_token` cookie value.
#[must_use]
pub fn parse_token_id(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw.trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, UserRole, UserStatus};

    async fn service_with_user() -> (AuthTokenService, User) {
        let store = Arc::new(MemoryStore::new());
        let user = User::new("carol", "Carol", UserStatus::Active, UserRole::Admin);
        store.insert_user(user.clone()).await.expect("insert user");
        (
            AuthTokenService::new(store, Duration::seconds(DEFAULT_TOKEN_TTL_SECONDS)),
            user,
        )
    }

    #[tokio::test]
    async fn valid_for_full_day_only() -> Result<(), TokenError> {
        let (service, user) = service_with_user().await;
        let issued_at = Utc::now();
        let token = service.issue_at(user.id, issued_at).await?;
        assert_eq!(token.expires_at, issued_at + Duration::hours(24));

        let almost = issued_at + Duration::hours(23) + Duration::minutes(59);
        assert_eq!(service.validate_at(token.id, almost).await?, user);

        let after = issued_at + Duration::hours(24) + Duration::seconds(1);
        assert!(matches!(
            service.validate_at(token.id, after).await,
            Err(TokenError::Expired)
        ));

        let exact = issued_at + Duration::hours(24);
        assert!(matches!(
            service.validate_at(token.id, exact).await,
            Err(TokenError::Expired)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let (service, _) = service_with_user().await;
        assert!(matches!(
            service.validate_and_resolve_user(Uuid::new_v4()).await,
            Err(TokenError::NotFound)
        ));
    }

    #[tokio::test]
    async fn issued_tokens_are_distinct() -> Result<(), TokenError> {
        let (service, user) = service_with_user().await;
        let first = service.issue(user.id).await?;
        let second = service.issue(user.id).await?;
        assert_ne!(first.id, second.id);
        assert_eq!(service.validate_and_resolve_user(first.id).await?.id, user.id);
        Ok(())
    }

    #[test]
    fn parse_token_id_rejects_garbage() {
        assert!(parse_token_id("not-a-uuid").is_none());
        assert!(parse_token_id("").is_none());
        let id = Uuid::new_v4();
        assert_eq!(parse_token_id(&id.to_string()), Some(id));
    }
}
