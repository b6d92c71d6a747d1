//! In-process backend with the same semantics as the PostgreSQL store.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;
use webauthn_rs::prelude::Passkey;

use super::{
    AuthToken, ConfigKey, ConfigStore, CredentialStore, StoredCredential, TokenStore, User,
    UserStore, UserWithCredentials,
};

#[derive(Debug)]
pub struct MemoryStore {
    users: RwLock<HashMap<Uuid, User>>,
    credentials: RwLock<Vec<StoredCredential>>,
    tokens: RwLock<HashMap<Uuid, AuthToken>>,
    config: RwLock<HashMap<String, String>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        let config = ConfigKey::defaults()
            .into_iter()
            .map(|(key, value)| (key.as_str().to_string(), value.to_string()))
            .collect();

        Self {
            users: RwLock::new(HashMap::new()),
            credentials: RwLock::new(Vec::new()),
            tokens: RwLock::new(HashMap::new()),
            config: RwLock::new(config),
        }
    }

    /// Insert a user without credentials.
    ///
    /// # Errors
    /// Returns error if the username is taken.
    pub async fn insert_user(&self, user: User) -> Result<()> {
        let mut users = self.users.write().await;
        if users.values().any(|u| u.username == user.username) {
            return Err(anyhow!("username already exists: {}", user.username));
        }
        users.insert(user.id, user);
        Ok(())
    }

    async fn with_credentials(&self, user: Option<User>) -> Option<UserWithCredentials> {
        let user = user?;
        let credentials = self
            .credentials
            .read()
            .await
            .iter()
            .filter(|c| c.user_id == user.id)
            .cloned()
            .collect();
        Some(UserWithCredentials { user, credentials })
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create_with_credential(
        &self,
        user: &User,
        credential: &StoredCredential,
    ) -> Result<()> {
        // lock order: users, then credentials
        let mut users = self.users.write().await;
        let mut credentials = self.credentials.write().await;

        if users.values().any(|u| u.username == user.username) {
            return Err(anyhow!("username already exists: {}", user.username));
        }
        if credentials
            .iter()
            .any(|c| c.credential_id == credential.credential_id)
        {
            return Err(anyhow!("credential already registered"));
        }

        users.insert(user.id, user.clone());
        credentials.push(credential.clone());
        Ok(())
    }

    async fn user_by_username_with_credentials(
        &self,
        username: &str,
    ) -> Result<Option<UserWithCredentials>> {
        let user = self
            .users
            .read()
            .await
            .values()
            .find(|u| u.username == username)
            .cloned();
        Ok(self.with_credentials(user).await)
    }

    async fn user_by_id_with_credentials(&self, id: Uuid) -> Result<Option<UserWithCredentials>> {
        let user = self.users.read().await.get(&id).cloned();
        Ok(self.with_credentials(user).await)
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn credentials_by_user(&self, user_id: Uuid) -> Result<Vec<StoredCredential>> {
        Ok(self
            .credentials
            .read()
            .await
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn update_after_login(
        &self,
        credential_id: &[u8],
        sign_count: u32,
        passkey: &Passkey,
    ) -> Result<()> {
        let mut credentials = self.credentials.write().await;
        let credential = credentials
            .iter_mut()
            .find(|c| c.credential_id == credential_id)
            .ok_or_else(|| anyhow!("credential not found"))?;
        credential.sign_count = sign_count;
        credential.passkey = passkey.clone();
        credential.last_used_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn create_token(&self, token: &AuthToken) -> Result<()> {
        self.tokens.write().await.insert(token.id, token.clone());
        Ok(())
    }

    async fn token_with_user(&self, id: Uuid) -> Result<Option<(AuthToken, User)>> {
        let Some(token) = self.tokens.read().await.get(&id).cloned() else {
            return Ok(None);
        };
        let user = self.users.read().await.get(&token.user_id).cloned();
        Ok(user.map(|user| (token, user)))
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get_all(&self) -> Result<HashMap<String, String>> {
        Ok(self.config.read().await.clone())
    }

    async fn set(&self, key: ConfigKey, value: &str) -> Result<()> {
        self.config
            .write()
            .await
            .insert(key.as_str().to_string(), value.to_string());
        Ok(())
    }

    async fn increment_and_get(&self, key: ConfigKey) -> Result<i64> {
        let mut config = self.config.write().await;
        let entry = config.entry(key.as_str().to_string()).or_default();
        let current = if entry.is_empty() {
            0
        } else {
            entry.parse::<i64>()?
        };
        let next = current + 1;
        *entry = next.to_string();
        Ok(next)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
