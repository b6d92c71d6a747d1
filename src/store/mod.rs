//! Persistence collaborators.
//!
//! The auth core only talks to these traits. `postgres` is the production
//! backend; `memory` keeps everything in process and backs tests and
//! DSN-less development runs.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;
use webauthn_rs::prelude::Passkey;

pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::MemoryStore;
pub use models::{
    AuthToken, ConfigKey, StoredCredential, User, UserRole, UserStatus, UserWithCredentials,
};
pub use postgres::PgStore;

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Create the user and its first credential in one transaction.
    async fn create_with_credential(&self, user: &User, credential: &StoredCredential)
        -> Result<()>;

    async fn user_by_username_with_credentials(
        &self,
        username: &str,
    ) -> Result<Option<UserWithCredentials>>;

    async fn user_by_id_with_credentials(&self, id: Uuid) -> Result<Option<UserWithCredentials>>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn credentials_by_user(&self, user_id: Uuid) -> Result<Vec<StoredCredential>>;

    /// Persist the sign counter and refreshed passkey after a login.
    async fn update_after_login(
        &self,
        credential_id: &[u8],
        sign_count: u32,
        passkey: &Passkey,
    ) -> Result<()>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn create_token(&self, token: &AuthToken) -> Result<()>;

    async fn token_with_user(&self, id: Uuid) -> Result<Option<(AuthToken, User)>>;
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_all(&self) -> Result<HashMap<String, String>>;

    async fn set(&self, key: ConfigKey, value: &str) -> Result<()>;

    /// Atomically add one to a numeric key and return the new value.
    async fn increment_and_get(&self, key: ConfigKey) -> Result<i64>;

    async fn ping(&self) -> Result<()>;
}

/// Everything the HTTP layer needs from a backend.
pub trait Store: UserStore + CredentialStore + TokenStore + ConfigStore {}

impl<T: UserStore + CredentialStore + TokenStore + ConfigStore> Store for T {}
