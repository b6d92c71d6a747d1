//! Server configuration and the shared state handed to handlers.

use anyhow::{anyhow, Result};
use chrono::Duration as TokenTtl;
use secrecy::SecretString;
use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use crate::{
    auth::{
        ceremony::DEFAULT_CHALLENGE_TTL_SECONDS, token::DEFAULT_TOKEN_TTL_SECONDS,
        AuthTokenService, BootstrapGate, CeremonyConfig, CsrfProtocol, PasskeyCeremonies,
        TokenSigner,
    },
    store::{ConfigStore, CredentialStore, Store, UserStore},
};

const DEFAULT_RP_ID: &str = "localhost";
const DEFAULT_RP_NAME: &str = "custos";
const DEFAULT_RP_ORIGIN: &str = "http://localhost:8080";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Environment {
    #[default]
    Dev,
    Prod,
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Dev),
            "prod" | "production" => Ok(Self::Prod),
            other => Err(anyhow!("unknown environment: {other}, expected dev or prod")),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dev => "dev",
            Self::Prod => "prod",
        })
    }
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    secret: SecretString,
    environment: Environment,
    rp_id: String,
    rp_name: String,
    rp_origin: String,
    challenge_ttl_seconds: u64,
    token_ttl_seconds: i64,
}

impl AuthConfig {
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self {
            secret,
            environment: Environment::Dev,
            rp_id: DEFAULT_RP_ID.to_string(),
            rp_name: DEFAULT_RP_NAME.to_string(),
            rp_origin: DEFAULT_RP_ORIGIN.to_string(),
            challenge_ttl_seconds: DEFAULT_CHALLENGE_TTL_SECONDS,
            token_ttl_seconds: DEFAULT_TOKEN_TTL_SECONDS,
        }
    }

    #[must_use]
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    #[must_use]
    pub fn with_rp_id(mut self, rp_id: String) -> Self {
        self.rp_id = rp_id;
        self
    }

    #[must_use]
    pub fn with_rp_name(mut self, rp_name: String) -> Self {
        self.rp_name = rp_name;
        self
    }

    #[must_use]
    pub fn with_rp_origin(mut self, rp_origin: String) -> Self {
        // no trailing slash, it must compare equal to the Origin header
        self.rp_origin = rp_origin.trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn with_challenge_ttl_seconds(mut self, seconds: u64) -> Self {
        self.challenge_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    #[must_use]
    pub fn environment(&self) -> Environment {
        self.environment
    }

    #[must_use]
    pub fn rp_id(&self) -> &str {
        &self.rp_id
    }

    #[must_use]
    pub fn rp_name(&self) -> &str {
        &self.rp_name
    }

    #[must_use]
    pub fn rp_origin(&self) -> &str {
        &self.rp_origin
    }

    #[must_use]
    pub fn challenge_ttl_seconds(&self) -> u64 {
        self.challenge_ttl_seconds
    }

    #[must_use]
    pub fn token_ttl_seconds(&self) -> i64 {
        self.token_ttl_seconds
    }

    /// Cookies carry `Secure` only in production.
    #[must_use]
    pub fn cookie_secure(&self) -> bool {
        self.environment == Environment::Prod
    }
}

pub struct AuthState {
    config: AuthConfig,
    ceremonies: PasskeyCeremonies,
    tokens: AuthTokenService,
    csrf: CsrfProtocol,
    bootstrap: BootstrapGate,
    users: Arc<dyn UserStore>,
    credentials: Arc<dyn CredentialStore>,
    config_store: Arc<dyn ConfigStore>,
}

impl AuthState {
    /// Wire the auth components over `store`.
    ///
    /// # Errors
    /// Returns error if the secret is too short or the `WebAuthn` settings are invalid.
    pub fn new<S: Store + 'static>(config: AuthConfig, store: Arc<S>) -> Result<Self> {
        if config.token_ttl_seconds() <= 0 {
            return Err(anyhow!("token TTL must be positive"));
        }
        if config.challenge_ttl_seconds() == 0 {
            return Err(anyhow!("challenge TTL must be positive"));
        }

        let signer = TokenSigner::new(config.secret())?;
        let ceremonies = PasskeyCeremonies::new(CeremonyConfig::new(
            config.rp_id().to_string(),
            config.rp_name().to_string(),
            config.rp_origin(),
            Duration::from_secs(config.challenge_ttl_seconds()),
        )?)?;
        let tokens =
            AuthTokenService::new(store.clone(), TokenTtl::seconds(config.token_ttl_seconds()));
        let bootstrap = BootstrapGate::new(store.clone(), config.secret().clone());

        Ok(Self {
            ceremonies,
            tokens,
            csrf: CsrfProtocol::new(signer),
            bootstrap,
            users: store.clone(),
            credentials: store.clone(),
            config_store: store,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn ceremonies(&self) -> &PasskeyCeremonies {
        &self.ceremonies
    }

    #[must_use]
    pub fn tokens(&self) -> &AuthTokenService {
        &self.tokens
    }

    #[must_use]
    pub fn csrf(&self) -> &CsrfProtocol {
        &self.csrf
    }

    #[must_use]
    pub fn bootstrap(&self) -> &BootstrapGate {
        &self.bootstrap
    }

    #[must_use]
    pub fn users(&self) -> &dyn UserStore {
        self.users.as_ref()
    }

    #[must_use]
    pub fn credentials(&self) -> &dyn CredentialStore {
        self.credentials.as_ref()
    }

    #[must_use]
    pub fn config_store(&self) -> &dyn ConfigStore {
        self.config_store.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn secret() -> SecretString {
        SecretString::from("state-test-secret-0123456789".to_string())
    }

    #[test]
    fn defaults() {
        let config = AuthConfig::new(secret());
        assert_eq!(config.environment(), Environment::Dev);
        assert_eq!(config.rp_id(), "localhost");
        assert_eq!(config.challenge_ttl_seconds(), 60);
        assert_eq!(config.token_ttl_seconds(), 86_400);
        assert!(!config.cookie_secure());
    }

    #[test]
    fn prod_sets_secure_cookies() {
        let config = AuthConfig::new(secret()).with_environment(Environment::Prod);
        assert!(config.cookie_secure());
    }

    #[test]
    fn origin_trailing_slash_is_trimmed() {
        let config = AuthConfig::new(secret()).with_rp_origin("https://id.example.com/".to_string());
        assert_eq!(config.rp_origin(), "https://id.example.com");
    }

    #[test]
    fn environment_parsing() {
        assert_eq!("prod".parse::<Environment>().ok(), Some(Environment::Prod));
        assert_eq!("Development".parse::<Environment>().ok(), Some(Environment::Dev));
        assert!("staging".parse::<Environment>().is_err());
    }

    #[test]
    fn state_rejects_short_secret() {
        let config = AuthConfig::new(SecretString::from("short".to_string()));
        assert!(AuthState::new(config, Arc::new(MemoryStore::new())).is_err());
    }

    #[test]
    fn state_rejects_zero_ttls() {
        let config = AuthConfig::new(secret()).with_token_ttl_seconds(0);
        assert!(AuthState::new(config, Arc::new(MemoryStore::new())).is_err());

        let config = AuthConfig::new(secret()).with_challenge_ttl_seconds(0);
        assert!(AuthState::new(config, Arc::new(MemoryStore::new())).is_err());
    }
}
