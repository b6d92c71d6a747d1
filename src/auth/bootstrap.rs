//! One-time registration code that gates creation of the superadmin.
//!
//! Flow Overview:
//! 1) On start-up, if the instance is not ready, a fresh 6 digit code is
//!    generated, its Argon2id digest stored and the attempt counter reset.
//! 2) `validate` rejects wrong-length input without counting it, refuses
//!    outright once 3 attempts failed, and otherwise compares digests.
//! 3) After the superadmin ceremony completes the caller flips the instance
//!    to ready; the gate is not consulted again.

use argon2::{Algorithm, Argon2, Params, Version};
use base64ct::{Base64, Encoding};
use rand::{rngs::OsRng, Rng};
use secrecy::{ExposeSecret, SecretString};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::store::{ConfigKey, ConfigStore};

pub const CODE_LENGTH: usize = 6;
pub const MAX_ATTEMPTS: i64 = 3;

const ARGON2_TIME_COST: u32 = 1;
const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
const ARGON2_LANES: u32 = 4;
const ARGON2_OUTPUT_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("registration code must be 6 characters")]
    InvalidCode,
    #[error("registration code does not match")]
    CodeMismatch,
    #[error("too many failed registration attempts")]
    TooManyAttempts,
    #[error("no registration code has been issued")]
    NoCodeIssued,
    #[error("failed to hash registration code: {0}")]
    Hash(String),
    #[error("bootstrap store failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// Argon2id with fixed parameters, salted with the server secret.
#[derive(Clone)]
pub struct CodeHasher {
    salt: SecretString,
}

impl CodeHasher {
    #[must_use]
    pub fn new(salt: SecretString) -> Self {
        Self { salt }
    }

    /// # Errors
    /// Returns `BootstrapError::Hash` if Argon2 rejects the parameters or salt.
    pub fn hash(&self, code: &str) -> Result<Vec<u8>, BootstrapError> {
        let params = Params::new(
            ARGON2_MEMORY_KIB,
            ARGON2_TIME_COST,
            ARGON2_LANES,
            Some(ARGON2_OUTPUT_LEN),
        )
        .map_err(|e| BootstrapError::Hash(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut digest = vec![0u8; ARGON2_OUTPUT_LEN];
        argon2
            .hash_password_into(
                code.as_bytes(),
                self.salt.expose_secret().as_bytes(),
                &mut digest,
            )
            .map_err(|e| BootstrapError::Hash(e.to_string()))?;
        Ok(digest)
    }

    async fn hash_blocking(&self, code: &str) -> Result<Vec<u8>, BootstrapError> {
        let hasher = self.clone();
        let code = code.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&code))
            .await
            .map_err(|e| BootstrapError::Hash(e.to_string()))?
    }
}

pub struct BootstrapGate {
    store: Arc<dyn ConfigStore>,
    hasher: CodeHasher,
    ready: AtomicBool,
}

impl BootstrapGate {
    #[must_use]
    pub fn new(store: Arc<dyn ConfigStore>, secret: SecretString) -> Self {
        Self {
            store,
            hasher: CodeHasher::new(secret),
            ready: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Issue a new code unless the instance is already initialized.
    ///
    /// Returns the plaintext code exactly once; it is not stored anywhere.
    ///
    /// # Errors
    /// Returns error if the config store or hashing fails.
    pub async fn initialize_if_needed(&self) -> Result<Option<SecretString>, BootstrapError> {
        let config = self.store.get_all().await?;
        if config_value(&config, ConfigKey::InstanceReady) == "true" {
            self.ready.store(true, Ordering::Release);
            return Ok(None);
        }

        let code = generate_code();
        self.issue_code(&code).await?;
        info!("issued a new registration code");
        Ok(Some(SecretString::from(code)))
    }

    pub(crate) async fn issue_code(&self, code: &str) -> Result<(), BootstrapError> {
        let digest = self.hasher.hash_blocking(code).await?;
        self.store
            .set(ConfigKey::InitCodeHash, &Base64::encode_string(&digest))
            .await?;
        self.store.set(ConfigKey::InitAttempts, "0").await?;
        self.ready.store(false, Ordering::Release);
        Ok(())
    }

    /// Check a presented registration code.
    ///
    /// # Errors
    /// * `InvalidCode` - wrong length, the attempt is not counted
    /// * `TooManyAttempts` - the counter reached `MAX_ATTEMPTS`, no hashing is done
    /// * `CodeMismatch` - wrong code, the counter was incremented
    /// * `Store` - the counter could not be persisted
    pub async fn validate(&self, presented: &str) -> Result<(), BootstrapError> {
        if presented.chars().count() != CODE_LENGTH {
            return Err(BootstrapError::InvalidCode);
        }

        let config = self.store.get_all().await?;
        let attempts = parse_attempts(config_value(&config, ConfigKey::InitAttempts));
        if attempts >= MAX_ATTEMPTS {
            warn!(attempts, "registration code locked");
            return Err(BootstrapError::TooManyAttempts);
        }

        let expected = Base64::decode_vec(config_value(&config, ConfigKey::InitCodeHash))
            .ok()
            .filter(|digest| !digest.is_empty())
            .ok_or(BootstrapError::NoCodeIssued)?;

        let digest = self.hasher.hash_blocking(presented).await?;
        if bool::from(digest.as_slice().ct_eq(expected.as_slice())) {
            info!("registration code accepted");
            return Ok(());
        }

        match self.store.increment_and_get(ConfigKey::InitAttempts).await {
            Ok(attempts) => {
                warn!(attempts, "registration code mismatch");
                if attempts >= MAX_ATTEMPTS {
                    Err(BootstrapError::TooManyAttempts)
                } else {
                    Err(BootstrapError::CodeMismatch)
                }
            }
            Err(err) => {
                error!(
                    "failed to persist registration attempt counter, retries are not being limited: {err:#}"
                );
                Err(BootstrapError::Store(err))
            }
        }
    }

    /// Flip the instance to ready.
    ///
    /// # Errors
    /// Returns error if the flag cannot be persisted.
    pub async fn mark_ready(&self) -> Result<(), BootstrapError> {
        self.store.set(ConfigKey::InstanceReady, "true").await?;
        self.ready.store(true, Ordering::Release);
        info!("instance is ready");
        Ok(())
    }
}

fn config_value(config: &HashMap<String, String>, key: ConfigKey) -> &str {
    config.get(key.as_str()).map_or("", String::as_str)
}

// unreadable counters count as locked
fn parse_attempts(raw: &str) -> i64 {
    if raw.is_empty() {
        return 0;
    }
    raw.parse().unwrap_or(MAX_ATTEMPTS)
}

fn generate_code() -> String {
    let mut rng = OsRng;
    (0..CODE_LENGTH)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}
