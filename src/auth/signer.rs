//! HMAC-SHA256 signatures over opaque strings, keyed by the server secret.

use base64ct::{Base64Url, Encoding};
use ring::hmac;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use thiserror::Error;

/// Shortest server secret accepted for signing and salting.
pub const MIN_SECRET_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignerError {
    #[error("server secret must be at least 16 bytes")]
    SecretTooShort,
}

#[derive(Clone)]
pub struct TokenSigner {
    key: hmac::Key,
}

impl TokenSigner {
    /// Build a signer from the server-wide secret.
    ///
    /// # Errors
    /// Returns `SignerError::SecretTooShort` if the secret is under `MIN_SECRET_LEN` bytes.
    pub fn new(secret: &SecretString) -> Result<Self, SignerError> {
        let secret = secret.expose_secret().as_bytes();
        if secret.len() < MIN_SECRET_LEN {
            return Err(SignerError::SecretTooShort);
        }

        Ok(Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        })
    }

    /// Sign `message`, returning the padded base64url tag.
    #[must_use]
    pub fn sign(&self, message: &str) -> String {
        let tag = hmac::sign(&self.key, message.as_bytes());
        Base64Url::encode_string(tag.as_ref())
    }

    /// Check `signature` against `message` in constant time.
    ///
    /// Undecodable signatures are rejected.
    #[must_use]
    pub fn verify(&self, message: &str, signature: &str) -> bool {
        let Ok(tag) = Base64Url::decode_vec(signature) else {
            return false;
        };
        hmac::verify(&self.key, message.as_bytes(), &tag).is_ok()
    }
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}
