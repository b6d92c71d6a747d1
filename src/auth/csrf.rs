//! Double-submit CSRF tokens bound to the browsing context and auth token.
//!
//! Flow Overview:
//! 1) `issue` mints a random token and signs it together with the bound auth
//!    token and the request's `User-Agent`, `Accept` and `Accept-Language`.
//! 2) The token goes to a script-readable cookie, the signature to an
//!    `HttpOnly` cookie.
//! 3) `verify` requires the header echo to equal the cookie token, then
//!    recomputes the signature over the *current* request's binding fields.
//!
//! The bound auth token is concatenated even when empty, so a pair minted
//! before login stops verifying once an `auth_token` cookie is present.

use axum::http::{
    header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT},
    HeaderMap, HeaderName,
};
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

use super::signer::TokenSigner;

pub const CSRF_TOKEN_COOKIE: &str = "csrf_token";
pub const CSRF_SIGNATURE_COOKIE: &str = "csrf_sig";
pub const CSRF_HEADER: &str = "x-csrf-token";

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CsrfError {
    #[error("missing csrf token")]
    MissingToken,
    #[error("csrf token does not match cookie")]
    TokenMismatch,
    #[error("missing csrf signature")]
    MissingSignature,
    #[error("csrf signature does not match")]
    SignatureMismatch,
}

/// Request headers folded into the signature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestBinding {
    user_agent: String,
    accept: String,
    accept_language: String,
}

impl RequestBinding {
    #[must_use]
    pub fn new(user_agent: &str, accept: &str, accept_language: &str) -> Self {
        Self {
            user_agent: user_agent.to_string(),
            accept: accept.to_string(),
            accept_language: accept_language.to_string(),
        }
    }

    /// Missing or non-UTF8 headers bind as empty strings.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let value = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
        };
        Self::new(value(USER_AGENT), value(ACCEPT), value(ACCEPT_LANGUAGE))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfPair {
    pub token: String,
    pub signature: String,
}

#[derive(Debug, Clone)]
pub struct CsrfProtocol {
    signer: TokenSigner,
}

impl CsrfProtocol {
    #[must_use]
    pub fn new(signer: TokenSigner) -> Self {
        Self { signer }
    }

    #[must_use]
    pub fn issue(&self, bound_auth_token: &str, binding: &RequestBinding) -> CsrfPair {
        let token = Uuid::new_v4().to_string();
        let signature = self
            .signer
            .sign(&signed_material(&token, bound_auth_token, binding));
        CsrfPair { token, signature }
    }

    /// Verify a double-submitted token.
    ///
    /// The header/cookie comparison runs before the signature check.
    ///
    /// # Errors
    /// Returns the first failing check as a `CsrfError`.
    pub fn verify(
        &self,
        header_token: Option<&str>,
        cookie_token: Option<&str>,
        cookie_signature: Option<&str>,
        bound_auth_token: &str,
        binding: &RequestBinding,
    ) -> Result<(), CsrfError> {
        let header_token = header_token
            .filter(|token| !token.is_empty())
            .ok_or(CsrfError::MissingToken)?;
        let cookie_token = cookie_token.ok_or(CsrfError::MissingToken)?;

        if !bool::from(header_token.as_bytes().ct_eq(cookie_token.as_bytes())) {
            return Err(CsrfError::TokenMismatch);
        }

        let signature = cookie_signature
            .filter(|signature| !signature.is_empty())
            .ok_or(CsrfError::MissingSignature)?;

        if self.signer.verify(
            &signed_material(cookie_token, bound_auth_token, binding),
            signature,
        ) {
            Ok(())
        } else {
            Err(CsrfError::SignatureMismatch)
        }
    }
}

fn signed_material(token: &str, bound_auth_token: &str, binding: &RequestBinding) -> String {
    format!(
        "{token}{bound_auth_token}{}{}{}",
        binding.user_agent, binding.accept, binding.accept_language
    )
}
