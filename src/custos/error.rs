//! Response envelope and the mapping from domain errors to HTTP.
//!
//! Clients only ever see a generic message and a stable code; which check
//! failed is logged here, never returned.

use axum::{
    http::{header::InvalidHeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};
use utoipa::ToSchema;

use crate::auth::{BootstrapError, CeremonyError, CsrfError, TokenError};

pub const TOKEN_VALIDATION_FAILED: &str = "failed to validate token";

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub message: String,
    pub code: String,
}

/// `{"response": ..., "error": ...}`, exactly one of them set.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub response: Option<T>,
    pub error: Option<ErrorBody>,
}

pub fn ok<T: Serialize>(payload: T) -> Json<Envelope<T>> {
    Json(Envelope {
        response: Some(payload),
        error: None,
    })
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("{0}")]
    InvalidInput(&'static str),
    #[error("{0}")]
    AuthenticationFailed(&'static str),
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("too many attempts")]
    TooManyAttempts,
    #[error("not found")]
    NotFound,
    #[error("internal server error")]
    Internal,
}

impl ApiError {
    #[must_use]
    pub fn token() -> Self {
        Self::AuthenticationFailed(TOKEN_VALIDATION_FAILED)
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::AuthenticationFailed(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::TooManyAttempts => StatusCode::TOO_MANY_REQUESTS,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_request",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::Forbidden(_) => "forbidden",
            Self::TooManyAttempts => "too_many_attempts",
            Self::NotFound => "not_found",
            Self::Internal => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Envelope::<()> {
            response: None,
            error: Some(ErrorBody {
                message: self.to_string(),
                code: self.code().to_string(),
            }),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<CsrfError> for ApiError {
    fn from(err: CsrfError) -> Self {
        warn!("csrf validation failed: {err}");
        Self::token()
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::NotFound | TokenError::Expired => {
                debug!("auth token rejected: {err}");
                Self::token()
            }
            TokenError::Store(err) => {
                error!("Failed to resolve auth token: {err:#}");
                Self::Internal
            }
        }
    }
}

impl From<CeremonyError> for ApiError {
    fn from(err: CeremonyError) -> Self {
        match err {
            CeremonyError::Webauthn(err) => {
                error!("WebAuthn ceremony failed: {err:?}");
                Self::Internal
            }
            // logged with the credential id where it was detected
            CeremonyError::CloneDetected { .. } => Self::token(),
            other => {
                warn!("WebAuthn ceremony rejected: {other}");
                Self::token()
            }
        }
    }
}

impl From<BootstrapError> for ApiError {
    fn from(err: BootstrapError) -> Self {
        match err {
            BootstrapError::InvalidCode => Self::InvalidInput("invalid registration code"),
            BootstrapError::CodeMismatch => {
                Self::AuthenticationFailed("invalid registration code")
            }
            BootstrapError::TooManyAttempts => Self::TooManyAttempts,
            other => {
                error!("Bootstrap gate failure: {other}");
                Self::Internal
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        error!("{err:#}");
        Self::Internal
    }
}

impl From<InvalidHeaderValue> for ApiError {
    fn from(err: InvalidHeaderValue) -> Self {
        error!("Failed to build response header: {err}");
        Self::Internal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::Value;

    async fn body(err: ApiError) -> (StatusCode, Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, serde_json::from_slice(&bytes).expect("json"))
    }

    #[tokio::test]
    async fn envelope_shape() {
        let (status, json) = body(ApiError::token()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["response"], Value::Null);
        assert_eq!(json["error"]["message"], "failed to validate token");
        assert_eq!(json["error"]["code"], "authentication_failed");
    }

    #[test]
    fn csrf_failures_are_indistinguishable() {
        for err in [
            CsrfError::MissingToken,
            CsrfError::TokenMismatch,
            CsrfError::MissingSignature,
            CsrfError::SignatureMismatch,
        ] {
            assert_eq!(ApiError::from(err), ApiError::token());
        }
    }

    #[test]
    fn ceremony_failures_hide_detail() {
        assert_eq!(
            ApiError::from(CeremonyError::CloneDetected {
                credential_id: "cred-1".to_string()
            }),
            ApiError::token()
        );
        assert_eq!(
            ApiError::from(CeremonyError::AttestationInvalid),
            ApiError::token()
        );
        assert_eq!(
            ApiError::from(CeremonyError::SessionNotFound),
            ApiError::token()
        );
    }

    #[test]
    fn bootstrap_mapping() {
        assert_eq!(
            ApiError::from(BootstrapError::TooManyAttempts).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::from(BootstrapError::InvalidCode).code(),
            "invalid_request"
        );
        assert_eq!(
            ApiError::from(BootstrapError::NoCodeIssued),
            ApiError::Internal
        );
    }
}
