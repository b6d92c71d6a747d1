//! Bootstrap registration of the first superadmin.

use anyhow::Context;
use axum::{
    extract::Extension,
    http::HeaderMap,
    response::{IntoResponse, Json},
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use webauthn_rs::prelude::RegisterPublicKeyCredential;

use super::{csrf_headers, session_headers, MeResponse};
use crate::{
    auth::RequestBinding,
    custos::{
        error::{ok, ApiError, ErrorBody},
        state::AuthState,
    },
    store::{StoredCredential, User, UserRole, UserStatus},
};

pub const SUPERADMIN_USERNAME: &str = "superadmin";
pub const SUPERADMIN_DISPLAY_NAME: &str = "Superadmin";

#[derive(ToSchema, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationCodeRequest {
    registration_code: String,
}

#[derive(ToSchema, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FinishRegistrationRequest {
    #[schema(value_type = Object)]
    credential: RegisterPublicKeyCredential,
    user_id: String,
}

#[utoipa::path(
    post,
    path= "/v1/register",
    request_body = RegistrationCodeRequest,
    responses (
        (status = 200, description = "Public key creation options, CSRF cookies are set", content_type = "application/json"),
        (status = 400, description = "Invalid registration code", body = ErrorBody),
        (status = 404, description = "Instance is already initialized", body = ErrorBody),
        (status = 429, description = "Registration code is locked", body = ErrorBody),
    ),
    tag= "register"
)]
#[instrument(skip_all)]
pub async fn begin(
    headers: HeaderMap,
    Extension(state): Extension<Arc<AuthState>>,
    payload: Option<Json<RegistrationCodeRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(Json(request)) = payload else {
        return Err(ApiError::InvalidInput("missing payload"));
    };

    state
        .bootstrap()
        .validate(&request.registration_code)
        .await?;

    let challenge = state
        .ceremonies()
        .begin_registration(SUPERADMIN_USERNAME, SUPERADMIN_DISPLAY_NAME)
        .await?;

    // nobody is signed in yet, the pair binds to the empty token
    let cookies = csrf_headers(&state, "", &RequestBinding::from_headers(&headers))?;

    Ok((cookies, ok(challenge.options)))
}

#[utoipa::path(
    post,
    path= "/v1/register/finish",
    request_body = FinishRegistrationRequest,
    responses (
        (status = 200, description = "Superadmin created, auth and CSRF cookies are set", body = MeResponse),
        (status = 400, description = "CSRF or attestation failure", body = ErrorBody),
        (status = 404, description = "Instance is already initialized", body = ErrorBody),
    ),
    params(
        ("X-CSRF-Token" = String, Header, description = "Value of the csrf_token cookie"),
    ),
    tag= "register"
)]
#[instrument(skip_all)]
pub async fn finish(
    headers: HeaderMap,
    Extension(state): Extension<Arc<AuthState>>,
    payload: Option<Json<FinishRegistrationRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(Json(request)) = payload else {
        return Err(ApiError::InvalidInput("missing payload"));
    };

    // two ceremonies may race past the phase gate, only the first one wins
    if state.bootstrap().is_ready() {
        warn!("registration finished after the instance became ready");
        return Err(ApiError::NotFound);
    }

    let verified = state
        .ceremonies()
        .finish_registration(&request.user_id, &request.credential)
        .await?;

    let now = Utc::now();
    let user = User {
        id: verified.subject_id,
        username: SUPERADMIN_USERNAME.to_string(),
        display_name: SUPERADMIN_DISPLAY_NAME.to_string(),
        status: UserStatus::Active,
        role: UserRole::Superadmin,
        created_at: now,
    };
    let credential = StoredCredential {
        credential_id: verified.credential_id,
        user_id: user.id,
        passkey: verified.passkey,
        sign_count: verified.sign_count,
        transports: verified.transports,
        created_at: now,
        last_used_at: None,
    };

    state
        .users()
        .create_with_credential(&user, &credential)
        .await
        .context("Failed to create superadmin")?;
    state.bootstrap().mark_ready().await?;

    let token = state.tokens().issue(user.id).await?;
    let cookies = session_headers(
        &state,
        &token.id.to_string(),
        &RequestBinding::from_headers(&headers),
    )?;

    info!(user_id = %user.id, "superadmin registered");

    Ok((cookies, ok(MeResponse::from(&user))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{custos::state::AuthConfig, store::MemoryStore};
    use axum::http::{header::SET_COOKIE, StatusCode};
    use secrecy::SecretString;
    use serde_json::Value;

    fn state() -> Arc<AuthState> {
        let config = AuthConfig::new(SecretString::from(
            "register-test-secret-0123456789".to_string(),
        ));
        Arc::new(AuthState::new(config, Arc::new(MemoryStore::new())).expect("state"))
    }

    fn code(code: &str) -> Option<Json<RegistrationCodeRequest>> {
        Some(Json(RegistrationCodeRequest {
            registration_code: code.to_string(),
        }))
    }

    #[tokio::test]
    async fn begin_requires_payload() {
        let result = begin(HeaderMap::new(), Extension(state()), None).await;
        assert_eq!(
            result.err(),
            Some(ApiError::InvalidInput("missing payload"))
        );
    }

    #[tokio::test]
    async fn begin_rejects_wrong_code() {
        let state = state();
        state.bootstrap().issue_code("482913").await.expect("issue");

        let result = begin(HeaderMap::new(), Extension(state.clone()), code("000000")).await;
        assert_eq!(
            result.err().map(|err| err.code()),
            Some("authentication_failed")
        );

        let result = begin(HeaderMap::new(), Extension(state), code("12345")).await;
        assert_eq!(result.err().map(|err| err.code()), Some("invalid_request"));
    }

    #[tokio::test]
    async fn begin_returns_options_and_csrf_cookies() {
        let state = state();
        state.bootstrap().issue_code("482913").await.expect("issue");

        let response = begin(HeaderMap::new(), Extension(state), code("482913"))
            .await
            .expect("begin")
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let cookies: Vec<String> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        assert_eq!(cookies.len(), 2);
        assert!(cookies[0].starts_with("csrf_token="));
        assert!(cookies[1].starts_with("csrf_sig="));

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let json: Value = serde_json::from_slice(&bytes).expect("json");
        assert!(json["response"]["publicKey"]["challenge"].is_string());
        assert_eq!(json["error"], Value::Null);
    }

    #[tokio::test]
    async fn finish_with_unknown_subject_fails() {
        let state = state();
        let credential: RegisterPublicKeyCredential = serde_json::from_value(serde_json::json!({
            "id": "dummy",
            "rawId": "AA",
            "type": "public-key",
            "response": {
                "attestationObject": "AA",
                "clientDataJSON": "AA"
            }
        }))
        .expect("credential");
        let payload = Some(Json(FinishRegistrationRequest {
            credential,
            user_id: uuid::Uuid::new_v4().to_string(),
        }));

        let result = finish(HeaderMap::new(), Extension(state.clone()), payload).await;
        assert_eq!(result.err(), Some(ApiError::token()));
        assert!(!state.bootstrap().is_ready());
    }
}
