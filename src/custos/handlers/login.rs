//! Passkey login for registered users.

use axum::{
    extract::Extension,
    http::HeaderMap,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use utoipa::ToSchema;
use webauthn_rs::prelude::{PublicKeyCredential, RequestChallengeResponse};

use super::{csrf_headers, session_headers, valid_username, MeResponse};
use crate::{
    auth::RequestBinding,
    custos::{
        cookies::bound_auth_token,
        error::{ok, ApiError, ErrorBody},
        state::AuthState,
    },
};

#[derive(ToSchema, Deserialize, Debug)]
pub struct LoginRequest {
    username: String,
}

/// Assertion options with the key the client echoes back on finish.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LoginOptions {
    #[serde(flatten)]
    options: RequestChallengeResponse,
    session_key: String,
}

#[derive(ToSchema, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FinishLoginRequest {
    #[schema(value_type = Object)]
    credential: PublicKeyCredential,
    session_key: String,
}

#[utoipa::path(
    post,
    path= "/v1/login",
    request_body = LoginRequest,
    responses (
        (status = 200, description = "Assertion options and session key, CSRF cookies are set", content_type = "application/json"),
        (status = 400, description = "Invalid username or no usable credentials", body = ErrorBody),
    ),
    tag= "login"
)]
#[instrument(skip_all)]
pub async fn begin(
    headers: HeaderMap,
    Extension(state): Extension<Arc<AuthState>>,
    payload: Option<Json<LoginRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(Json(request)) = payload else {
        return Err(ApiError::InvalidInput("missing payload"));
    };
    if !valid_username(&request.username) {
        return Err(ApiError::InvalidInput("invalid username"));
    }

    // unknown users and users without passkeys get the same answer
    let Some(found) = state
        .users()
        .user_by_username_with_credentials(&request.username)
        .await?
    else {
        debug!("login for unknown username");
        return Err(ApiError::token());
    };

    let challenge = state
        .ceremonies()
        .begin_login(&found.user, &found.credentials)
        .await?;

    let cookies = csrf_headers(
        &state,
        &bound_auth_token(&headers),
        &RequestBinding::from_headers(&headers),
    )?;

    Ok((
        cookies,
        ok(LoginOptions {
            options: challenge.options,
            session_key: challenge.session_key,
        }),
    ))
}

#[utoipa::path(
    post,
    path= "/v1/login/finish",
    request_body = FinishLoginRequest,
    responses (
        (status = 200, description = "Signed in, auth and CSRF cookies are set", body = MeResponse),
        (status = 400, description = "CSRF or assertion failure", body = ErrorBody),
    ),
    params(
        ("X-CSRF-Token" = String, Header, description = "Value of the csrf_token cookie"),
    ),
    tag= "login"
)]
#[instrument(skip_all)]
pub async fn finish(
    headers: HeaderMap,
    Extension(state): Extension<Arc<AuthState>>,
    payload: Option<Json<FinishLoginRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(Json(request)) = payload else {
        return Err(ApiError::InvalidInput("missing payload"));
    };

    let user_id = state
        .ceremonies()
        .pending_login_user(&request.session_key)
        .await
        .ok_or_else(|| {
            debug!("unknown or expired login session");
            ApiError::token()
        })?;

    let found = state
        .users()
        .user_by_id_with_credentials(user_id)
        .await?
        .ok_or_else(|| {
            debug!(%user_id, "login session for a deleted user");
            ApiError::token()
        })?;

    let verified = state
        .ceremonies()
        .finish_login(
            &request.session_key,
            &request.credential,
            &found.user,
            &found.credentials,
        )
        .await?;

    state
        .credentials()
        .update_after_login(
            &verified.credential_id,
            verified.sign_count,
            &verified.passkey,
        )
        .await?;

    let token = state.tokens().issue(found.user.id).await?;
    let cookies = session_headers(
        &state,
        &token.id.to_string(),
        &RequestBinding::from_headers(&headers),
    )?;

    info!(
        user_id = %found.user.id,
        user_verified = verified.user_verified,
        "user signed in"
    );

    Ok((cookies, ok(MeResponse::from(&found.user))))
}
