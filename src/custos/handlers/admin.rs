use axum::{extract::Extension, response::IntoResponse};
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use super::MeResponse;
use crate::custos::{
    error::{ok, ApiError, ErrorBody},
    guard::AuthContext,
    state::AuthState,
};

#[derive(ToSchema, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    ready: bool,
    environment: String,
    rp_id: String,
    rp_origin: String,
    challenge_ttl_seconds: u64,
    token_ttl_seconds: i64,
    superadmin: MeResponse,
    passkeys: usize,
}

#[utoipa::path(
    get,
    path= "/v1/admin/instance",
    responses (
        (status = 200, description = "Instance settings and the caller's passkey count", body = InstanceSummary),
        (status = 400, description = "Missing or invalid auth token or CSRF pair", body = ErrorBody),
        (status = 403, description = "Caller is not an active superadmin", body = ErrorBody),
    ),
    params(
        ("X-CSRF-Token" = String, Header, description = "Value of the csrf_token cookie"),
    ),
    tag= "admin"
)]
pub async fn instance(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(context): Extension<AuthContext>,
) -> Result<impl IntoResponse, ApiError> {
    let passkeys = state.credentials().credentials_by_user(context.user_id).await?;
    let config = state.config();

    Ok(ok(InstanceSummary {
        ready: state.bootstrap().is_ready(),
        environment: config.environment().to_string(),
        rp_id: config.rp_id().to_string(),
        rp_origin: config.rp_origin().to_string(),
        challenge_ttl_seconds: config.challenge_ttl_seconds(),
        token_ttl_seconds: config.token_ttl_seconds(),
        superadmin: MeResponse::from(&context),
        passkeys: passkeys.len(),
    }))
}
