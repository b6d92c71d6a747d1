use axum::{extract::Extension, response::IntoResponse};

use super::MeResponse;
use crate::custos::{
    error::{ok, ErrorBody},
    guard::AuthContext,
};

#[utoipa::path(
    get,
    path= "/v1/me",
    responses (
        (status = 200, description = "The signed-in user", body = MeResponse),
        (status = 400, description = "Missing or invalid auth token or CSRF pair", body = ErrorBody),
        (status = 403, description = "User is not active", body = ErrorBody),
    ),
    params(
        ("X-CSRF-Token" = String, Header, description = "Value of the csrf_token cookie"),
    ),
    tag= "me"
)]
// axum handler for me
pub async fn me(Extension(context): Extension<AuthContext>) -> impl IntoResponse {
    ok(MeResponse::from(&context))
}
