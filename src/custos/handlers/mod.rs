pub mod admin;
pub mod health;
pub mod login;
pub mod me;
pub mod register;

// common functions for the handlers
use axum::http::{header::SET_COOKIE, HeaderMap};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use utoipa::ToSchema;

use super::{
    cookies::{append_csrf_cookies, auth_token_cookie},
    error::ApiError,
    guard::AuthContext,
    state::AuthState,
};
use crate::{
    auth::RequestBinding,
    store::{User, UserRole, UserStatus},
};

/// The signed-in user as returned by `/v1/me` and the finish endpoints.
#[derive(ToSchema, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub role: UserRole,
    pub status: UserStatus,
}

impl From<&User> for MeResponse {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.to_string(),
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            role: user.role,
            status: user.status,
        }
    }
}

impl From<&AuthContext> for MeResponse {
    fn from(context: &AuthContext) -> Self {
        Self {
            id: context.user_id.to_string(),
            username: context.username.clone(),
            display_name: context.display_name.clone(),
            role: context.role,
            status: context.status,
        }
    }
}

static USERNAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]{2,63}$").ok());

pub fn valid_username(username: &str) -> bool {
    USERNAME.as_ref().is_some_and(|re| re.is_match(username))
}

/// `Set-Cookie` headers for a fresh CSRF pair bound to `bound_auth_token`.
pub(crate) fn csrf_headers(
    state: &AuthState,
    bound_auth_token: &str,
    binding: &RequestBinding,
) -> Result<HeaderMap, ApiError> {
    let pair = state.csrf().issue(bound_auth_token, binding);
    let mut headers = HeaderMap::new();
    append_csrf_cookies(&mut headers, state.config(), &pair)?;
    Ok(headers)
}

/// `Set-Cookie` headers after a successful ceremony: the new `auth_token`
/// plus a CSRF pair bound to it.
pub(crate) fn session_headers(
    state: &AuthState,
    token: &str,
    binding: &RequestBinding,
) -> Result<HeaderMap, ApiError> {
    let mut headers = csrf_headers(state, token, binding)?;
    headers.append(SET_COOKIE, auth_token_cookie(state.config(), token)?);
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_username() {
        assert!(USERNAME.is_some());
        assert!(valid_username("superadmin"));
        assert!(valid_username("jane.doe-01"));
        assert!(!valid_username("ab"));
        assert!(!valid_username(".hidden"));
        assert!(!valid_username("with space"));
        assert!(!valid_username(&"x".repeat(65)));
    }

    #[test]
    fn me_from_user() {
        let user = User::new("alice", "Alice", UserStatus::Active, UserRole::Admin);
        let me = MeResponse::from(&user);
        assert_eq!(me.id, user.id.to_string());
        assert_eq!(me.display_name, "Alice");

        let json = serde_json::to_value(&me).unwrap_or_default();
        assert_eq!(json["displayName"], "Alice");
        assert_eq!(json["role"], "admin");
        assert_eq!(json["status"], "active");
    }
}
