//! Cookie names, parsing and `Set-Cookie` values.

use axum::http::{
    header::{InvalidHeaderValue, COOKIE, SET_COOKIE},
    HeaderMap, HeaderValue,
};

use super::state::AuthConfig;
use crate::auth::{
    csrf::{CSRF_SIGNATURE_COOKIE, CSRF_TOKEN_COOKIE},
    CsrfPair,
};

pub const AUTH_TOKEN_COOKIE: &str = "auth_token";

/// Find a cookie by name across every `Cookie` header.
pub fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|header| header.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| {
            let mut parts = pair.trim().splitn(2, '=');
            let key = parts.next()?.trim();
            let val = parts.next()?.trim();
            (key == name).then(|| val.to_string())
        })
}

/// The current `auth_token` cookie, or `""` before login.
#[must_use]
pub fn bound_auth_token(headers: &HeaderMap) -> String {
    extract_cookie(headers, AUTH_TOKEN_COOKIE).unwrap_or_default()
}

fn cookie(
    config: &AuthConfig,
    name: &str,
    value: &str,
    http_only: bool,
    max_age: Option<i64>,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!("{name}={value}; Path=/; SameSite=Strict");
    if http_only {
        cookie.push_str("; HttpOnly");
    }
    if let Some(max_age) = max_age {
        cookie.push_str(&format!("; Max-Age={max_age}"));
    }
    if config.cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

/// `auth_token` cookie living as long as the token itself.
pub fn auth_token_cookie(config: &AuthConfig, token: &str) -> Result<HeaderValue, InvalidHeaderValue> {
    cookie(
        config,
        AUTH_TOKEN_COOKIE,
        token,
        true,
        Some(config.token_ttl_seconds()),
    )
}

/// Append `csrf_token` (script readable) and `csrf_sig` (`HttpOnly`).
pub fn append_csrf_cookies(
    headers: &mut HeaderMap,
    config: &AuthConfig,
    pair: &CsrfPair,
) -> Result<(), InvalidHeaderValue> {
    headers.append(
        SET_COOKIE,
        cookie(config, CSRF_TOKEN_COOKIE, &pair.token, false, None)?,
    );
    headers.append(
        SET_COOKIE,
        cookie(config, CSRF_SIGNATURE_COOKIE, &pair.signature, true, None)?,
    );
    Ok(())
}
