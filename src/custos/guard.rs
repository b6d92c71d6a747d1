//! Per-route authorization pipeline.
//!
//! Routes list their guards explicitly and they run in that order. The
//! `AuthToken` guard is the only one that writes an [`AuthContext`]; guards
//! reading it must come after.

use axum::{
    extract::{Request, State},
    http::{Extensions, HeaderMap},
    middleware::{self, Next},
    response::Response,
    routing::MethodRouter,
    Extension,
};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{
    cookies::{bound_auth_token, extract_cookie, AUTH_TOKEN_COOKIE},
    error::ApiError,
    state::AuthState,
};
use crate::{
    auth::{
        csrf::{CSRF_HEADER, CSRF_SIGNATURE_COOKIE, CSRF_TOKEN_COOKIE},
        token::parse_token_id,
        RequestBinding,
    },
    store::{UserRole, UserStatus},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Guard {
    Csrf,
    AuthToken,
    ActiveUser,
    Role(UserRole),
}

/// Identity resolved from the `auth_token` cookie.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub username: String,
    pub display_name: String,
    pub role: UserRole,
    pub status: UserStatus,
    pub token: String,
}

/// Wrap `route` so that `guards` run first to last before the handler.
pub fn guarded<S>(route: MethodRouter<S>, guards: &[Guard]) -> MethodRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    // the last layer applied is the first to run
    guards.iter().rev().fold(route, |route, guard| {
        route.layer(middleware::from_fn_with_state(*guard, enforce))
    })
}

async fn enforce(
    State(guard): State<Guard>,
    Extension(state): Extension<Arc<AuthState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    // only the owned parts live across awaits, the body is not `Sync`
    let (mut parts, body) = request.into_parts();

    match guard {
        Guard::Csrf => check_csrf(&state, &parts.headers)?,
        Guard::AuthToken => {
            let context = authenticate(&state, &parts.headers).await?;
            parts.extensions.insert(context);
        }
        Guard::ActiveUser => {
            let context = context(&parts.extensions)?;
            if context.status != UserStatus::Active {
                warn!(user_id = %context.user_id, status = %context.status, "inactive user rejected");
                return Err(ApiError::Forbidden("user is not active"));
            }
        }
        Guard::Role(expected) => {
            let context = context(&parts.extensions)?;
            if context.role != expected {
                warn!(
                    user_id = %context.user_id,
                    role = %context.role,
                    required = %expected,
                    "role rejected"
                );
                return Err(ApiError::Forbidden("insufficient role"));
            }
        }
    }

    Ok(next.run(Request::from_parts(parts, body)).await)
}

fn check_csrf(state: &AuthState, headers: &HeaderMap) -> Result<(), ApiError> {
    let header_token = headers
        .get(CSRF_HEADER)
        .and_then(|value| value.to_str().ok());
    let cookie_token = extract_cookie(headers, CSRF_TOKEN_COOKIE);
    let cookie_signature = extract_cookie(headers, CSRF_SIGNATURE_COOKIE);

    state.csrf().verify(
        header_token,
        cookie_token.as_deref(),
        cookie_signature.as_deref(),
        &bound_auth_token(headers),
        &RequestBinding::from_headers(headers),
    )?;
    Ok(())
}

async fn authenticate(state: &AuthState, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
    let token = extract_cookie(headers, AUTH_TOKEN_COOKIE).ok_or_else(|| {
        debug!("missing auth token cookie");
        ApiError::token()
    })?;
    let token_id = parse_token_id(&token).ok_or_else(|| {
        debug!("malformed auth token cookie");
        ApiError::token()
    })?;

    let user = state.tokens().validate_and_resolve_user(token_id).await?;

    Ok(AuthContext {
        user_id: user.id,
        username: user.username,
        display_name: user.display_name,
        role: user.role,
        status: user.status,
        token,
    })
}

fn context(extensions: &Extensions) -> Result<&AuthContext, ApiError> {
    extensions.get::<AuthContext>().ok_or_else(|| {
        error!("guard needs an AuthContext but AuthToken did not run before it");
        ApiError::Internal
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstancePhase {
    Bootstrap,
    Ready,
}

/// Answer 404 for routes that belong to the other instance phase.
pub async fn require_phase(
    State(phase): State<InstancePhase>,
    Extension(state): Extension<Arc<AuthState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let ready = state.bootstrap().is_ready();
    match (phase, ready) {
        (InstancePhase::Bootstrap, false) | (InstancePhase::Ready, true) => {
            Ok(next.run(request).await)
        }
        _ => Err(ApiError::NotFound),
    }
}
