//! HTTP surface: routes, cookies, the guard pipeline and server wiring.

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{header::CONTENT_TYPE, HeaderName, HeaderValue, Method, Request},
    middleware,
    routing::{get, post},
    Extension, Router,
};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, task::JoinHandle};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{debug, error, info, info_span, Span};
use ulid::Ulid;
use utoipa_swagger_ui::SwaggerUi;

use crate::{auth::csrf::CSRF_HEADER, store::UserRole};

pub mod cookies;
pub mod error;
pub mod guard;
pub mod handlers;
mod openapi;
pub mod state;

pub use guard::{AuthContext, Guard, InstancePhase};
pub use openapi::openapi;
pub use state::{AuthConfig, AuthState, Environment};

use guard::{guarded, require_phase};
use handlers::{admin, health, login, me, register};

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

/// Assemble every route with its guards and phase gate.
pub fn router(state: Arc<AuthState>) -> Router {
    let bootstrap = Router::new()
        .route("/v1/register", post(register::begin))
        .route(
            "/v1/register/finish",
            guarded(post(register::finish), &[Guard::Csrf]),
        )
        .route_layer(middleware::from_fn_with_state(
            InstancePhase::Bootstrap,
            require_phase,
        ));

    let main = Router::new()
        .route("/v1/login", post(login::begin))
        .route(
            "/v1/login/finish",
            guarded(post(login::finish), &[Guard::Csrf]),
        )
        .route(
            "/v1/me",
            guarded(
                get(me::me),
                &[Guard::Csrf, Guard::AuthToken, Guard::ActiveUser],
            ),
        )
        .route(
            "/v1/admin/instance",
            guarded(
                get(admin::instance),
                &[
                    Guard::Csrf,
                    Guard::AuthToken,
                    Guard::ActiveUser,
                    Guard::Role(UserRole::Superadmin),
                ],
            ),
        )
        .route_layer(middleware::from_fn_with_state(
            InstancePhase::Ready,
            require_phase,
        ));

    Router::new()
        .merge(bootstrap)
        .merge(main)
        .route("/health", get(health::health).options(health::health))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi()))
        .layer(Extension(state))
}

/// Start the server
/// # Errors
/// Return error if the origin is not a valid header or the listener fails
pub async fn new(port: u16, state: Arc<AuthState>) -> Result<()> {
    let origin = HeaderValue::from_str(state.config().rp_origin())
        .context("Failed to build CORS origin header")?;
    let cors = CorsLayer::new()
        .allow_headers([CONTENT_TYPE, HeaderName::from_static(CSRF_HEADER)])
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(AllowOrigin::exact(origin))
        .allow_credentials(true);

    let sweeper = spawn_challenge_sweeper(state.clone());

    let app = router(state).layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(cors),
    );

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {err}");
            }
            info!("Gracefully shutdown");
        })
        .await?;

    sweeper.abort();

    Ok(())
}

/// Periodically drop ceremonies nobody finished.
fn spawn_challenge_sweeper(state: Arc<AuthState>) -> JoinHandle<()> {
    let every = Duration::from_secs(state.config().challenge_ttl_seconds().max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let purged = state.ceremonies().purge_expired().await;
            if purged > 0 {
                debug!(purged, "expired ceremonies dropped");
            }
        }
    })
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
