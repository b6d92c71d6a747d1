#![allow(clippy::needless_for_each)]

use utoipa::OpenApi;

use super::{
    error::ErrorBody,
    handlers::{admin, health, login, me, register, MeResponse},
};
use crate::store::{UserRole, UserStatus};

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        register::begin,
        register::finish,
        login::begin,
        login::finish,
        me::me,
        admin::instance,
    ),
    components(
        schemas(
            health::Health,
            register::RegistrationCodeRequest,
            register::FinishRegistrationRequest,
            login::LoginRequest,
            login::FinishLoginRequest,
            admin::InstanceSummary,
            MeResponse,
            ErrorBody,
            UserRole,
            UserStatus,
        )
    ),
    tags(
        (name = "register", description = "One-time bootstrap of the superadmin passkey"),
        (name = "login", description = "Passkey login"),
        (name = "me", description = "The signed-in user"),
        (name = "admin", description = "Superadmin only"),
        (name = "health", description = "Liveness"),
    )
)]
pub struct ApiDoc;

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documents_every_route() {
        let doc = openapi();
        for path in [
            "/health",
            "/v1/register",
            "/v1/register/finish",
            "/v1/login",
            "/v1/login/finish",
            "/v1/me",
            "/v1/admin/instance",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
