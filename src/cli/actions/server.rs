use crate::{
    cli::telemetry,
    custos::{self, AuthConfig, AuthState},
    store::{MemoryStore, PgStore},
};
use anyhow::Result;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub auth: AuthConfig,
}

/// Connect the store, issue the registration code if needed and serve.
/// # Errors
/// Returns an error if the store, the auth state or the listener fails
pub async fn execute(args: Args) -> Result<()> {
    let state = if let Some(dsn) = args.dsn {
        let store = PgStore::connect(&dsn).await?;
        AuthState::new(args.auth, Arc::new(store))?
    } else {
        warn!("No DSN configured, using the in-memory store, nothing survives a restart");
        AuthState::new(args.auth, Arc::new(MemoryStore::new()))?
    };
    let state = Arc::new(state);

    match state.bootstrap().initialize_if_needed().await? {
        Some(code) => print_registration_code(&code, state.config().rp_origin()),
        None => info!("Instance is ready"),
    }

    let result = custos::new(args.port, state).await;

    telemetry::shutdown_tracer();

    result
}

// stdout only, the code must never reach the log pipeline
fn print_registration_code(code: &SecretString, origin: &str) {
    let line = "=".repeat(48);
    println!("{line}");
    println!("  REGISTRATION CODE: {}", code.expose_secret());
    println!("  Open {origin} to register the superadmin passkey.");
    println!("  Three wrong attempts lock the code until restart.");
    println!("{line}");
}
