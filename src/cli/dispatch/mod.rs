use crate::{
    auth::signer::MIN_SECRET_LEN,
    cli::actions::{server::Args, Action},
    custos::{AuthConfig, Environment},
};
use anyhow::{anyhow, Context, Result};
use secrecy::SecretString;
use url::Url;

/// Turn parsed arguments into a validated `Action`.
/// # Errors
/// Returns an error if a value is missing or out of range
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches.get_one::<String>("dsn").cloned();

    let secret = matches
        .get_one::<String>("secret")
        .cloned()
        .context("missing required argument: --secret")?;
    if secret.len() < MIN_SECRET_LEN {
        return Err(anyhow!("--secret must be at least {MIN_SECRET_LEN} bytes"));
    }

    let environment: Environment = matches
        .get_one::<String>("environment")
        .map_or("dev", String::as_str)
        .parse()?;

    let rp_origin = matches
        .get_one::<String>("rp-origin")
        .cloned()
        .context("missing required argument: --rp-origin")?;
    Url::parse(&rp_origin).with_context(|| format!("invalid --rp-origin: {rp_origin}"))?;

    let rp_id = matches
        .get_one::<String>("rp-id")
        .cloned()
        .context("missing required argument: --rp-id")?;
    let rp_name = matches
        .get_one::<String>("rp-name")
        .cloned()
        .context("missing required argument: --rp-name")?;

    let challenge_ttl = matches
        .get_one::<u64>("challenge-ttl")
        .copied()
        .context("missing required argument: --challenge-ttl")?;
    let token_ttl = matches
        .get_one::<i64>("token-ttl")
        .copied()
        .context("missing required argument: --token-ttl")?;

    let auth = AuthConfig::new(SecretString::from(secret))
        .with_environment(environment)
        .with_rp_id(rp_id)
        .with_rp_name(rp_name)
        .with_rp_origin(rp_origin)
        .with_challenge_ttl_seconds(challenge_ttl)
        .with_token_ttl_seconds(token_ttl);

    Ok(Action::Server(Args { port, dsn, auth }))
}
