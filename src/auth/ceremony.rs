//! Passkey registration and login ceremonies.
//!
//! Flow Overview:
//! 1) `begin_*` asks `webauthn-rs` for options and parks the ceremony state in
//!    the challenge cache: registrations under the ephemeral subject id,
//!    logins under a random session key unrelated to the user.
//! 2) `finish_*` takes the parked state out of the cache (one use only) and
//!    lets `webauthn-rs` verify the client response against it.
//! 3) Logins whose sign counter did not advance are rejected as cloned
//!    authenticators, whether `webauthn-rs` catches it against the counter
//!    captured at `begin_login` or we catch it against the stored one.
//!
//! Verification failures are collapsed into `AttestationInvalid` or
//! `AssertionInvalid`; the library's reason is only logged.

use anyhow::{anyhow, Context, Result};
use base64ct::{Base64Url, Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error, warn};
use url::Url;
use uuid::Uuid;
use webauthn_rs::prelude::*;

use super::{challenge::ChallengeCache, random_token};
use crate::store::{StoredCredential, User};

pub const DEFAULT_CHALLENGE_TTL_SECONDS: u64 = 60;

#[derive(Debug, Error)]
pub enum CeremonyError {
    #[error("challenge session not found")]
    SessionNotFound,
    #[error("attestation could not be verified")]
    AttestationInvalid,
    #[error("assertion could not be verified")]
    AssertionInvalid,
    #[error("user or credential not found")]
    UserOrCredentialNotFound,
    #[error("sign counter did not advance for credential {credential_id}")]
    CloneDetected { credential_id: String },
    #[error("webauthn error: {0}")]
    Webauthn(#[from] WebauthnError),
}

#[derive(Clone, Debug)]
pub struct CeremonyConfig {
    rp_id: String,
    rp_name: String,
    rp_origin: Url,
    challenge_ttl: Duration,
}

impl CeremonyConfig {
    /// # Errors
    /// Returns error if the RP id is empty or the origin is not a URL.
    pub fn new(
        rp_id: String,
        rp_name: String,
        rp_origin: &str,
        challenge_ttl: Duration,
    ) -> Result<Self> {
        if rp_id.trim().is_empty() {
            return Err(anyhow!("WebAuthn RP ID must not be empty"));
        }
        let rp_origin = Url::parse(rp_origin.trim_end_matches('/'))
            .with_context(|| format!("Invalid WebAuthn origin: {rp_origin}"))?;

        Ok(Self {
            rp_id,
            rp_name,
            rp_origin,
            challenge_ttl,
        })
    }

    #[must_use]
    pub fn rp_id(&self) -> &str {
        &self.rp_id
    }

    #[must_use]
    pub fn rp_name(&self) -> &str {
        &self.rp_name
    }

    #[must_use]
    pub fn rp_origin(&self) -> &Url {
        &self.rp_origin
    }

    #[must_use]
    pub fn challenge_ttl(&self) -> Duration {
        self.challenge_ttl
    }
}

pub enum PendingCeremony {
    Registration(PasskeyRegistration),
    Login(PasskeyAuthentication),
}

/// An in-flight ceremony parked in the challenge cache.
pub struct ChallengeSession {
    pub session_key: String,
    pub challenge: Vec<u8>,
    pub relying_party_id: String,
    pub user_handle: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub ceremony: PendingCeremony,
}

pub struct RegistrationChallenge {
    pub subject_id: Uuid,
    pub options: CreationChallengeResponse,
}

pub struct LoginChallenge {
    pub session_key: String,
    pub options: RequestChallengeResponse,
}

/// A verified passkey ready to be stored.
pub struct VerifiedCredential {
    pub subject_id: Uuid,
    pub credential_id: Vec<u8>,
    pub passkey: Passkey,
    pub sign_count: u32,
    pub transports: Vec<String>,
}

pub struct VerifiedLogin {
    pub credential_id: Vec<u8>,
    pub sign_count: u32,
    pub passkey: Passkey,
    pub user_verified: bool,
}

pub struct PasskeyCeremonies {
    webauthn: Webauthn,
    config: CeremonyConfig,
    sessions: ChallengeCache<Arc<ChallengeSession>>,
}

impl PasskeyCeremonies {
    /// # Errors
    /// Returns error if `webauthn-rs` rejects the RP id/origin pair.
    pub fn new(config: CeremonyConfig) -> Result<Self> {
        let webauthn = WebauthnBuilder::new(config.rp_id(), config.rp_origin())
            .context("Invalid WebAuthn configuration")?
            .rp_name(config.rp_name())
            .build()
            .context("Failed to build WebAuthn verifier")?;

        Ok(Self {
            webauthn,
            sessions: ChallengeCache::new(config.challenge_ttl()),
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &CeremonyConfig {
        &self.config
    }

    /// Start registering a passkey for a subject that does not exist yet.
    ///
    /// # Errors
    /// Returns `CeremonyError::Webauthn` if options cannot be generated.
    pub async fn begin_registration(
        &self,
        user_name: &str,
        display_name: &str,
    ) -> Result<RegistrationChallenge, CeremonyError> {
        let subject_id = Uuid::now_v7();
        let (options, state) =
            self.webauthn
                .start_passkey_registration(subject_id, user_name, display_name, None)?;

        let challenge: Vec<u8> = options.public_key.challenge.clone().into();
        let session = ChallengeSession {
            session_key: subject_id.to_string(),
            challenge,
            relying_party_id: self.config.rp_id.clone(),
            user_handle: subject_id.as_bytes().to_vec(),
            created_at: Utc::now(),
            ceremony: PendingCeremony::Registration(state),
        };
        self.sessions
            .set(session.session_key.clone(), Arc::new(session))
            .await;

        debug!(%subject_id, "registration ceremony started");
        Ok(RegistrationChallenge {
            subject_id,
            options,
        })
    }

    /// Verify the attestation for a pending registration.
    ///
    /// `subject_id` is accepted as a UUID string or as the base64url user
    /// handle from the creation options.
    ///
    /// # Errors
    /// * `SessionNotFound` - unknown, malformed, expired or already used subject
    /// * `AttestationInvalid` - verification failed
    pub async fn finish_registration(
        &self,
        subject_id: &str,
        response: &RegisterPublicKeyCredential,
    ) -> Result<VerifiedCredential, CeremonyError> {
        let subject_id = parse_subject_id(subject_id).ok_or(CeremonyError::SessionNotFound)?;
        let session = self
            .sessions
            .take(&subject_id.to_string())
            .await
            .ok_or(CeremonyError::SessionNotFound)?;
        let PendingCeremony::Registration(state) = &session.ceremony else {
            return Err(CeremonyError::SessionNotFound);
        };

        let passkey = self
            .webauthn
            .finish_passkey_registration(response, state)
            .map_err(|err| {
                warn!(%subject_id, "attestation rejected: {err:?}");
                CeremonyError::AttestationInvalid
            })?;

        let transports = response
            .response
            .transports
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(|transport| {
                serde_json::to_value(transport)
                    .ok()
                    .and_then(|value| value.as_str().map(str::to_string))
            })
            .collect();

        debug!(%subject_id, "registration ceremony verified");
        Ok(VerifiedCredential {
            subject_id,
            credential_id: passkey.cred_id().to_vec(),
            sign_count: passkey_counter(&passkey),
            passkey,
            transports,
        })
    }

    /// Start a login for `user` against their registered credentials.
    ///
    /// # Errors
    /// * `UserOrCredentialNotFound` - `credentials` is empty
    /// * `Webauthn` - options cannot be generated
    pub async fn begin_login(
        &self,
        user: &User,
        credentials: &[StoredCredential],
    ) -> Result<LoginChallenge, CeremonyError> {
        if credentials.is_empty() {
            return Err(CeremonyError::UserOrCredentialNotFound);
        }
        let passkeys: Vec<Passkey> = credentials.iter().map(|c| c.passkey.clone()).collect();
        let (options, state) = self.webauthn.start_passkey_authentication(&passkeys)?;

        let session_key = random_token();
        let challenge: Vec<u8> = options.public_key.challenge.clone().into();
        let session = ChallengeSession {
            session_key: session_key.clone(),
            challenge,
            relying_party_id: self.config.rp_id.clone(),
            user_handle: user.id.as_bytes().to_vec(),
            created_at: Utc::now(),
            ceremony: PendingCeremony::Login(state),
        };
        self.sessions.set(session_key.clone(), Arc::new(session)).await;

        debug!(user_id = %user.id, "login ceremony started");
        Ok(LoginChallenge {
            session_key,
            options,
        })
    }

    /// Look at a pending ceremony without consuming it.
    pub async fn session(&self, session_key: &str) -> Option<Arc<ChallengeSession>> {
        self.sessions.get(session_key).await
    }

    /// The user a pending login belongs to.
    pub async fn pending_login_user(&self, session_key: &str) -> Option<Uuid> {
        let session = self.session(session_key).await?;
        match session.ceremony {
            PendingCeremony::Login(_) => Uuid::from_slice(&session.user_handle).ok(),
            PendingCeremony::Registration(_) => None,
        }
    }

    /// Verify an assertion for a pending login.
    ///
    /// # Errors
    /// * `SessionNotFound` - unknown, expired or already used key, or a key
    ///   belonging to another user
    /// * `AssertionInvalid` - verification failed
    /// * `UserOrCredentialNotFound` - the asserted credential is not in `credentials`
    /// * `CloneDetected` - the sign counter did not advance
    pub async fn finish_login(
        &self,
        session_key: &str,
        response: &PublicKeyCredential,
        user: &User,
        credentials: &[StoredCredential],
    ) -> Result<VerifiedLogin, CeremonyError> {
        let session = self
            .sessions
            .take(session_key)
            .await
            .ok_or(CeremonyError::SessionNotFound)?;
        let PendingCeremony::Login(state) = &session.ceremony else {
            return Err(CeremonyError::SessionNotFound);
        };
        if session.user_handle.as_slice() != user.id.as_bytes() {
            warn!(user_id = %user.id, "login session belongs to another user");
            return Err(CeremonyError::SessionNotFound);
        }

        let result = self
            .webauthn
            .finish_passkey_authentication(response, state)
            .map_err(|err| assertion_error(err, user, &response.id))?;

        let credential_id = result.cred_id().to_vec();
        let credential = credentials
            .iter()
            .find(|c| c.credential_id == credential_id)
            .ok_or(CeremonyError::UserOrCredentialNotFound)?;

        // the counter captured at begin may be older than the stored one
        if !counter_advanced(credential.sign_count, result.counter()) {
            let credential_id = Base64UrlUnpadded::encode_string(&credential_id);
            error!(
                user_id = %user.id,
                credential_id = %credential_id,
                stored = credential.sign_count,
                presented = result.counter(),
                "possible cloned authenticator"
            );
            return Err(CeremonyError::CloneDetected { credential_id });
        }

        let mut passkey = credential.passkey.clone();
        passkey.update_credential(&result);

        debug!(user_id = %user.id, "login ceremony verified");
        Ok(VerifiedLogin {
            credential_id,
            sign_count: result.counter(),
            passkey,
            user_verified: result.user_verified(),
        })
    }

    /// Drop expired ceremonies.
    pub async fn purge_expired(&self) -> usize {
        self.sessions.purge_expired().await
    }
}

/// Authenticators that never count report 0 every time; anything else must
/// strictly increase.
#[must_use]
pub fn counter_advanced(stored: u32, presented: u32) -> bool {
    (stored == 0 && presented == 0) || presented > stored
}

fn assertion_error(err: WebauthnError, user: &User, credential_id: &str) -> CeremonyError {
    match err {
        WebauthnError::CredentialPossibleCompromise => {
            error!(
                user_id = %user.id,
                credential_id = %credential_id,
                "possible cloned authenticator: sign counter did not advance"
            );
            CeremonyError::CloneDetected {
                credential_id: credential_id.to_string(),
            }
        }
        err => {
            warn!(user_id = %user.id, "assertion rejected: {err:?}");
            CeremonyError::AssertionInvalid
        }
    }
}

/// Counter reported by the authenticator at registration.
fn passkey_counter(passkey: &Passkey) -> u32 {
    serde_json::to_value(passkey)
        .ok()
        .and_then(|value| value["cred"]["counter"].as_u64())
        .and_then(|counter| u32::try_from(counter).ok())
        .unwrap_or_default()
}

fn parse_subject_id(raw: &str) -> Option<Uuid> {
    let raw = raw.trim();
    if let Ok(id) = Uuid::parse_str(raw) {
        return Some(id);
    }
    Base64UrlUnpadded::decode_vec(raw)
        .or_else(|_| Base64Url::decode_vec(raw))
        .ok()
        .and_then(|bytes| Uuid::from_slice(&bytes).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{UserRole, UserStatus};
    use webauthn_authenticator_rs::{softpasskey::SoftPasskey, WebauthnAuthenticator};

    type Authenticator = WebauthnAuthenticator<SoftPasskey>;

    fn passkey_ceremonies() -> PasskeyCeremonies {
        let config = CeremonyConfig::new(
            "custos.test".to_string(),
            "custos".to_string(),
            "https://custos.test",
            Duration::from_secs(60),
        )
        .expect("config");
        PasskeyCeremonies::new(config).expect("ceremonies")
    }

    /// Register a soft passkey and return the user and credential to store.
    async fn register(
        ceremonies: &PasskeyCeremonies,
        authenticator: &mut Authenticator,
    ) -> (User, StoredCredential) {
        let started = ceremonies
            .begin_registration("superadmin", "Superadmin")
            .await
            .expect("begin registration");
        let response = authenticator
            .do_registration(ceremonies.config().rp_origin().clone(), started.options)
            .expect("soft passkey registration");
        let verified = ceremonies
            .finish_registration(&started.subject_id.to_string(), &response)
            .await
            .expect("finish registration");
        assert_eq!(verified.subject_id, started.subject_id);

        let mut user = User::new("superadmin", "Superadmin", UserStatus::Active, UserRole::Superadmin);
        user.id = verified.subject_id;
        let credential = StoredCredential {
            credential_id: verified.credential_id,
            user_id: user.id,
            passkey: verified.passkey,
            sign_count: verified.sign_count,
            transports: verified.transports,
            created_at: Utc::now(),
            last_used_at: None,
        };
        (user, credential)
    }

    fn ceremonies(ttl: Duration) -> PasskeyCeremonies {
        let config = CeremonyConfig::new(
            "localhost".to_string(),
            "custos".to_string(),
            "http://localhost:8080",
            ttl,
        )
        .expect("config");
        PasskeyCeremonies::new(config).expect("ceremonies")
    }

    fn dummy_register_credential() -> RegisterPublicKeyCredential {
        serde_json::from_value(serde_json::json!({
            "id": "dummy",
            "rawId": "AA",
            "type": "public-key",
            "response": {
                "attestationObject": "AA",
                "clientDataJSON": "AA"
            }
        }))
        .expect("credential json")
    }

    #[test]
    fn config_rejects_bad_values() {
        assert!(CeremonyConfig::new(
            " ".to_string(),
            "x".to_string(),
            "http://localhost",
            Duration::from_secs(60)
        )
        .is_err());
        assert!(CeremonyConfig::new(
            "localhost".to_string(),
            "x".to_string(),
            "not a url",
            Duration::from_secs(60)
        )
        .is_err());
    }

    #[test]
    fn sign_counter_rules() {
        assert!(counter_advanced(0, 0));
        assert!(counter_advanced(0, 1));
        assert!(counter_advanced(41, 42));
        assert!(!counter_advanced(42, 42));
        assert!(!counter_advanced(42, 7));
        assert!(!counter_advanced(5, 0));
    }

    #[test]
    fn library_counter_rejection_is_a_clone() {
        let user = User::new("dave", "Dave", UserStatus::Active, UserRole::User);
        assert!(matches!(
            assertion_error(WebauthnError::CredentialPossibleCompromise, &user, "cred-1"),
            CeremonyError::CloneDetected { credential_id } if credential_id == "cred-1"
        ));
        assert!(matches!(
            assertion_error(WebauthnError::InvalidRPIDHash, &user, "cred-1"),
            CeremonyError::AssertionInvalid
        ));
    }

    #[test]
    fn subject_id_accepts_uuid_and_user_handle() {
        let id = Uuid::now_v7();
        assert_eq!(parse_subject_id(&id.to_string()), Some(id));
        assert_eq!(
            parse_subject_id(&Base64UrlUnpadded::encode_string(id.as_bytes())),
            Some(id)
        );
        assert_eq!(
            parse_subject_id(&Base64Url::encode_string(id.as_bytes())),
            Some(id)
        );
        assert_eq!(parse_subject_id("nope"), None);
        assert_eq!(parse_subject_id(""), None);
    }

    #[tokio::test]
    async fn begin_registration_parks_matching_challenge() -> Result<(), CeremonyError> {
        let ceremonies = ceremonies(Duration::from_secs(60));
        let started = ceremonies.begin_registration("superadmin", "Superadmin").await?;

        let session = ceremonies
            .session(&started.subject_id.to_string())
            .await
            .expect("session stored");
        let challenge: Vec<u8> = started.options.public_key.challenge.clone().into();
        assert_eq!(session.challenge, challenge);
        assert_eq!(session.relying_party_id, "localhost");
        assert_eq!(session.user_handle, started.subject_id.as_bytes().to_vec());
        assert!(matches!(session.ceremony, PendingCeremony::Registration(_)));
        Ok(())
    }

    #[tokio::test]
    async fn finish_registration_unknown_subject() {
        let ceremonies = ceremonies(Duration::from_secs(60));
        let credential = dummy_register_credential();

        for subject in [Uuid::now_v7().to_string(), "garbage".to_string(), String::new()] {
            assert!(matches!(
                ceremonies.finish_registration(&subject, &credential).await,
                Err(CeremonyError::SessionNotFound)
            ));
        }
    }

    #[tokio::test]
    async fn bad_attestation_is_generic_and_consumes_session() -> Result<(), CeremonyError> {
        let ceremonies = ceremonies(Duration::from_secs(60));
        let started = ceremonies.begin_registration("superadmin", "Superadmin").await?;
        let subject = started.subject_id.to_string();
        let credential = dummy_register_credential();

        assert!(matches!(
            ceremonies.finish_registration(&subject, &credential).await,
            Err(CeremonyError::AttestationInvalid)
        ));
        assert!(matches!(
            ceremonies.finish_registration(&subject, &credential).await,
            Err(CeremonyError::SessionNotFound)
        ));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn expired_registration_is_session_not_found() -> Result<(), CeremonyError> {
        let ceremonies = ceremonies(Duration::from_secs(60));
        let started = ceremonies.begin_registration("superadmin", "Superadmin").await?;
        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(matches!(
            ceremonies
                .finish_registration(
                    &started.subject_id.to_string(),
                    &dummy_register_credential()
                )
                .await,
            Err(CeremonyError::SessionNotFound)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn begin_login_without_credentials() {
        let ceremonies = ceremonies(Duration::from_secs(60));
        let user = User::new("dave", "Dave", UserStatus::Active, UserRole::User);
        assert!(matches!(
            ceremonies.begin_login(&user, &[]).await,
            Err(CeremonyError::UserOrCredentialNotFound)
        ));
    }

    #[tokio::test]
    async fn passkey_registers_then_logs_in() -> Result<(), CeremonyError> {
        let ceremonies = passkey_ceremonies();
        let mut authenticator = WebauthnAuthenticator::new(SoftPasskey::new(true));
        let (user, credential) = register(&ceremonies, &mut authenticator).await;
        let credentials = vec![credential];

        let login = ceremonies.begin_login(&user, &credentials).await?;
        let session = ceremonies
            .session(&login.session_key)
            .await
            .expect("session stored");
        let challenge: Vec<u8> = login.options.public_key.challenge.clone().into();
        assert_eq!(session.challenge, challenge);
        assert_eq!(session.relying_party_id, "custos.test");
        assert_eq!(
            ceremonies.pending_login_user(&login.session_key).await,
            Some(user.id)
        );

        let assertion = authenticator
            .do_authentication(ceremonies.config().rp_origin().clone(), login.options)
            .expect("soft passkey assertion");
        let verified = ceremonies
            .finish_login(&login.session_key, &assertion, &user, &credentials)
            .await?;
        assert_eq!(verified.credential_id, credentials[0].credential_id);
        assert!(verified.user_verified);

        // the session is gone once used
        assert!(matches!(
            ceremonies
                .finish_login(&login.session_key, &assertion, &user, &credentials)
                .await,
            Err(CeremonyError::SessionNotFound)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn login_session_belongs_to_its_user() -> Result<(), CeremonyError> {
        let ceremonies = passkey_ceremonies();
        let mut authenticator = WebauthnAuthenticator::new(SoftPasskey::new(true));
        let (user, credential) = register(&ceremonies, &mut authenticator).await;
        let credentials = vec![credential];

        let login = ceremonies.begin_login(&user, &credentials).await?;
        let assertion = authenticator
            .do_authentication(ceremonies.config().rp_origin().clone(), login.options)
            .expect("soft passkey assertion");

        let intruder = User::new("mallory", "Mallory", UserStatus::Active, UserRole::User);
        assert!(matches!(
            ceremonies
                .finish_login(&login.session_key, &assertion, &intruder, &credentials)
                .await,
            Err(CeremonyError::SessionNotFound)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn stale_sign_counter_is_a_clone() -> Result<(), CeremonyError> {
        let ceremonies = passkey_ceremonies();
        let mut authenticator = WebauthnAuthenticator::new(SoftPasskey::new(true));
        let (user, mut credential) = register(&ceremonies, &mut authenticator).await;
        // another copy of the key already logged in with a higher counter
        credential.sign_count = 1_000;
        let credentials = vec![credential];

        let login = ceremonies.begin_login(&user, &credentials).await?;
        let assertion = authenticator
            .do_authentication(ceremonies.config().rp_origin().clone(), login.options)
            .expect("soft passkey assertion");

        match ceremonies
            .finish_login(&login.session_key, &assertion, &user, &credentials)
            .await
        {
            Err(CeremonyError::CloneDetected { credential_id }) => assert_eq!(
                credential_id,
                Base64UrlUnpadded::encode_string(&credentials[0].credential_id)
            ),
            _ => panic!("expected CloneDetected"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn registration_session_is_not_a_login() -> Result<(), CeremonyError> {
        let ceremonies = ceremonies(Duration::from_secs(60));
        let started = ceremonies.begin_registration("superadmin", "Superadmin").await?;
        assert_eq!(
            ceremonies
                .pending_login_user(&started.subject_id.to_string())
                .await,
            None
        );
        Ok(())
    }
}
