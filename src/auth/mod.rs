//! Authentication core: passkey ceremonies, auth tokens, CSRF and the
//! one-time bootstrap gate.

pub mod bootstrap;
pub mod ceremony;
pub mod challenge;
pub mod csrf;
pub mod signer;
pub mod token;

pub use bootstrap::{BootstrapError, BootstrapGate};
pub use ceremony::{CeremonyConfig, CeremonyError, PasskeyCeremonies};
pub use challenge::ChallengeCache;
pub use csrf::{CsrfError, CsrfPair, CsrfProtocol, RequestBinding};
pub use signer::TokenSigner;
pub use token::{AuthTokenService, TokenError};

use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};

const RANDOM_TOKEN_BYTES: usize = 32;

/// 32 random bytes, base64url without padding.
#[must_use]
pub fn random_token() -> String {
    let mut bytes = [0u8; RANDOM_TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    Base64UrlUnpadded::encode_string(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_token_shape() {
        let token = random_token();
        assert_eq!(token.len(), 43);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(token, random_token());
    }
}
