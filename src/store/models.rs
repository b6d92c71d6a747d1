use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use utoipa::ToSchema;
use uuid::Uuid;
use webauthn_rs::prelude::Passkey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Inactive,
    Suspended,
    Pending,
}

impl UserStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Suspended => "suspended",
            Self::Pending => "pending",
        }
    }
}

impl FromStr for UserStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "suspended" => Ok(Self::Suspended),
            "pending" => Ok(Self::Pending),
            other => Err(anyhow!("unknown user status: {other}")),
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    User,
    Admin,
    Superadmin,
}

impl UserRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
            Self::Superadmin => "superadmin",
        }
    }
}

impl FromStr for UserRole {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            "superadmin" => Ok(Self::Superadmin),
            other => Err(anyhow!("unknown user role: {other}")),
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub status: UserStatus,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
}

impl User {
    #[must_use]
    pub fn new(username: &str, display_name: &str, status: UserStatus, role: UserRole) -> Self {
        Self {
            id: Uuid::now_v7(),
            username: username.to_string(),
            display_name: display_name.to_string(),
            status,
            role,
            created_at: Utc::now(),
        }
    }
}

/// A registered passkey plus the counter used for clone detection.
#[derive(Debug, Clone)]
pub struct StoredCredential {
    pub credential_id: Vec<u8>,
    pub user_id: Uuid,
    pub passkey: Passkey,
    pub sign_count: u32,
    pub transports: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct UserWithCredentials {
    pub user: User,
    pub credentials: Vec<StoredCredential>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl AuthToken {
    /// Valid strictly before `expires_at`.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Keys of the bootstrap rows in the `config` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    InstanceReady,
    InitCodeHash,
    InitAttempts,
}

impl ConfigKey {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InstanceReady => "instanceReady",
            Self::InitCodeHash => "initSACode",
            Self::InitAttempts => "initAttempts",
        }
    }

    /// Values seeded on a fresh database.
    #[must_use]
    pub fn defaults() -> [(Self, &'static str); 3] {
        [
            (Self::InstanceReady, "false"),
            (Self::InitCodeHash, ""),
            (Self::InitAttempts, "0"),
        ]
    }
}

/// Serialize a passkey for storage.
///
/// # Errors
/// Returns error if serialization fails.
pub fn serialize_passkey(passkey: &Passkey) -> Result<Vec<u8>> {
    serde_json::to_vec(passkey).context("Failed to serialize passkey")
}

/// Deserialize a stored passkey.
///
/// # Errors
/// Returns error if deserialization fails.
pub fn deserialize_passkey(data: &[u8]) -> Result<Passkey> {
    serde_json::from_slice(data).context("Failed to deserialize passkey")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            UserStatus::Active,
            UserStatus::Inactive,
            UserStatus::Suspended,
            UserStatus::Pending,
        ] {
            assert_eq!(status.as_str().parse::<UserStatus>().ok(), Some(status));
        }
        assert!("banned".parse::<UserStatus>().is_err());
    }

    #[test]
    fn role_parsing_is_case_sensitive() {
        assert_eq!("superadmin".parse::<UserRole>().ok(), Some(UserRole::Superadmin));
        assert!("SuperAdmin".parse::<UserRole>().is_err());
    }

    #[test]
    fn token_expiry_is_exclusive() {
        let now = Utc::now();
        let token = AuthToken {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            expires_at: now,
        };
        assert!(token.is_valid_at(now - Duration::seconds(1)));
        assert!(!token.is_valid_at(now));
    }

    #[test]
    fn config_keys_match_stored_names() {
        assert_eq!(ConfigKey::InstanceReady.as_str(), "instanceReady");
        assert_eq!(ConfigKey::InitCodeHash.as_str(), "initSACode");
        assert_eq!(ConfigKey::InitAttempts.as_str(), "initAttempts");
    }

    #[test]
    fn garbage_passkey_is_rejected() {
        assert!(deserialize_passkey(b"{}").is_err());
    }
}
