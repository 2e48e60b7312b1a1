//! Provider adapters
//!
//! Everything that differs between Google and Microsoft lives behind
//! [`ProviderAdapter`]; the rest of the crate only sees [`Provider`],
//! [`TokenGrant`] and [`ProviderError`].

use std::{fmt, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

pub mod google;
pub mod http;
pub mod microsoft;
pub mod oauth;
pub mod registry;
pub mod trait_;

pub use google::GoogleAdapter;
pub use microsoft::MicrosoftAdapter;
pub use registry::{ProviderRegistry, RegistryError};
pub use trait_::ProviderAdapter;

/// Lifetime assumed when a token response omits `expires_in`
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Longest access-token lifetime accepted from a provider
pub const MAX_TOKEN_LIFETIME_SECS: i64 = 86_400;

/// Supported external account providers
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    Microsoft,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Google, Provider::Microsoft];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::Microsoft => "microsoft",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown provider '{0}'")]
pub struct UnknownProvider(pub String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "google" => Ok(Provider::Google),
            "microsoft" | "outlook" => Ok(Provider::Microsoft),
            other => Err(UnknownProvider(other.to_string())),
        }
    }
}

/// Tokens issued by a code exchange or refresh
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Only present when the provider issued (or rotated) a refresh token
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
}

impl TokenGrant {
    /// Absolute expiry of the access token.
    ///
    /// Lifetimes outside `1..=MAX_TOKEN_LIFETIME_SECS` fall back to the default.
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self
            .expires_in
            .filter(|secs| (1..=MAX_TOKEN_LIFETIME_SECS).contains(secs))
            .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        Duration::try_seconds(secs)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .unwrap_or(now)
    }

    /// The issued refresh token, ignoring empty strings
    pub fn new_refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref().filter(|t| !t.is_empty())
    }
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// A file the user selected in the client-side picker
#[derive(Debug, Clone)]
pub struct PickedFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Classified failure of a provider call
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// OAuth error response from the token endpoint (`error` / `error_description`)
    #[error("grant rejected: {code}")]
    InvalidGrant {
        code: String,
        description: Option<String>,
    },

    /// Resource API answered 401 for the presented access token
    #[error("access token rejected: {0}")]
    Unauthorized(String),

    #[error("rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Network failure, timeout or 5xx
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider rejected request with status {status}")]
    Rejected { status: u16, body: String },

    #[error("malformed provider response: {0}")]
    Malformed(String),

    #[error("content exceeds {limit_bytes} bytes")]
    TooLarge {
        limit_bytes: u64,
        actual_bytes: Option<u64>,
    },

    #[error("provider not configured: {0}")]
    Configuration(String),
}

/// Grant errors after which the stored refresh token is unusable for good
pub const UNRECOVERABLE_GRANT_ERRORS: &[&str] = &[
    "invalid_grant",
    "interaction_required",
    "consent_required",
    "unauthorized_client",
    "access_denied",
];

impl ProviderError {
    /// True when a refresh failed in a way only a new user consent can fix
    pub fn is_unrecoverable_grant(&self) -> bool {
        match self {
            ProviderError::InvalidGrant { code, .. } => {
                UNRECOVERABLE_GRANT_ERRORS.contains(&code.as_str())
            }
            _ => false,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ProviderError::RateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }
}
