//! Configuration loading for the integrations service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `INTEGRATIONS_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "INTEGRATIONS_";
const REDACTED: &str = "[REDACTED]";

/// Application configuration derived from `INTEGRATIONS_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_client_secret: Option<String>,
    #[serde(default = "default_google_oauth_base")]
    pub google_oauth_base: String,
    #[serde(default = "default_google_api_base")]
    pub google_api_base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub microsoft_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub microsoft_client_secret: Option<String>,
    #[serde(default = "default_microsoft_tenant")]
    pub microsoft_tenant: String,
    #[serde(default = "default_microsoft_login_base")]
    pub microsoft_login_base: String,
    #[serde(default = "default_microsoft_graph_base")]
    pub microsoft_graph_base: String,
    #[serde(default)]
    pub integration: IntegrationConfig,
}

/// Tuning knobs for token handling, provider calls and reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct IntegrationConfig {
    /// Refresh when the access token expires within this many seconds (default: 300)
    #[serde(default = "default_token_skew_seconds")]
    pub token_skew_seconds: u64,

    /// Timeout for code exchange and refresh calls (default: 15)
    #[serde(default = "default_token_timeout_seconds")]
    pub token_timeout_seconds: u64,

    /// Timeout for listing, mutation and file calls (default: 30)
    #[serde(default = "default_list_timeout_seconds")]
    pub list_timeout_seconds: u64,

    /// Length of the forward reconciliation window in days (default: 30)
    #[serde(default = "default_sync_window_days")]
    pub sync_window_days: u32,

    /// Largest picked file that will be fetched, in bytes (default: 25 MiB)
    #[serde(default = "default_picker_max_bytes")]
    pub picker_max_bytes: u64,
}

impl IntegrationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token_skew_seconds > 3600 {
            return Err(ConfigError::InvalidTokenSkew {
                value: self.token_skew_seconds,
            });
        }

        if self.token_timeout_seconds == 0 || self.token_timeout_seconds > 120 {
            return Err(ConfigError::InvalidTimeout {
                field: "TOKEN_TIMEOUT_SECONDS".to_string(),
                value: self.token_timeout_seconds,
            });
        }
        if self.list_timeout_seconds == 0 || self.list_timeout_seconds > 300 {
            return Err(ConfigError::InvalidTimeout {
                field: "LIST_TIMEOUT_SECONDS".to_string(),
                value: self.list_timeout_seconds,
            });
        }

        if self.sync_window_days == 0 || self.sync_window_days > 366 {
            return Err(ConfigError::InvalidSyncWindow {
                value: self.sync_window_days,
            });
        }

        if self.picker_max_bytes == 0 {
            return Err(ConfigError::InvalidPickerMaxBytes);
        }

        Ok(())
    }

    pub fn token_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_skew_seconds as i64)
    }

    pub fn token_timeout(&self) -> Duration {
        Duration::from_secs(self.token_timeout_seconds)
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.list_timeout_seconds)
    }
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            token_skew_seconds: default_token_skew_seconds(),
            token_timeout_seconds: default_token_timeout_seconds(),
            list_timeout_seconds: default_list_timeout_seconds(),
            sync_window_days: default_sync_window_days(),
            picker_max_bytes: default_picker_max_bytes(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            operator_tokens: Vec::new(),
            crypto_key: None,
            google_client_id: None,
            google_client_secret: None,
            google_oauth_base: default_google_oauth_base(),
            google_api_base: default_google_api_base(),
            microsoft_client_id: None,
            microsoft_client_secret: None,
            microsoft_tenant: default_microsoft_tenant(),
            microsoft_login_base: default_microsoft_login_base(),
            microsoft_graph_base: default_microsoft_graph_base(),
            integration: IntegrationConfig::default(),
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.operator_tokens.is_empty() {
            config.operator_tokens = vec![REDACTED.to_string()];
        }
        if config.crypto_key.is_some() {
            config.crypto_key = Some(REDACTED.as_bytes().to_vec());
        }
        for secret in [
            &mut config.google_client_id,
            &mut config.google_client_secret,
            &mut config.microsoft_client_id,
            &mut config.microsoft_client_secret,
        ] {
            if secret.is_some() {
                *secret = Some(REDACTED.to_string());
            }
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.crypto_key {
            Some(ref key) if key.len() != 32 => {
                return Err(ConfigError::InvalidCryptoKeyLength { length: key.len() });
            }
            Some(_) => {}
            None => return Err(ConfigError::MissingCryptoKey),
        }

        if self.operator_tokens.is_empty() {
            return Err(ConfigError::MissingOperatorTokens);
        }

        // Provider credentials are only mandatory outside local/test
        if !self.is_local_profile() {
            if self.google_client_id.is_none() || self.google_client_secret.is_none() {
                return Err(ConfigError::MissingProviderCredentials {
                    provider: "google".to_string(),
                });
            }
            if self.microsoft_client_id.is_none() || self.microsoft_client_secret.is_none() {
                return Err(ConfigError::MissingProviderCredentials {
                    provider: "microsoft".to_string(),
                });
            }
        }

        self.integration.validate()
    }

    pub fn is_local_profile(&self) -> bool {
        matches!(self.profile.as_str(), "local" | "test")
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://integrations.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_google_oauth_base() -> String {
    "https://oauth2.googleapis.com".to_string()
}

fn default_google_api_base() -> String {
    "https://www.googleapis.com".to_string()
}

fn default_microsoft_tenant() -> String {
    "common".to_string()
}

fn default_microsoft_login_base() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_microsoft_graph_base() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_token_skew_seconds() -> u64 {
    300
}

fn default_token_timeout_seconds() -> u64 {
    15
}

fn default_list_timeout_seconds() -> u64 {
    30
}

fn default_sync_window_days() -> u32 {
    30
}

fn default_picker_max_bytes() -> u64 {
    25 * 1024 * 1024
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error(
        "no operator tokens configured; set INTEGRATIONS_OPERATOR_TOKEN or INTEGRATIONS_OPERATOR_TOKENS"
    )]
    MissingOperatorTokens,
    #[error("crypto key is missing; set INTEGRATIONS_CRYPTO_KEY environment variable")]
    MissingCryptoKey,
    #[error("crypto key is invalid base64: {error}")]
    InvalidCryptoKeyBase64 { error: String },
    #[error("crypto key must decode to exactly 32 bytes, got {length} bytes")]
    InvalidCryptoKeyLength { length: usize },
    #[error("{provider} client id and secret are required outside local/test profiles")]
    MissingProviderCredentials { provider: String },
    #[error("invalid value '{value}' for {field}")]
    InvalidNumber { field: String, value: String },
    #[error("token skew must not exceed 3600 seconds, got {value}")]
    InvalidTokenSkew { value: u64 },
    #[error("{field} is out of bounds, got {value}")]
    InvalidTimeout { field: String, value: u64 },
    #[error("sync window must be between 1 and 366 days, got {value}")]
    InvalidSyncWindow { value: u32 },
    #[error("picker max bytes must be positive")]
    InvalidPickerMaxBytes,
}

/// Loads configuration using layered `.env` files and `INTEGRATIONS_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_non_empty(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let api_bind_addr =
            take_non_empty(&mut layered, "API_BIND_ADDR").unwrap_or_else(default_api_bind_addr);
        let log_level = take_non_empty(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format =
            take_non_empty(&mut layered, "LOG_FORMAT").unwrap_or_else(default_log_format);
        let database_url =
            take_non_empty(&mut layered, "DATABASE_URL").unwrap_or_else(default_database_url);
        let db_max_connections = take_parsed(&mut layered, "DB_MAX_CONNECTIONS")?
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = take_parsed(&mut layered, "DB_ACQUIRE_TIMEOUT_MS")?
            .unwrap_or_else(default_db_acquire_timeout_ms);

        // Comma-separated list wins over the single-token form
        let operator_tokens = if let Some(tokens) = layered.remove("OPERATOR_TOKENS") {
            tokens
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        } else if let Some(token) = take_non_empty(&mut layered, "OPERATOR_TOKEN") {
            vec![token]
        } else {
            Vec::new()
        };

        let crypto_key = match take_non_empty(&mut layered, "CRYPTO_KEY") {
            Some(key_str) => {
                use base64::{Engine as _, engine::general_purpose};
                Some(general_purpose::STANDARD.decode(key_str.trim()).map_err(|e| {
                    ConfigError::InvalidCryptoKeyBase64 {
                        error: e.to_string(),
                    }
                })?)
            }
            None => None,
        };

        let integration = IntegrationConfig {
            token_skew_seconds: take_parsed(&mut layered, "TOKEN_SKEW_SECONDS")?
                .unwrap_or_else(default_token_skew_seconds),
            token_timeout_seconds: take_parsed(&mut layered, "TOKEN_TIMEOUT_SECONDS")?
                .unwrap_or_else(default_token_timeout_seconds),
            list_timeout_seconds: take_parsed(&mut layered, "LIST_TIMEOUT_SECONDS")?
                .unwrap_or_else(default_list_timeout_seconds),
            sync_window_days: take_parsed(&mut layered, "SYNC_WINDOW_DAYS")?
                .unwrap_or_else(default_sync_window_days),
            picker_max_bytes: take_parsed(&mut layered, "PICKER_MAX_BYTES")?
                .unwrap_or_else(default_picker_max_bytes),
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            operator_tokens,
            crypto_key,
            google_client_id: take_non_empty(&mut layered, "GOOGLE_CLIENT_ID"),
            google_client_secret: take_non_empty(&mut layered, "GOOGLE_CLIENT_SECRET"),
            google_oauth_base: take_non_empty(&mut layered, "GOOGLE_OAUTH_BASE")
                .unwrap_or_else(default_google_oauth_base),
            google_api_base: take_non_empty(&mut layered, "GOOGLE_API_BASE")
                .unwrap_or_else(default_google_api_base),
            microsoft_client_id: take_non_empty(&mut layered, "MICROSOFT_CLIENT_ID"),
            microsoft_client_secret: take_non_empty(&mut layered, "MICROSOFT_CLIENT_SECRET"),
            microsoft_tenant: take_non_empty(&mut layered, "MICROSOFT_TENANT")
                .unwrap_or_else(default_microsoft_tenant),
            microsoft_login_base: take_non_empty(&mut layered, "MICROSOFT_LOGIN_BASE")
                .unwrap_or_else(default_microsoft_login_base),
            microsoft_graph_base: take_non_empty(&mut layered, "MICROSOFT_GRAPH_BASE")
                .unwrap_or_else(default_microsoft_graph_base),
            integration,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_non_empty(values: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    values
        .remove(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn take_parsed<T: std::str::FromStr>(
    values: &mut BTreeMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match take_non_empty(values, key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber {
                field: key.to_string(),
                value: raw,
            }),
        None => Ok(None),
    }
}
