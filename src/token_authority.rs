//! # Token Authority
//!
//! Hands out valid access tokens for a (user, provider) pair. Tokens expiring
//! within the skew are refreshed on demand; refreshes for one pair are single
//! flight, and an unrecoverable grant error disconnects the credential and
//! asks the user to reconnect.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::IntegrationError;
use crate::locks::{KeyedLocks, UserProviderKey};
use crate::models::credential;
use crate::notify::{Notice, NotificationChannel, NotificationSink};
use crate::providers::{Provider, ProviderError, ProviderRegistry};
use crate::repositories::{CredentialRepository, StoredTokens};

/// A usable access token
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

pub struct TokenAuthority {
    credentials: CredentialRepository,
    registry: Arc<ProviderRegistry>,
    notifier: Arc<dyn NotificationSink>,
    locks: Arc<KeyedLocks<UserProviderKey>>,
    skew: Duration,
}

impl TokenAuthority {
    pub fn new(
        credentials: CredentialRepository,
        registry: Arc<ProviderRegistry>,
        notifier: Arc<dyn NotificationSink>,
        locks: Arc<KeyedLocks<UserProviderKey>>,
        skew: Duration,
    ) -> Self {
        Self {
            credentials,
            registry,
            notifier,
            locks,
            skew,
        }
    }

    /// Return the cached access token, refreshing it first when it expires
    /// within the skew. Never calls the provider for a disconnected record.
    #[instrument(skip_all, fields(user_id = %user_id, provider = %provider))]
    pub async fn get_valid_token(
        &self,
        user_id: &Uuid,
        provider: Provider,
    ) -> Result<AccessToken, IntegrationError> {
        let (_, tokens) = self.load_connected(user_id, provider).await?;
        if self.is_fresh(&tokens, Utc::now()) {
            return Ok(cached(tokens));
        }

        let _guard = self.locks.lock(&(*user_id, provider)).await;

        // Another caller may have refreshed while we waited
        let (record, tokens) = self.load_connected(user_id, provider).await?;
        if self.is_fresh(&tokens, Utc::now()) {
            debug!("Reusing token refreshed by a concurrent caller");
            return Ok(cached(tokens));
        }

        self.refresh_locked(user_id, provider, record, tokens).await
    }

    /// Refresh after the provider rejected `rejected_token` with a 401, unless
    /// another caller already replaced it.
    #[instrument(skip_all, fields(user_id = %user_id, provider = %provider))]
    pub async fn force_refresh(
        &self,
        user_id: &Uuid,
        provider: Provider,
        rejected_token: &str,
    ) -> Result<AccessToken, IntegrationError> {
        let _guard = self.locks.lock(&(*user_id, provider)).await;

        let (record, tokens) = self.load_connected(user_id, provider).await?;
        if tokens.access_token != rejected_token {
            debug!("Rejected token already replaced");
            return Ok(cached(tokens));
        }

        self.refresh_locked(user_id, provider, record, tokens).await
    }

    fn is_fresh(&self, tokens: &StoredTokens, now: DateTime<Utc>) -> bool {
        tokens
            .expires_at
            .is_some_and(|expires_at| now + self.skew < expires_at)
    }

    async fn load_connected(
        &self,
        user_id: &Uuid,
        provider: Provider,
    ) -> Result<(credential::Model, StoredTokens), IntegrationError> {
        let record = self
            .credentials
            .find(user_id, provider)
            .await?
            .ok_or(IntegrationError::NotConnected { provider })?;
        let tokens = self
            .credentials
            .decrypt_tokens(&record)?
            .ok_or(IntegrationError::NotConnected { provider })?;
        Ok((record, tokens))
    }

    /// Caller holds the credential lock for (user, provider).
    async fn refresh_locked(
        &self,
        user_id: &Uuid,
        provider: Provider,
        record: credential::Model,
        tokens: StoredTokens,
    ) -> Result<AccessToken, IntegrationError> {
        let adapter = self
            .registry
            .get(provider)
            .map_err(|e| IntegrationError::Misconfigured {
                provider,
                message: e.to_string(),
            })?;

        let started = Instant::now();
        let outcome = adapter.refresh(&tokens.refresh_token).await;
        histogram!("integrations_token_refresh_latency_ms", "provider" => provider.as_str())
            .record(started.elapsed().as_secs_f64() * 1_000.0);

        match outcome {
            Ok(grant) => {
                let expires_at = grant.expires_at(Utc::now());
                let stored = self
                    .credentials
                    .store_refreshed(
                        &record,
                        provider,
                        &grant.access_token,
                        grant.new_refresh_token(),
                        expires_at,
                    )
                    .await?;

                if stored.is_none() {
                    return self
                        .resolve_lost_write(user_id, provider, &tokens.access_token)
                        .await;
                }

                counter!(
                    "integrations_token_refresh_total",
                    "provider" => provider.as_str(),
                    "outcome" => "success"
                )
                .increment(1);
                info!(
                    rotated_refresh_token = grant.new_refresh_token().is_some(),
                    expires_at = %expires_at,
                    "Refreshed access token"
                );
                Ok(AccessToken {
                    token: grant.access_token,
                    expires_at: Some(expires_at),
                })
            }
            Err(error) if error.is_unrecoverable_grant() => {
                self.disconnect_after_revocation(user_id, provider, &error)
                    .await?;
                Err(IntegrationError::AuthExpired { provider })
            }
            Err(ProviderError::Configuration(message)) => {
                Err(IntegrationError::Misconfigured { provider, message })
            }
            Err(error) => {
                counter!(
                    "integrations_token_refresh_total",
                    "provider" => provider.as_str(),
                    "outcome" => "transient"
                )
                .increment(1);
                warn!(error = %error, "Transient token refresh failure");
                Err(IntegrationError::RefreshTransient {
                    provider,
                    retry_after_secs: error.retry_after_secs(),
                    message: error.to_string(),
                })
            }
        }
    }

    /// The CAS lost against a writer in another process. Reuse its token if
    /// it replaced ours.
    async fn resolve_lost_write(
        &self,
        user_id: &Uuid,
        provider: Provider,
        previous_access_token: &str,
    ) -> Result<AccessToken, IntegrationError> {
        counter!(
            "integrations_token_refresh_total",
            "provider" => provider.as_str(),
            "outcome" => "conflict"
        )
        .increment(1);

        let (_, tokens) = self.load_connected(user_id, provider).await?;
        if tokens.access_token != previous_access_token {
            debug!("Lost refresh write; reusing the winner's token");
            return Ok(cached(tokens));
        }

        Err(IntegrationError::ConflictOnWrite {
            resource: format!("credential {}/{}", user_id, provider),
        })
    }

    async fn disconnect_after_revocation(
        &self,
        user_id: &Uuid,
        provider: Provider,
        error: &ProviderError,
    ) -> Result<(), IntegrationError> {
        counter!(
            "integrations_token_refresh_total",
            "provider" => provider.as_str(),
            "outcome" => "revoked"
        )
        .increment(1);
        warn!(error = %error, "Refresh grant revoked; disconnecting credential");

        self.credentials
            .mark_disconnected(user_id, provider)
            .await?;

        let notice = Notice::ReconnectRequired {
            provider,
            reason: error.to_string(),
        };
        if let Err(e) = self
            .notifier
            .deliver(*user_id, NotificationChannel::InApp, notice)
            .await
        {
            warn!(error = %e, "Failed to deliver reconnect notice");
        }
        Ok(())
    }
}

fn cached(tokens: StoredTokens) -> AccessToken {
    AccessToken {
        token: tokens.access_token,
        expires_at: tokens.expires_at,
    }
}
