//! # Integration Gateway
//!
//! Boundary of the integration layer: connect and disconnect, status,
//! on-demand sync, the mirrored event view, event mutations and picker
//! access. Handlers translate its [`IntegrationError`]s into HTTP responses.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::calendar::{
    EventDraft, EventMutationProxy, EventPatch, ITEM_TYPE_CALENDAR, ReconciliationEngine,
    ResourceFetcher, SyncResult,
};
use crate::config::IntegrationConfig;
use crate::crypto::CryptoKey;
use crate::error::IntegrationError;
use crate::locks::KeyedLocks;
use crate::models::mirrored_item;
use crate::notify::NotificationSink;
use crate::providers::{PickedFile, Provider, ProviderRegistry};
use crate::repositories::{
    ConnectTokens, CredentialRepository, MirrorRepository, UserRepository,
};
use crate::token_authority::TokenAuthority;

/// Connection state of one provider for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub connected: bool,
    pub email: Option<String>,
    pub last_synced: Option<DateTime<Utc>>,
    /// Expiry of the current access token
    pub valid_upto: Option<DateTime<Utc>>,
}

/// Authorization code handed over by the client after the consent screen
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub code: String,
    pub redirect_uri: String,
    pub code_verifier: Option<String>,
}

/// Access token for a client-side file picker
#[derive(Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PickerToken {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for PickerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PickerToken")
            .field("access_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

pub struct IntegrationGateway {
    users: UserRepository,
    credentials: CredentialRepository,
    mirror: MirrorRepository,
    registry: Arc<ProviderRegistry>,
    credential_locks: Arc<KeyedLocks<(Uuid, Provider)>>,
    authority: Arc<TokenAuthority>,
    fetcher: Arc<ResourceFetcher>,
    engine: ReconciliationEngine,
    proxy: EventMutationProxy,
    picker_max_bytes: u64,
}

impl IntegrationGateway {
    pub fn new(
        db: Arc<DatabaseConnection>,
        crypto_key: CryptoKey,
        registry: Arc<ProviderRegistry>,
        notifier: Arc<dyn NotificationSink>,
        settings: &IntegrationConfig,
    ) -> Self {
        let users = UserRepository::new(Arc::clone(&db));
        let credentials = CredentialRepository::new(Arc::clone(&db), crypto_key);
        let mirror = MirrorRepository::new(db);
        let credential_locks = Arc::new(KeyedLocks::new());
        let mirror_locks = Arc::new(KeyedLocks::new());

        let authority = Arc::new(TokenAuthority::new(
            credentials.clone(),
            Arc::clone(&registry),
            notifier,
            Arc::clone(&credential_locks),
            settings.token_skew(),
        ));
        let fetcher = Arc::new(ResourceFetcher::new(
            Arc::clone(&authority),
            Arc::clone(&registry),
        ));
        let engine = ReconciliationEngine::new(
            credentials.clone(),
            mirror.clone(),
            Arc::clone(&fetcher),
            Arc::clone(&mirror_locks),
            settings.sync_window_days,
        );
        let proxy = EventMutationProxy::new(Arc::clone(&fetcher), mirror.clone(), mirror_locks);

        Self {
            users,
            credentials,
            mirror,
            registry,
            credential_locks,
            authority,
            fetcher,
            engine,
            proxy,
            picker_max_bytes: settings.picker_max_bytes,
        }
    }

    pub fn token_authority(&self) -> &Arc<TokenAuthority> {
        &self.authority
    }

    /// Status of every supported provider; providers without a record are
    /// reported as disconnected.
    pub async fn status(
        &self,
        user_id: &Uuid,
    ) -> Result<BTreeMap<Provider, ProviderStatus>, IntegrationError> {
        let mut statuses: BTreeMap<Provider, ProviderStatus> = Provider::ALL
            .iter()
            .map(|provider| {
                (
                    *provider,
                    ProviderStatus {
                        connected: false,
                        email: None,
                        last_synced: None,
                        valid_upto: None,
                    },
                )
            })
            .collect();

        for record in self.credentials.list_for_user(user_id).await? {
            let Ok(provider) = record.provider.parse::<Provider>() else {
                warn!(provider = %record.provider, "Skipping credential of unknown provider");
                continue;
            };
            statuses.insert(
                provider,
                ProviderStatus {
                    connected: record.connected,
                    email: record.account_email,
                    last_synced: record.last_synced_at.map(|at| at.with_timezone(&Utc)),
                    valid_upto: record.expires_at.map(|at| at.with_timezone(&Utc)),
                },
            );
        }

        Ok(statuses)
    }

    /// Exchange an authorization code and store the resulting credential.
    /// Returns the account email when the provider reported one.
    #[instrument(skip_all, fields(user_id = %user_id, provider = %provider))]
    pub async fn connect(
        &self,
        user_id: &Uuid,
        provider: Provider,
        request: ConnectRequest,
    ) -> Result<Option<String>, IntegrationError> {
        if request.code.trim().is_empty() {
            return Err(IntegrationError::Validation(
                "authorization code must not be empty".to_string(),
            ));
        }
        if request.redirect_uri.trim().is_empty() {
            return Err(IntegrationError::Validation(
                "redirect uri must not be empty".to_string(),
            ));
        }
        if !self.users.exists(user_id).await? {
            return Err(IntegrationError::UserNotFound(*user_id));
        }

        let adapter = self
            .registry
            .get(provider)
            .map_err(|e| IntegrationError::Misconfigured {
                provider,
                message: e.to_string(),
            })?;
        let grant = adapter
            .exchange_code(
                request.code.trim(),
                &request.redirect_uri,
                request.code_verifier.as_deref(),
            )
            .await
            .map_err(|e| IntegrationError::from_provider(provider, e))?;

        let email = match adapter.fetch_account_email(&grant.access_token).await {
            Ok(email) => email,
            Err(error) => {
                warn!(error = %error, "Account email lookup failed; continuing without it");
                None
            }
        };

        let _guard = self.credential_locks.lock(&(*user_id, provider)).await;
        if grant.new_refresh_token().is_none() {
            let has_stored_refresh = self
                .credentials
                .find(user_id, provider)
                .await?
                .is_some_and(|record| record.refresh_token_ciphertext.is_some());
            if !has_stored_refresh {
                return Err(IntegrationError::Validation(format!(
                    "{} issued no refresh token; grant offline access and retry",
                    provider
                )));
            }
        }

        let record = self
            .credentials
            .save_connected(
                user_id,
                provider,
                ConnectTokens {
                    access_token: &grant.access_token,
                    refresh_token: grant.new_refresh_token(),
                    expires_at: grant.expires_at(Utc::now()),
                    account_email: email,
                },
            )
            .await?;

        info!("Connected provider account");
        Ok(record.account_email)
    }

    /// Clear the stored tokens. Mirrored items stay in place.
    #[instrument(skip_all, fields(user_id = %user_id, provider = %provider))]
    pub async fn disconnect(
        &self,
        user_id: &Uuid,
        provider: Provider,
    ) -> Result<(), IntegrationError> {
        let _guard = self.credential_locks.lock(&(*user_id, provider)).await;
        let existed = self.credentials.mark_disconnected(user_id, provider).await?;
        info!(existed, "Disconnected provider account");
        Ok(())
    }

    pub async fn sync(
        &self,
        user_id: &Uuid,
        provider: Provider,
    ) -> Result<SyncResult, IntegrationError> {
        self.engine.sync(user_id, provider).await
    }

    /// Active mirrored items, earliest first, limited to providers that are
    /// connected right now.
    pub async fn events(
        &self,
        user_id: &Uuid,
        provider: Option<Provider>,
        item_type: &str,
    ) -> Result<Vec<mirrored_item::Model>, IntegrationError> {
        if item_type != ITEM_TYPE_CALENDAR {
            return Err(IntegrationError::Validation(format!(
                "unsupported item type '{}'",
                item_type
            )));
        }

        let connected: Vec<Provider> = self
            .credentials
            .list_for_user(user_id)
            .await?
            .into_iter()
            .filter(|record| record.connected)
            .filter_map(|record| record.provider.parse::<Provider>().ok())
            .filter(|p| provider.is_none_or(|wanted| wanted == *p))
            .collect();

        Ok(self
            .mirror
            .list_active(user_id, &connected, item_type)
            .await?)
    }

    pub async fn create_event(
        &self,
        user_id: &Uuid,
        provider: Provider,
        draft: EventDraft,
    ) -> Result<mirrored_item::Model, IntegrationError> {
        self.proxy.create(user_id, provider, draft).await
    }

    pub async fn update_event(
        &self,
        user_id: &Uuid,
        provider: Provider,
        external_id: &str,
        patch: EventPatch,
    ) -> Result<mirrored_item::Model, IntegrationError> {
        self.proxy
            .update(user_id, provider, external_id, patch)
            .await
    }

    pub async fn delete_event(
        &self,
        user_id: &Uuid,
        provider: Provider,
        external_id: &str,
    ) -> Result<(), IntegrationError> {
        self.proxy.delete(user_id, provider, external_id).await
    }

    pub async fn picker_token(
        &self,
        user_id: &Uuid,
        provider: Provider,
    ) -> Result<PickerToken, IntegrationError> {
        let token = self.authority.get_valid_token(user_id, provider).await?;
        Ok(PickerToken {
            access_token: token.token,
            expires_at: token.expires_at,
        })
    }

    /// Download a file the user picked, refusing anything above the
    /// configured size cap.
    #[instrument(skip_all, fields(user_id = %user_id, provider = %provider))]
    pub async fn picked_file(
        &self,
        user_id: &Uuid,
        provider: Provider,
        file_id: &str,
    ) -> Result<PickedFile, IntegrationError> {
        if file_id.trim().is_empty() {
            return Err(IntegrationError::Validation(
                "file id must not be empty".to_string(),
            ));
        }
        let max_bytes = self.picker_max_bytes;
        self.fetcher
            .authorized_call(user_id, provider, |adapter, token| async move {
                adapter.fetch_file(&token, file_id, max_bytes).await
            })
            .await
    }
}
