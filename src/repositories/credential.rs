//! Credential repository
//!
//! The only path to the `credentials` table. Tokens are encrypted on the way
//! in and decrypted on the way out; every token write bumps `version`, and
//! refresh writes are compare-and-swap on it.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::crypto::{CryptoKey, decrypt_token, encrypt_token};
use crate::models::credential::{self, Entity as Credential};
use crate::providers::Provider;

/// Decrypted token bundle of a connected credential
#[derive(Clone)]
pub struct StoredTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for StoredTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredTokens")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Tokens and account details written by a successful code exchange
pub struct ConnectTokens<'a> {
    pub access_token: &'a str,
    /// `None` keeps the refresh token already on file
    pub refresh_token: Option<&'a str>,
    pub expires_at: DateTime<Utc>,
    pub account_email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CredentialRepository {
    db: Arc<DatabaseConnection>,
    crypto_key: CryptoKey,
}

impl CredentialRepository {
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey) -> Self {
        Self { db, crypto_key }
    }

    pub async fn find(&self, user_id: &Uuid, provider: Provider) -> Result<Option<credential::Model>> {
        Ok(Credential::find()
            .filter(credential::Column::UserId.eq(*user_id))
            .filter(credential::Column::Provider.eq(provider.as_str()))
            .one(&*self.db)
            .await?)
    }

    pub async fn list_for_user(&self, user_id: &Uuid) -> Result<Vec<credential::Model>> {
        Ok(Credential::find()
            .filter(credential::Column::UserId.eq(*user_id))
            .order_by_asc(credential::Column::Provider)
            .all(&*self.db)
            .await?)
    }

    /// Decrypt the token bundle. Returns `None` unless the record is connected
    /// and carries both ciphertexts.
    pub fn decrypt_tokens(&self, record: &credential::Model) -> Result<Option<StoredTokens>> {
        if !record.connected {
            return Ok(None);
        }
        let (Some(access), Some(refresh)) = (
            record.access_token_ciphertext.as_deref(),
            record.refresh_token_ciphertext.as_deref(),
        ) else {
            return Ok(None);
        };

        let decrypt = |ciphertext: &[u8]| {
            decrypt_token(&self.crypto_key, &record.user_id, &record.provider, ciphertext).map_err(
                |e| {
                    tracing::error!(
                        user_id = %record.user_id,
                        provider = %record.provider,
                        "Token decryption failed"
                    );
                    anyhow!("token decryption failed: {}", e)
                },
            )
        };

        Ok(Some(StoredTokens {
            access_token: decrypt(access)?,
            refresh_token: decrypt(refresh)?,
            expires_at: record.expires_at.map(|at| at.with_timezone(&Utc)),
        }))
    }

    fn encrypt(&self, user_id: &Uuid, provider: Provider, token: &str) -> Result<Vec<u8>> {
        encrypt_token(&self.crypto_key, user_id, provider.as_str(), token)
            .map_err(|e| anyhow!("token encryption failed: {}", e))
    }

    /// Create or overwrite the record as connected. When the exchange issued
    /// no refresh token the stored ciphertext is kept; with none on file the
    /// write fails.
    pub async fn save_connected(
        &self,
        user_id: &Uuid,
        provider: Provider,
        tokens: ConnectTokens<'_>,
    ) -> Result<credential::Model> {
        let now = Utc::now();
        let existing = self.find(user_id, provider).await?;
        let access_ciphertext = self.encrypt(user_id, provider, tokens.access_token)?;

        let refresh_ciphertext = match tokens.refresh_token.filter(|t| !t.is_empty()) {
            Some(token) => self.encrypt(user_id, provider, token)?,
            None => existing
                .as_ref()
                .and_then(|record| record.refresh_token_ciphertext.clone())
                .ok_or_else(|| anyhow!("no refresh token issued and none on file"))?,
        };

        match existing {
            Some(record) => {
                let version = record.version;
                let mut active: credential::ActiveModel = record.into();
                active.connected = Set(true);
                active.access_token_ciphertext = Set(Some(access_ciphertext));
                active.refresh_token_ciphertext = Set(Some(refresh_ciphertext));
                active.expires_at = Set(Some(tokens.expires_at.into()));
                if tokens.account_email.is_some() {
                    active.account_email = Set(tokens.account_email);
                }
                active.version = Set(version + 1);
                active.updated_at = Set(now.into());
                Ok(active.update(&*self.db).await?)
            }
            None => {
                let active = credential::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    user_id: Set(*user_id),
                    provider: Set(provider.as_str().to_string()),
                    connected: Set(true),
                    access_token_ciphertext: Set(Some(access_ciphertext)),
                    refresh_token_ciphertext: Set(Some(refresh_ciphertext)),
                    expires_at: Set(Some(tokens.expires_at.into())),
                    account_email: Set(tokens.account_email),
                    last_synced_at: Set(None),
                    version: Set(1),
                    created_at: Set(now.into()),
                    updated_at: Set(now.into()),
                };
                Ok(active.insert(&*self.db).await?)
            }
        }
    }

    /// Persist refreshed tokens if `current.version` is still the stored one.
    /// Returns `None` when another writer got there first.
    pub async fn store_refreshed(
        &self,
        current: &credential::Model,
        provider: Provider,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<credential::Model>> {
        let mut changes = credential::ActiveModel {
            access_token_ciphertext: Set(Some(self.encrypt(
                &current.user_id,
                provider,
                access_token,
            )?)),
            expires_at: Set(Some(expires_at.into())),
            version: Set(current.version + 1),
            updated_at: Set(Utc::now().into()),
            ..Default::default()
        };
        if let Some(token) = refresh_token.filter(|t| !t.is_empty()) {
            changes.refresh_token_ciphertext =
                Set(Some(self.encrypt(&current.user_id, provider, token)?));
        }

        let result = Credential::update_many()
            .set(changes)
            .filter(credential::Column::Id.eq(current.id))
            .filter(credential::Column::Version.eq(current.version))
            .filter(credential::Column::Connected.eq(true))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return Ok(None);
        }
        Ok(Credential::find_by_id(current.id).one(&*self.db).await?)
    }

    /// Flip to disconnected and clear tokens and expiry. Email and
    /// `last_synced_at` are kept. Returns false when no record exists.
    pub async fn mark_disconnected(&self, user_id: &Uuid, provider: Provider) -> Result<bool> {
        let result = Credential::update_many()
            .col_expr(credential::Column::Connected, Expr::value(false))
            .col_expr(
                credential::Column::AccessTokenCiphertext,
                Expr::value(Option::<Vec<u8>>::None),
            )
            .col_expr(
                credential::Column::RefreshTokenCiphertext,
                Expr::value(Option::<Vec<u8>>::None),
            )
            .col_expr(
                credential::Column::ExpiresAt,
                Expr::value(Option::<sea_orm::prelude::DateTimeWithTimeZone>::None),
            )
            .col_expr(
                credential::Column::Version,
                Expr::col(credential::Column::Version).add(1),
            )
            .col_expr(
                credential::Column::UpdatedAt,
                Expr::value(sea_orm::prelude::DateTimeWithTimeZone::from(Utc::now())),
            )
            .filter(credential::Column::UserId.eq(*user_id))
            .filter(credential::Column::Provider.eq(provider.as_str()))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Record a completed reconciliation. Not a token write, so `version` is
    /// left alone.
    pub async fn touch_last_synced(
        &self,
        user_id: &Uuid,
        provider: Provider,
        at: DateTime<Utc>,
    ) -> Result<()> {
        Credential::update_many()
            .col_expr(
                credential::Column::LastSyncedAt,
                Expr::value(sea_orm::prelude::DateTimeWithTimeZone::from(at)),
            )
            .filter(credential::Column::UserId.eq(*user_id))
            .filter(credential::Column::Provider.eq(provider.as_str()))
            .exec(&*self.db)
            .await?;
        Ok(())
    }
}
