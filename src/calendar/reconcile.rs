//! Reconciliation engine
//!
//! Windowed mark-and-sweep of a provider's events into the local mirror.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use metrics::{counter, histogram};
use tracing::{info, instrument};
use uuid::Uuid;

use super::{ITEM_TYPE_CALENDAR, ResourceFetcher, SyncResult, TimeWindow};
use crate::error::IntegrationError;
use crate::locks::{KeyedLocks, UserProviderKey};
use crate::providers::Provider;
use crate::repositories::{CredentialRepository, MirrorRepository};

pub struct ReconciliationEngine {
    credentials: CredentialRepository,
    mirror: MirrorRepository,
    fetcher: Arc<ResourceFetcher>,
    mirror_locks: Arc<KeyedLocks<UserProviderKey>>,
    window_days: u32,
}

impl ReconciliationEngine {
    pub fn new(
        credentials: CredentialRepository,
        mirror: MirrorRepository,
        fetcher: Arc<ResourceFetcher>,
        mirror_locks: Arc<KeyedLocks<UserProviderKey>>,
        window_days: u32,
    ) -> Self {
        Self {
            credentials,
            mirror,
            fetcher,
            mirror_locks,
            window_days,
        }
    }

    /// Fetch `[now, now + window)` and apply it to the mirror. The connected
    /// check happens once, before fetching; a concurrent disconnect does not
    /// abort a run already in flight.
    #[instrument(skip_all, fields(user_id = %user_id, provider = %provider))]
    pub async fn sync(
        &self,
        user_id: &Uuid,
        provider: Provider,
    ) -> Result<SyncResult, IntegrationError> {
        let started = Instant::now();
        let connected = self
            .credentials
            .find(user_id, provider)
            .await?
            .is_some_and(|record| record.connected);
        if !connected {
            return Err(IntegrationError::NotConnected { provider });
        }

        let snapshot = Utc::now();
        let window = TimeWindow::forward(snapshot, self.window_days);
        let events = self.fetcher.list_events(user_id, provider, &window).await?;

        let result = {
            let _guard = self.mirror_locks.lock(&(*user_id, provider)).await;
            self.mirror
                .apply_sync(
                    user_id,
                    provider,
                    ITEM_TYPE_CALENDAR,
                    &window,
                    &events,
                    snapshot,
                )
                .await?
        };

        self.credentials
            .touch_last_synced(user_id, provider, Utc::now())
            .await?;

        counter!("integrations_sync_upserted_total", "provider" => provider.as_str())
            .increment(result.upserted);
        counter!("integrations_sync_deleted_total", "provider" => provider.as_str())
            .increment(result.deleted);
        histogram!("integrations_sync_duration_ms", "provider" => provider.as_str())
            .record(started.elapsed().as_secs_f64() * 1_000.0);
        info!(
            fetched = events.len(),
            upserted = result.upserted,
            deleted = result.deleted,
            "Reconciled calendar mirror"
        );

        Ok(result)
    }
}
