//! Resource fetcher
//!
//! Runs provider calls with a valid token. A 401 from the provider forces one
//! token refresh and a single retry of the whole operation.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use metrics::counter;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{RemoteEvent, TimeWindow};
use crate::error::IntegrationError;
use crate::providers::{Provider, ProviderAdapter, ProviderError, ProviderRegistry};
use crate::token_authority::TokenAuthority;

/// Upper bound on pages drained per listing
const MAX_PAGES: usize = 200;

pub struct ResourceFetcher {
    authority: Arc<TokenAuthority>,
    registry: Arc<ProviderRegistry>,
}

impl ResourceFetcher {
    pub fn new(authority: Arc<TokenAuthority>, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            authority,
            registry,
        }
    }

    /// Every event starting in `window`, earliest first. Pagination is fully
    /// drained; a partial listing is never returned.
    #[instrument(skip_all, fields(user_id = %user_id, provider = %provider))]
    pub async fn list_events(
        &self,
        user_id: &Uuid,
        provider: Provider,
        window: &TimeWindow,
    ) -> Result<Vec<RemoteEvent>, IntegrationError> {
        let mut events = self
            .authorized_call(user_id, provider, |adapter, token| async move {
                drain(adapter.as_ref(), &token, window).await
            })
            .await?;

        // Stable: provider order is kept for equal starts
        events.sort_by_key(|event| event.payload.start);
        debug!(count = events.len(), "Listed remote events");
        Ok(events)
    }

    /// Run `call` with a valid access token. On a 401 the token is force
    /// refreshed and `call` runs once more from scratch.
    pub async fn authorized_call<T, F, Fut>(
        &self,
        user_id: &Uuid,
        provider: Provider,
        call: F,
    ) -> Result<T, IntegrationError>
    where
        F: Fn(Arc<dyn ProviderAdapter>, String) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let adapter = self
            .registry
            .get(provider)
            .map_err(|e| IntegrationError::Misconfigured {
                provider,
                message: e.to_string(),
            })?;
        let token = self.authority.get_valid_token(user_id, provider).await?;

        match call(Arc::clone(&adapter), token.token.clone()).await {
            Err(ProviderError::Unauthorized(_)) => {
                counter!("integrations_unauthorized_retry_total", "provider" => provider.as_str())
                    .increment(1);
                debug!("Provider rejected access token; forcing refresh");
                let fresh = self
                    .authority
                    .force_refresh(user_id, provider, &token.token)
                    .await?;
                call(adapter, fresh.token)
                    .await
                    .map_err(|e| IntegrationError::from_provider(provider, e))
            }
            result => result.map_err(|e| IntegrationError::from_provider(provider, e)),
        }
    }
}

async fn drain(
    adapter: &dyn ProviderAdapter,
    access_token: &str,
    window: &TimeWindow,
) -> Result<Vec<RemoteEvent>, ProviderError> {
    let mut events = Vec::new();
    let mut seen = HashSet::new();
    let mut page: Option<String> = None;

    for _ in 0..MAX_PAGES {
        let batch = adapter
            .list_events(access_token, window, page.as_deref())
            .await?;
        for event in batch.events {
            if seen.insert(event.external_id.clone()) {
                events.push(event);
            }
        }
        match batch.next_page {
            Some(next) => page = Some(next),
            None => return Ok(events),
        }
    }

    Err(ProviderError::Malformed(format!(
        "listing did not finish within {} pages",
        MAX_PAGES
    )))
}
