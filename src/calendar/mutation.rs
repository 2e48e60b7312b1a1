//! Event mutation proxy
//!
//! Writes go to the provider first; the mirror only changes after the
//! provider accepted the write.

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{
    EventDraft, EventMutation, EventPatch, ITEM_TYPE_CALENDAR, RemoteEvent, ResourceFetcher,
};
use crate::error::IntegrationError;
use crate::locks::{KeyedLocks, UserProviderKey};
use crate::models::mirrored_item;
use crate::providers::Provider;
use crate::repositories::MirrorRepository;

pub struct EventMutationProxy {
    fetcher: Arc<ResourceFetcher>,
    mirror: MirrorRepository,
    mirror_locks: Arc<KeyedLocks<UserProviderKey>>,
}

impl EventMutationProxy {
    pub fn new(
        fetcher: Arc<ResourceFetcher>,
        mirror: MirrorRepository,
        mirror_locks: Arc<KeyedLocks<UserProviderKey>>,
    ) -> Self {
        Self {
            fetcher,
            mirror,
            mirror_locks,
        }
    }

    #[instrument(skip_all, fields(user_id = %user_id, provider = %provider))]
    pub async fn create(
        &self,
        user_id: &Uuid,
        provider: Provider,
        draft: EventDraft,
    ) -> Result<mirrored_item::Model, IntegrationError> {
        draft.validate()?;
        let event = self
            .forward_returning_event(user_id, provider, EventMutation::Create(draft))
            .await?;
        self.mirror_event(user_id, provider, &event).await
    }

    #[instrument(skip_all, fields(user_id = %user_id, provider = %provider, external_id = %external_id))]
    pub async fn update(
        &self,
        user_id: &Uuid,
        provider: Provider,
        external_id: &str,
        patch: EventPatch,
    ) -> Result<mirrored_item::Model, IntegrationError> {
        validate_external_id(external_id)?;
        patch.validate()?;
        let event = self
            .forward_returning_event(
                user_id,
                provider,
                EventMutation::Update {
                    external_id: external_id.to_string(),
                    patch,
                },
            )
            .await?;
        self.mirror_event(user_id, provider, &event).await
    }

    /// Delete on the provider, then remove the mirror row. An event the
    /// provider no longer knows (404/410) counts as deleted.
    #[instrument(skip_all, fields(user_id = %user_id, provider = %provider, external_id = %external_id))]
    pub async fn delete(
        &self,
        user_id: &Uuid,
        provider: Provider,
        external_id: &str,
    ) -> Result<(), IntegrationError> {
        validate_external_id(external_id)?;
        let mutation = EventMutation::Delete {
            external_id: external_id.to_string(),
        };

        match self.forward(user_id, provider, &mutation).await {
            Ok(_) => {}
            Err(IntegrationError::ProviderRejected {
                status: 404 | 410,
                ..
            }) => {
                info!("Event already gone on the provider");
            }
            Err(error) => return Err(error),
        }

        let _guard = self.mirror_locks.lock(&(*user_id, provider)).await;
        self.mirror
            .remove(user_id, provider, ITEM_TYPE_CALENDAR, external_id)
            .await?;
        Ok(())
    }

    async fn forward(
        &self,
        user_id: &Uuid,
        provider: Provider,
        mutation: &EventMutation,
    ) -> Result<Option<RemoteEvent>, IntegrationError> {
        let result = self
            .fetcher
            .authorized_call(user_id, provider, |adapter, token| async move {
                adapter.mutate_event(&token, mutation).await
            })
            .await;

        let outcome = if result.is_ok() { "success" } else { "failure" };
        counter!(
            "integrations_event_mutation_total",
            "provider" => provider.as_str(),
            "kind" => mutation.kind(),
            "outcome" => outcome
        )
        .increment(1);
        result
    }

    async fn forward_returning_event(
        &self,
        user_id: &Uuid,
        provider: Provider,
        mutation: EventMutation,
    ) -> Result<RemoteEvent, IntegrationError> {
        self.forward(user_id, provider, &mutation)
            .await?
            .ok_or_else(|| IntegrationError::MalformedResponse {
                provider,
                message: format!("{} returned no event", mutation.kind()),
            })
    }

    async fn mirror_event(
        &self,
        user_id: &Uuid,
        provider: Provider,
        event: &RemoteEvent,
    ) -> Result<mirrored_item::Model, IntegrationError> {
        let _guard = self.mirror_locks.lock(&(*user_id, provider)).await;
        Ok(self
            .mirror
            .upsert(user_id, provider, ITEM_TYPE_CALENDAR, event, Utc::now())
            .await?)
    }
}

fn validate_external_id(external_id: &str) -> Result<(), IntegrationError> {
    if external_id.trim().is_empty() {
        return Err(IntegrationError::Validation(
            "external id must not be empty".to_string(),
        ));
    }
    Ok(())
}
