//! Provider adapter trait definition

use async_trait::async_trait;

use super::{PickedFile, Provider, ProviderError, TokenGrant};
use crate::calendar::{EventMutation, EventPage, RemoteEvent, TimeWindow};

/// Provider-specific OAuth and resource API calls.
///
/// Adapters are stateless apart from their HTTP client and endpoints; tokens
/// are always passed in by the caller.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Exchange an authorization code obtained by the client-side consent flow.
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenGrant, ProviderError>;

    /// Obtain a new access token from a refresh token.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError>;

    /// Email address of the connected account, when the provider exposes one.
    async fn fetch_account_email(&self, access_token: &str)
    -> Result<Option<String>, ProviderError>;

    /// Fetch one page of events overlapping `window`. `page` is the
    /// continuation returned by the previous call.
    async fn list_events(
        &self,
        access_token: &str,
        window: &TimeWindow,
        page: Option<&str>,
    ) -> Result<EventPage, ProviderError>;

    /// Apply a single-event write. Returns the provider's view of the event
    /// for create/update and `None` for delete.
    async fn mutate_event(
        &self,
        access_token: &str,
        mutation: &EventMutation,
    ) -> Result<Option<RemoteEvent>, ProviderError>;

    /// Download a picked file, failing with [`ProviderError::TooLarge`] once
    /// the declared or streamed size passes `max_bytes`.
    async fn fetch_file(
        &self,
        access_token: &str,
        file_id: &str,
        max_bytes: u64,
    ) -> Result<PickedFile, ProviderError>;
}
