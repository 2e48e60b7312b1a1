//! Provider registry
//!
//! Maps each [`Provider`] to its adapter. Built once at startup from
//! [`AppConfig`] and shared through the gateway; tests register mocks.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use super::http::build_client;
use super::{GoogleAdapter, MicrosoftAdapter, Provider, ProviderAdapter, ProviderError};
use crate::config::AppConfig;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("provider '{0}' is not registered")]
    ProviderNotFound(Provider),

    #[error("failed to build provider client: {0}")]
    Client(#[from] ProviderError),
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for the same provider
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn ProviderAdapter>, RegistryError> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or(RegistryError::ProviderNotFound(provider))
    }

    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.adapters.keys().copied().collect();
        providers.sort();
        providers
    }

    /// Build both adapters from configuration. Adapters without client
    /// credentials are still registered; their token calls fail with a
    /// configuration error.
    pub fn from_config(config: &AppConfig) -> Result<Self, RegistryError> {
        let client = build_client()?;
        let token_timeout = config.integration.token_timeout();
        let request_timeout = config.integration.list_timeout();

        if config.google_client_id.is_none() {
            warn!("Google client credentials not configured");
        }
        if config.microsoft_client_id.is_none() {
            warn!("Microsoft client credentials not configured");
        }

        let google = GoogleAdapter::new(
            client.clone(),
            config.google_client_id.clone(),
            config.google_client_secret.clone(),
        )
        .with_endpoints(&config.google_oauth_base, &config.google_api_base)
        .with_timeouts(token_timeout, request_timeout);

        let microsoft = MicrosoftAdapter::new(
            client,
            config.microsoft_client_id.clone(),
            config.microsoft_client_secret.clone(),
        )
        .with_endpoints(
            &config.microsoft_login_base,
            &config.microsoft_tenant,
            &config.microsoft_graph_base,
        )
        .with_timeouts(token_timeout, request_timeout);

        let mut registry = Self::new();
        registry.register(Arc::new(google));
        registry.register(Arc::new(microsoft));
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_registers_both_providers() {
        let registry = ProviderRegistry::from_config(&AppConfig::default()).unwrap();
        assert_eq!(
            registry.providers(),
            vec![Provider::Google, Provider::Microsoft]
        );
        assert_eq!(
            registry.get(Provider::Microsoft).unwrap().provider(),
            Provider::Microsoft
        );
    }

    #[test]
    fn missing_adapter_is_an_error() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.get(Provider::Google),
            Err(RegistryError::ProviderNotFound(Provider::Google))
        ));
    }
}
