use crate::configuration::Settings;
use crate::error::ApiError;
use std::sync::Arc;
use toolstream::providers::{base::Provider, factory};

type ProviderFactory = Arc<dyn Fn() -> Result<Arc<dyn Provider>, ApiError> + Send + Sync>;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    provider_factory: ProviderFactory,
}

impl AppState {
    /// Providers are built per request from the provider settings, so a missing
    /// key fails the request that needs it instead of startup
    pub fn new(settings: Settings) -> Self {
        let provider_settings = settings.provider.clone();
        let provider_factory: ProviderFactory = Arc::new(move || {
            let config = provider_settings.to_config()?;
            Ok(factory::get_provider(config)?)
        });
        Self {
            settings: Arc::new(settings),
            provider_factory,
        }
    }

    /// Serve every request with the same provider
    pub fn with_provider(settings: Settings, provider: Arc<dyn Provider>) -> Self {
        Self {
            settings: Arc::new(settings),
            provider_factory: Arc::new(move || Ok(provider.clone())),
        }
    }

    pub fn provider(&self) -> Result<Arc<dyn Provider>, ApiError> {
        (self.provider_factory)()
    }
}
