//! Shared application state

use std::sync::Arc;

use voicebridge_config::Settings;
use voicebridge_session::SessionRegistry;

/// State handed to every request handler
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let registry = Arc::new(SessionRegistry::new(settings.registry.clone()));
        Self {
            settings: Arc::new(settings),
            registry,
        }
    }

    /// Use an externally owned registry (the embedding application
    /// registers sessions on it as calls connect)
    pub fn with_registry(settings: Settings, registry: Arc<SessionRegistry>) -> Self {
        Self {
            settings: Arc::new(settings),
            registry,
        }
    }
}
