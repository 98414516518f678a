//! Application state shared across routes

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::game::LobbyRegistry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub lobbies: Arc<LobbyRegistry>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);

        let lobbies = Arc::new(LobbyRegistry::new(Duration::from_secs(
            config.lobby_grace_secs,
        )));

        Self { config, lobbies }
    }
}
