//! Application state.

use vsum_worker::Coordinator;

use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub coordinator: Coordinator,
}

impl AppState {
    pub fn new(config: ApiConfig, coordinator: Coordinator) -> Self {
        Self { config, coordinator }
    }
}
