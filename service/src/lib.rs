use config::Config;
use sse::StreamController;
use std::sync::Arc;

pub mod config;
pub mod logging;

// Service-level state shared by every request handler
// Needs to implement Clone to be able to be passed into Router as State
#[derive(Clone)]
pub struct AppState {
    pub stream_controller: Arc<StreamController>,
    pub config: Config,
}

impl AppState {
    pub fn new(app_config: Config, stream_controller: &Arc<StreamController>) -> Self {
        Self {
            stream_controller: Arc::clone(stream_controller),
            config: app_config,
        }
    }
}
