//! Shared application state for the Axum API server.

use std::sync::Arc;

use relay_common::config::AppConfig;
use relay_engine::EventStore;
use relay_notifier::Dispatcher;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub config: AppConfig,
    /// Set when the dispatcher runs in this process; its counters are then
    /// included in the stats endpoint.
    pub dispatcher: Option<Arc<Dispatcher>>,
}

impl AppState {
    pub fn new(store: Arc<dyn EventStore>, config: AppConfig) -> Self {
        Self {
            store,
            config,
            dispatcher: None,
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }
}
