use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::GatewayConfig;
use crate::push::PushNotifier;
use crate::session::history::HistoryStore;
use crate::session::registry::SessionRegistry;

/// Shared application state available to all HTTP/WebSocket handlers.
pub struct AppState {
    pub registry: SessionRegistry,
    pub history: Arc<HistoryStore>,
    pub db: SqlitePool,
    pub push: Arc<dyn PushNotifier>,
    pub config: GatewayConfig,
}
