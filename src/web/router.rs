use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use super::app_state::AppState;
use super::{rest_api, ws_handler};

/// Build the axum router with all HTTP and WebSocket routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/login", post(rest_api::login))
        .route("/ws/{token}", get(ws_handler::ws_upgrade))
        .route(
            "/api/irc/networks",
            get(rest_api::list_networks).post(rest_api::add_network),
        )
        .route(
            "/api/irc/networks/{id}",
            get(rest_api::get_network)
                .put(rest_api::update_network)
                .delete(rest_api::delete_network),
        )
        .route(
            "/api/irc/networks/{id}/connect",
            post(rest_api::connect_network),
        )
        .route(
            "/api/irc/networks/{id}/disconnect",
            post(rest_api::disconnect_network),
        )
        .route(
            "/api/history/{network_id}/{channel}",
            get(rest_api::channel_history),
        )
        .route(
            "/api/register-fcm-token",
            post(rest_api::register_fcm_token),
        )
        .layer(cors)
        .with_state(state)
}
