use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth;
use crate::db::queries::{networks, users};
use crate::irc::client::{connect, ConnectContext, ConnectError};
use crate::session::events::ServerEvent;
use crate::session::history::StoredMessage;
use crate::session::network::{NetworkConfig, NetworkState};
use crate::session::user_session::UserSession;

use super::app_state::AppState;

#[derive(Serialize)]
pub struct ApiMessage {
    pub success: bool,
    pub message: String,
}

impl ApiMessage {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }

    fn err(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            message: message.into(),
        })
    }
}

fn authorized_session(state: &AppState, headers: &HeaderMap) -> Result<Arc<UserSession>, Response> {
    auth::bearer_token(headers)
        .and_then(|token| state.registry.get(token))
        .ok_or_else(|| {
            (StatusCode::UNAUTHORIZED, ApiMessage::err("Invalid session token")).into_response()
        })
}

/// Kick off a background connect for a network, reporting failure as a
/// `network_disconnect{status:"failed"}` event.
pub fn spawn_connect(
    state: &Arc<AppState>,
    session: Arc<UserSession>,
    network: Arc<NetworkState>,
    client_ip: Option<IpAddr>,
) {
    let ctx = ConnectContext {
        session: session.clone(),
        network: network.clone(),
        history: state.history.clone(),
        push: state.push.clone(),
        client_ip,
    };
    tokio::spawn(async move {
        match connect(ctx).await {
            Ok(_) | Err(ConnectError::AlreadyInProgress) => {}
            Err(e) => {
                let config = network.config();
                session.broadcast(&ServerEvent::NetworkDisconnect {
                    network_id: network.id,
                    network_name: config.network_name,
                    status: "failed".into(),
                    reason: e.to_string(),
                });
            }
        }
    });
}

// ── Login ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// POST /login: check credentials, mint a bearer token. A second device
/// logging in gets a fresh token aliased onto the existing session.
pub async fn login(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<LoginRequest>,
) -> Response {
    let username = req.username.trim().to_string();
    if username.is_empty() || req.password.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            ApiMessage::err("Username and password required"),
        )
            .into_response();
    }

    let user = match users::get_by_username(&state.db, &username).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return (StatusCode::UNAUTHORIZED, ApiMessage::err("Login failed")).into_response()
        }
        Err(e) => {
            warn!(error = %e, "login query failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiMessage::err("Gateway error"),
            )
                .into_response();
        }
    };

    if user.is_suspended {
        return (StatusCode::FORBIDDEN, ApiMessage::err("Account suspended")).into_response();
    }

    match auth::verify_password(req.password, user.hashed_password.clone()).await {
        Ok(true) => {}
        Ok(false) => {
            return (StatusCode::UNAUTHORIZED, ApiMessage::err("Login failed")).into_response()
        }
        Err(e) => {
            warn!(error = %e, "stored password hash unusable");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiMessage::err("Gateway error"),
            )
                .into_response();
        }
    }

    let token = Uuid::new_v4().to_string();

    // Multi-device: a live session gains another token; otherwise the
    // session is rehydrated from the persisted network configs.
    if let Some(existing) = state.registry.find_session_by_username(&user.username) {
        state.registry.add(&token, existing);
        return Json(LoginResponse {
            success: true,
            message: "Login successful".into(),
            token: Some(token),
        })
        .into_response();
    }

    let session = Arc::new(UserSession::new(
        user.id,
        &user.username,
        state.config.history.max_scrollback_lines,
    ));

    match networks::list_networks(&state.db, user.id).await {
        Ok(configs) => {
            for config in configs {
                session.add_network(Arc::new(NetworkState::new(config)));
            }
        }
        Err(e) => {
            warn!(error = %e, user = %user.username, "failed to load networks");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiMessage::err("Gateway error"),
            )
                .into_response();
        }
    }

    state.registry.add(&token, session.clone());
    info!(user = %user.username, "session created");

    for network in session.networks() {
        if network.config().auto_reconnect {
            spawn_connect(&state, session.clone(), network, Some(addr.ip()));
        }
    }

    Json(LoginResponse {
        success: true,
        message: "Login successful".into(),
        token: Some(token),
    })
    .into_response()
}

// ── Network CRUD and control ────────────────────────────────────────

#[derive(Deserialize)]
pub struct NetworkRequest {
    pub network_name: String,
    pub hostname: String,
    pub port: u16,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub server_password: String,
    #[serde(default)]
    pub auto_reconnect: bool,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub perform_commands: Vec<String>,
    #[serde(default)]
    pub initial_channels: Vec<String>,
    pub nickname: String,
    #[serde(default)]
    pub alt_nickname: String,
    #[serde(default)]
    pub ident: String,
    #[serde(default)]
    pub realname: String,
    #[serde(default)]
    pub quit_message: String,
}

impl NetworkRequest {
    fn into_config(self, id: i64, user_id: i64) -> NetworkConfig {
        NetworkConfig {
            id,
            user_id,
            network_name: self.network_name,
            hostname: self.hostname,
            port: self.port,
            use_ssl: self.use_ssl,
            server_password: self.server_password,
            auto_reconnect: self.auto_reconnect,
            modules: self.modules,
            perform_commands: self.perform_commands,
            initial_channels: self.initial_channels,
            nickname: self.nickname,
            alt_nickname: self.alt_nickname,
            ident: self.ident,
            realname: self.realname,
            quit_message: self.quit_message,
        }
    }
}

#[derive(Serialize)]
pub struct NetworkSummary {
    pub id: i64,
    pub network_name: String,
    pub hostname: String,
    pub port: u16,
    pub use_ssl: bool,
    pub auto_reconnect: bool,
    pub nickname: String,
    pub is_connected: bool,
}

/// GET /api/irc/networks
pub async fn list_networks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let session = match authorized_session(&state, &headers) {
        Ok(session) => session,
        Err(response) => return response,
    };

    let configs = match networks::list_networks(&state.db, session.user_id).await {
        Ok(configs) => configs,
        Err(e) => {
            warn!(error = %e, "failed to list networks");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiMessage::err("Failed to retrieve networks"),
            )
                .into_response();
        }
    };

    let summaries: Vec<NetworkSummary> = configs
        .into_iter()
        .map(|config| {
            let is_connected = session
                .network(config.id)
                .map(|n| n.is_connected())
                .unwrap_or(false);
            NetworkSummary {
                id: config.id,
                network_name: config.network_name,
                hostname: config.hostname,
                port: config.port,
                use_ssl: config.use_ssl,
                auto_reconnect: config.auto_reconnect,
                nickname: config.nickname,
                is_connected,
            }
        })
        .collect();

    Json(serde_json::json!({ "success": true, "networks": summaries })).into_response()
}

/// POST /api/irc/networks
pub async fn add_network(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<NetworkRequest>,
) -> Response {
    let session = match authorized_session(&state, &headers) {
        Ok(session) => session,
        Err(response) => return response,
    };

    if req.network_name.is_empty() || req.hostname.is_empty() || req.nickname.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            ApiMessage::err("Network name, hostname and nickname are required"),
        )
            .into_response();
    }

    let mut config = req.into_config(0, session.user_id);
    let network_id = match networks::add_network(&state.db, &config).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "failed to add network");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiMessage::err("Failed to add network configuration"),
            )
                .into_response();
        }
    };
    config.id = network_id;

    let auto_reconnect = config.auto_reconnect;
    let network = Arc::new(NetworkState::new(config));
    session.add_network(network.clone());
    info!(user = %session.username, network_id, "network added");

    if auto_reconnect {
        spawn_connect(&state, session.clone(), network.clone(), Some(addr.ip()));
    }

    let summary = NetworkSummary {
        id: network.id,
        network_name: network.config().network_name,
        hostname: network.config().hostname,
        port: network.config().port,
        use_ssl: network.config().use_ssl,
        auto_reconnect,
        nickname: network.config().nickname,
        is_connected: false,
    };
    (
        StatusCode::CREATED,
        Json(serde_json::json!({ "success": true, "network": summary })),
    )
        .into_response()
}

/// GET /api/irc/networks/{id}: full detail, including fields the edit
/// screen needs back.
pub async fn get_network(
    State(state): State<Arc<AppState>>,
    Path(network_id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    let session = match authorized_session(&state, &headers) {
        Ok(session) => session,
        Err(response) => return response,
    };

    match networks::get_network(&state.db, session.user_id, network_id).await {
        Ok(Some(config)) => {
            let is_connected = session
                .network(network_id)
                .map(|n| n.is_connected())
                .unwrap_or(false);
            let mut network = serde_json::to_value(&config).expect("config serializes");
            network["is_connected"] = serde_json::Value::Bool(is_connected);
            Json(serde_json::json!({ "success": true, "network": network })).into_response()
        }
        Ok(None) => (StatusCode::NOT_FOUND, ApiMessage::err("Network not found")).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to get network");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiMessage::err("Failed to retrieve network"),
            )
                .into_response()
        }
    }
}

/// PUT /api/irc/networks/{id}: update; a connected network is bounced to
/// pick the new settings up.
pub async fn update_network(
    State(state): State<Arc<AppState>>,
    Path(network_id): Path<i64>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<NetworkRequest>,
) -> Response {
    let session = match authorized_session(&state, &headers) {
        Ok(session) => session,
        Err(response) => return response,
    };

    let config = req.into_config(network_id, session.user_id);
    match networks::update_network(&state.db, &config).await {
        Ok(true) => {}
        Ok(false) => {
            return (
                StatusCode::NOT_FOUND,
                ApiMessage::err("Network configuration not found"),
            )
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, "failed to update network");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiMessage::err("Failed to update network"),
            )
                .into_response();
        }
    }

    match session.network(network_id) {
        Some(network) => {
            network.update_config(config);
            if network.is_connected() {
                info!(network_id, "bouncing connected network to apply update");
                if let Some(handle) = network.handle() {
                    handle.quit(&network.config().quit_message);
                }
                spawn_connect(&state, session.clone(), network, Some(addr.ip()));
            }
        }
        None => {
            session.add_network(Arc::new(NetworkState::new(config)));
        }
    }

    ApiMessage::ok("Network updated successfully").into_response()
}

/// DELETE /api/irc/networks/{id}
pub async fn delete_network(
    State(state): State<Arc<AppState>>,
    Path(network_id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    let session = match authorized_session(&state, &headers) {
        Ok(session) => session,
        Err(response) => return response,
    };

    if let Some(network) = session.network(network_id) {
        network.cancel_reconnect();
        if let Some(handle) = network.handle() {
            handle.quit(&network.config().quit_message);
        }
    }

    match networks::delete_network(&state.db, session.user_id, network_id).await {
        Ok(true) => {}
        Ok(false) => {
            return (
                StatusCode::NOT_FOUND,
                ApiMessage::err("Network configuration not found"),
            )
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, "failed to delete network");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiMessage::err("Failed to delete network"),
            )
                .into_response();
        }
    }

    session.remove_network(network_id);
    info!(user = %session.username, network_id, "network deleted");
    ApiMessage::ok("Network deleted successfully").into_response()
}

/// POST /api/irc/networks/{id}/connect
pub async fn connect_network(
    State(state): State<Arc<AppState>>,
    Path(network_id): Path<i64>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let session = match authorized_session(&state, &headers) {
        Ok(session) => session,
        Err(response) => return response,
    };

    // A network configured after login may not be in the session yet.
    let network = match session.network(network_id) {
        Some(network) => network,
        None => match networks::get_network(&state.db, session.user_id, network_id).await {
            Ok(Some(config)) => {
                let network = Arc::new(NetworkState::new(config));
                session.add_network(network.clone());
                network
            }
            Ok(None) => {
                return (
                    StatusCode::NOT_FOUND,
                    ApiMessage::err("Network configuration not found"),
                )
                    .into_response()
            }
            Err(e) => {
                warn!(error = %e, "failed to load network");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiMessage::err("Failed to retrieve network"),
                )
                    .into_response();
            }
        },
    };

    if network.is_connected() {
        return ApiMessage::ok("Network is already connected").into_response();
    }

    spawn_connect(&state, session.clone(), network, Some(addr.ip()));
    ApiMessage::ok("Attempting to connect").into_response()
}

/// POST /api/irc/networks/{id}/disconnect
pub async fn disconnect_network(
    State(state): State<Arc<AppState>>,
    Path(network_id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    let session = match authorized_session(&state, &headers) {
        Ok(session) => session,
        Err(response) => return response,
    };

    let Some(network) = session.network(network_id) else {
        return (
            StatusCode::NOT_FOUND,
            ApiMessage::err("Network configuration not found"),
        )
            .into_response();
    };

    let Some(handle) = network.handle() else {
        return ApiMessage::ok("Network is already disconnected").into_response();
    };

    handle.quit(&network.config().quit_message);
    ApiMessage::ok("Disconnect command sent").into_response()
}

// ── History ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
    pub since: Option<String>,
}

/// GET /api/history/{network_id}/{channel}?limit=N&since=RFC3339
///
/// A malformed `since` is rejected rather than silently ignored. Channel
/// keys require membership; DM keys are readable by the owning session.
pub async fn channel_history(
    State(state): State<Arc<AppState>>,
    Path((network_id, channel)): Path<(i64, String)>,
    Query(params): Query<HistoryParams>,
    headers: HeaderMap,
) -> Response {
    let session = match authorized_session(&state, &headers) {
        Ok(session) => session,
        Err(response) => return response,
    };

    let since: Option<DateTime<Utc>> = match params.since.as_deref() {
        None => None,
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(parsed) => Some(parsed.with_timezone(&Utc)),
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    ApiMessage::err("Invalid since timestamp, expected RFC3339"),
                )
                    .into_response()
            }
        },
    };
    let limit = params.limit.unwrap_or(100).max(1);

    let Some(network) = session.network(network_id) else {
        return (StatusCode::NOT_FOUND, ApiMessage::err("Network not found")).into_response();
    };

    if (channel.starts_with('#') || channel.starts_with('&'))
        && network.channel(&channel).is_none()
    {
        return (StatusCode::FORBIDDEN, ApiMessage::err("Not in channel")).into_response();
    }

    let history: Vec<StoredMessage> =
        state.history.get(network_id, &channel, since, Some(limit));
    Json(serde_json::json!({ "success": true, "history": history })).into_response()
}

// ── Push address registration ───────────────────────────────────────

#[derive(Deserialize)]
pub struct RegisterFcmTokenRequest {
    pub fcm_token: String,
}

/// POST /api/register-fcm-token
pub async fn register_fcm_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RegisterFcmTokenRequest>,
) -> Response {
    let session = match authorized_session(&state, &headers) {
        Ok(session) => session,
        Err(response) => return response,
    };

    if req.fcm_token.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            ApiMessage::err("fcm_token is required"),
        )
            .into_response();
    }

    session.set_fcm_token(&req.fcm_token);
    info!(user = %session.username, "push address registered");
    ApiMessage::ok("FCM token registered successfully").into_response()
}
