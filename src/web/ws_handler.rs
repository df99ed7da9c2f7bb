use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::irc::client::IrcHandle;
use crate::session::events::{ClientEnvelope, SendMessagePayload, ServerEvent, SetTopicPayload};
use crate::session::history::StoredMessage;
use crate::session::user_session::UserSession;

use super::app_state::AppState;

/// Gap between PRIVMSG lines when a client message spans several, to stay
/// under server flood limits.
const LINE_GAP: Duration = Duration::from_millis(100);

/// GET /ws/{token}: upgrade to WebSocket and attach to the token's session.
pub async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let Some(session) = state.registry.get(&token) else {
        warn!("websocket upgrade with unknown token");
        return (StatusCode::UNAUTHORIZED, "Invalid session token").into_response();
    };

    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, session))
        .into_response()
}

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>, session: Arc<UserSession>) {
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<String>();
    let ws_id = session.attach_websocket(frame_tx);

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let write_handle = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        // Sink dropped (session teardown): tell the client we're done.
        let _ = ws_sender.close().await;
    });

    while let Some(msg_result) = ws_receiver.next().await {
        let msg = match msg_result {
            Ok(msg) => msg,
            Err(e) => {
                warn!(user = %session.username, error = %e, "WebSocket read error");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                handle_client_frame(&state, &session, &text).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    session.detach_websocket(ws_id);
    write_handle.abort();
    info!(user = %session.username, "WebSocket connection closed");
}

/// Parse and act on one client frame. Unknown types are logged and dropped;
/// malformed payloads additionally earn an `error` event.
async fn handle_client_frame(state: &Arc<AppState>, session: &Arc<UserSession>, text: &str) {
    let envelope: ClientEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(user = %session.username, error = %e, "unparseable client frame");
            session.broadcast(&ServerEvent::Error {
                message: "malformed frame".into(),
                network_id: None,
            });
            return;
        }
    };

    match envelope.kind.as_str() {
        "message" => {
            let payload: SendMessagePayload = match serde_json::from_value(envelope.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(user = %session.username, error = %e, "malformed message payload");
                    session.broadcast(&ServerEvent::Error {
                        message: "malformed message payload".into(),
                        network_id: None,
                    });
                    return;
                }
            };
            relay_message(state, session, payload).await;
        }
        "topic_change" => {
            let payload: SetTopicPayload = match serde_json::from_value(envelope.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(user = %session.username, error = %e, "malformed topic payload");
                    session.broadcast(&ServerEvent::Error {
                        message: "malformed topic_change payload".into(),
                        network_id: None,
                    });
                    return;
                }
            };
            match connected_handle(session, payload.network_id) {
                Some(handle) => handle.set_topic(&payload.channel, &payload.topic),
                None => not_connected(session, payload.network_id),
            }
        }
        other => {
            info!(user = %session.username, kind = other, "dropping unknown client frame");
        }
    }
}

fn connected_handle(session: &UserSession, network_id: i64) -> Option<IrcHandle> {
    session.network(network_id).and_then(|n| n.handle())
}

fn not_connected(session: &UserSession, network_id: i64) {
    session.broadcast(&ServerEvent::Error {
        message: "network not connected".into(),
        network_id: Some(network_id),
    });
}

/// Relay a client message upstream, one PRIVMSG per line with a flood gap,
/// and echo each line back to every attached device (IRC servers do not
/// echo one's own PRIVMSG without the echo-message capability).
async fn relay_message(
    state: &Arc<AppState>,
    session: &Arc<UserSession>,
    payload: SendMessagePayload,
) {
    let Some(network) = session.network(payload.network_id) else {
        return not_connected(session, payload.network_id);
    };
    let Some(handle) = network.handle() else {
        return not_connected(session, payload.network_id);
    };

    let nickname = network.config().nickname;
    let conversation = payload.channel_name.to_lowercase();

    let lines: Vec<&str> = payload.text.split('\n').collect();
    let line_count = lines.len();
    for (i, line) in lines.into_iter().enumerate() {
        // Empty lines are not representable in PRIVMSG; a space stands in.
        let line = if line.is_empty() { " " } else { line };
        handle.privmsg(&payload.channel_name, line);

        let timestamp = chrono::Utc::now();
        let stored = StoredMessage {
            network_id: network.id,
            channel: conversation.clone(),
            sender: nickname.clone(),
            text: line.to_string(),
            timestamp,
        };
        state.history.append(stored.clone());
        if let Some(channel) = network.channel(&conversation) {
            channel.append_message(stored, session.max_scrollback());
        }

        session.broadcast(&ServerEvent::Message {
            network_id: network.id,
            channel_name: conversation.clone(),
            sender: nickname.clone(),
            text: line.to_string(),
            time: timestamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            id: format!(
                "msg_{}_{}",
                timestamp.timestamp_nanos_opt().unwrap_or_default(),
                nickname
            ),
        });

        if i + 1 < line_count {
            tokio::time::sleep(LINE_GAP).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use sqlx::SqlitePool;

    use crate::config::GatewayConfig;
    use crate::push::NoopPush;
    use crate::session::history::HistoryStore;
    use crate::session::network::{NetworkConfig, NetworkState};
    use crate::session::registry::SessionRegistry;

    async fn test_state() -> Arc<AppState> {
        let db = SqlitePool::connect("sqlite::memory:").await.unwrap();
        Arc::new(AppState {
            registry: SessionRegistry::new(),
            history: Arc::new(HistoryStore::new(ChronoDuration::days(7))),
            db,
            push: Arc::new(NoopPush),
            config: GatewayConfig::default(),
        })
    }

    fn test_session_with_network() -> (
        Arc<UserSession>,
        Arc<NetworkState>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let session = Arc::new(UserSession::new(1, "alice", 500));
        let network = Arc::new(NetworkState::new(NetworkConfig {
            id: 4,
            user_id: 1,
            network_name: "testnet".into(),
            hostname: "irc.example.org".into(),
            port: 6667,
            use_ssl: false,
            server_password: String::new(),
            auto_reconnect: false,
            modules: Vec::new(),
            perform_commands: Vec::new(),
            initial_channels: Vec::new(),
            nickname: "alice".into(),
            alt_nickname: String::new(),
            ident: "alice".into(),
            realname: "Alice".into(),
            quit_message: "bye".into(),
        }));
        let (handle, wire) = IrcHandle::channel();
        network.mark_connected(handle);
        session.add_network(network.clone());
        (session, network, wire)
    }

    #[tokio::test(start_paused = true)]
    async fn multiline_message_splits_with_gaps() {
        let state = test_state().await;
        let (session, _network, mut wire) = test_session_with_network();

        let frame = serde_json::json!({
            "type": "message",
            "payload": {"network_id": 4, "channel_name": "#Lobby", "text": "one\n\nthree"}
        })
        .to_string();
        handle_client_frame(&state, &session, &frame).await;

        assert_eq!(wire.try_recv().unwrap(), "PRIVMSG #Lobby :one");
        assert_eq!(wire.try_recv().unwrap(), "PRIVMSG #Lobby : ");
        assert_eq!(wire.try_recv().unwrap(), "PRIVMSG #Lobby :three");

        // All three lines land in history under the lowercased key.
        assert_eq!(state.history.get(4, "#lobby", None, None).len(), 3);
    }

    #[tokio::test]
    async fn sent_message_echoes_to_attached_devices() {
        let state = test_state().await;
        let (session, _network, _wire) = test_session_with_network();

        let (ws_tx, mut ws_rx) = mpsc::unbounded_channel();
        session.attach_websocket(ws_tx);
        ws_rx.try_recv().unwrap(); // initial_state

        let frame = serde_json::json!({
            "type": "message",
            "payload": {"network_id": 4, "channel_name": "#lobby", "text": "hello"}
        })
        .to_string();
        handle_client_frame(&state, &session, &frame).await;

        let event: serde_json::Value =
            serde_json::from_str(&ws_rx.try_recv().unwrap()).unwrap();
        assert_eq!(event["type"], "message");
        assert_eq!(event["payload"]["sender"], "alice");
        assert_eq!(event["payload"]["text"], "hello");
        assert_eq!(event["payload"]["channel_name"], "#lobby");
    }

    #[tokio::test]
    async fn topic_change_goes_upstream() {
        let state = test_state().await;
        let (session, _network, mut wire) = test_session_with_network();

        let frame = serde_json::json!({
            "type": "topic_change",
            "payload": {"network_id": 4, "channel": "#lobby", "topic": "new topic"}
        })
        .to_string();
        handle_client_frame(&state, &session, &frame).await;
        assert_eq!(wire.try_recv().unwrap(), "TOPIC #lobby :new topic");
    }

    #[tokio::test]
    async fn unknown_network_reports_error_event() {
        let state = test_state().await;
        let session = Arc::new(UserSession::new(1, "alice", 500));
        let (ws_tx, mut ws_rx) = mpsc::unbounded_channel();
        session.attach_websocket(ws_tx);
        ws_rx.try_recv().unwrap();

        let frame = serde_json::json!({
            "type": "message",
            "payload": {"network_id": 9, "channel_name": "#lobby", "text": "hi"}
        })
        .to_string();
        handle_client_frame(&state, &session, &frame).await;

        let event: serde_json::Value =
            serde_json::from_str(&ws_rx.try_recv().unwrap()).unwrap();
        assert_eq!(event["type"], "error");
        assert_eq!(event["payload"]["network_id"], 9);
    }

    #[tokio::test]
    async fn unknown_frame_type_is_dropped_silently() {
        let state = test_state().await;
        let (session, _network, mut wire) = test_session_with_network();
        let (ws_tx, mut ws_rx) = mpsc::unbounded_channel();
        session.attach_websocket(ws_tx);
        ws_rx.try_recv().unwrap();

        let frame = serde_json::json!({"type": "dance", "payload": {}}).to_string();
        handle_client_frame(&state, &session, &frame).await;
        assert!(ws_rx.try_recv().is_err());
        assert!(wire.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_json_earns_error_event() {
        let state = test_state().await;
        let session = Arc::new(UserSession::new(1, "alice", 500));
        let (ws_tx, mut ws_rx) = mpsc::unbounded_channel();
        session.attach_websocket(ws_tx);
        ws_rx.try_recv().unwrap();

        handle_client_frame(&state, &session, "{not json").await;
        let event: serde_json::Value =
            serde_json::from_str(&ws_rx.try_recv().unwrap()).unwrap();
        assert_eq!(event["type"], "error");
    }
}
