use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::ServerEvent;
use super::network::NetworkState;

/// Message used when the away debounce fires with no client attached.
pub const DEFAULT_AWAY_MESSAGE: &str = "Client disconnected";

/// Grace period between the last websocket detaching and AWAY going out.
/// Page reloads reattach well inside this window.
pub const AWAY_DEBOUNCE: Duration = Duration::from_secs(2);

struct WsSink {
    id: Uuid,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct AwayState {
    is_away: bool,
    message: String,
}

/// The per-user aggregate: configured networks, attached websockets, and the
/// user-level away state. One session can be reached through any number of
/// bearer tokens; fan-out visits every attached socket.
pub struct UserSession {
    pub user_id: i64,
    pub username: String,
    max_scrollback: usize,
    fcm_token: Mutex<Option<String>>,
    networks: RwLock<HashMap<i64, Arc<NetworkState>>>,
    websockets: Mutex<Vec<WsSink>>,
    away: Mutex<AwayState>,
}

impl UserSession {
    pub fn new(user_id: i64, username: &str, max_scrollback: usize) -> Self {
        Self {
            user_id,
            username: username.to_string(),
            max_scrollback,
            fcm_token: Mutex::new(None),
            networks: RwLock::new(HashMap::new()),
            websockets: Mutex::new(Vec::new()),
            away: Mutex::new(AwayState::default()),
        }
    }

    pub fn max_scrollback(&self) -> usize {
        self.max_scrollback
    }

    // ── Networks ────────────────────────────────────────────────────

    pub fn add_network(&self, network: Arc<NetworkState>) {
        self.networks.write().unwrap().insert(network.id, network);
    }

    pub fn remove_network(&self, id: i64) -> Option<Arc<NetworkState>> {
        self.networks.write().unwrap().remove(&id)
    }

    pub fn network(&self, id: i64) -> Option<Arc<NetworkState>> {
        self.networks.read().unwrap().get(&id).cloned()
    }

    pub fn networks(&self) -> Vec<Arc<NetworkState>> {
        self.networks.read().unwrap().values().cloned().collect()
    }

    // ── Push address ────────────────────────────────────────────────

    pub fn fcm_token(&self) -> Option<String> {
        self.fcm_token.lock().unwrap().clone()
    }

    pub fn set_fcm_token(&self, token: &str) {
        *self.fcm_token.lock().unwrap() = Some(token.to_string());
    }

    // ── WebSocket fan-out ───────────────────────────────────────────

    /// Attach a client sink. The `initial_state` snapshot is enqueued as the
    /// socket's first frame while the write set is locked, so nothing can
    /// slip in front of it. Clears away state if set.
    pub fn attach_websocket(&self, tx: mpsc::UnboundedSender<String>) -> Uuid {
        let snapshot = self.initial_state();
        let frame = match serde_json::to_string(&snapshot) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(user = %self.username, error = %e, "failed to serialize initial_state");
                None
            }
        };

        let id = Uuid::new_v4();
        {
            let mut sockets = self.websockets.lock().unwrap();
            if let Some(frame) = frame {
                let _ = tx.send(frame);
            }
            sockets.push(WsSink { id, tx });
            info!(user = %self.username, websockets = sockets.len(), "websocket attached");
        }

        if self.is_away() {
            self.set_back();
        }
        id
    }

    /// Detach a client sink. Going away is debounced: a reload that
    /// reattaches within the window produces no AWAY at all.
    pub fn detach_websocket(self: &Arc<Self>, id: Uuid) {
        {
            let mut sockets = self.websockets.lock().unwrap();
            sockets.retain(|sink| sink.id != id);
            info!(user = %self.username, websockets = sockets.len(), "websocket detached");
        }

        let session = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(AWAY_DEBOUNCE).await;
            if !session.is_active() && !session.is_away() {
                session.set_away(DEFAULT_AWAY_MESSAGE);
            }
        });
    }

    pub fn is_active(&self) -> bool {
        !self.websockets.lock().unwrap().is_empty()
    }

    /// Serialize once, then deliver to every attached socket. Each socket's
    /// frames flow through one writer, so per-socket order matches the order
    /// broadcasts happen here. A failed send is logged and left alone; the
    /// socket's reader observes the close and runs the detach path.
    pub fn broadcast(&self, event: &ServerEvent) {
        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(user = %self.username, error = %e, "failed to serialize event");
                return;
            }
        };

        let sockets = self.websockets.lock().unwrap();
        for sink in sockets.iter() {
            if sink.tx.send(frame.clone()).is_err() {
                debug!(user = %self.username, websocket = %sink.id, "send to closed websocket");
            }
        }
    }

    // ── Away state ──────────────────────────────────────────────────

    pub fn is_away(&self) -> bool {
        self.away.lock().unwrap().is_away
    }

    pub fn away_message(&self) -> Option<String> {
        let away = self.away.lock().unwrap();
        away.is_away.then(|| away.message.clone())
    }

    /// Mark away on every connected network and tell the clients.
    pub fn set_away(&self, message: &str) {
        {
            let mut away = self.away.lock().unwrap();
            away.is_away = true;
            away.message = message.to_string();
        }
        for network in self.networks() {
            if let Some(handle) = network.handle() {
                handle.send_raw(format!("AWAY :{message}"));
            }
        }
        info!(user = %self.username, "marked away");
        self.broadcast(&ServerEvent::UserAway {
            username: self.username.clone(),
            message: message.to_string(),
        });
    }

    /// Clear away on every connected network and tell the clients.
    pub fn set_back(&self) {
        {
            let mut away = self.away.lock().unwrap();
            away.is_away = false;
            away.message.clear();
        }
        for network in self.networks() {
            if let Some(handle) = network.handle() {
                handle.send_raw("BACK");
            }
        }
        info!(user = %self.username, "marked back");
        self.broadcast(&ServerEvent::UserBack {
            username: self.username.clone(),
        });
    }

    // ── Snapshots / teardown ────────────────────────────────────────

    /// The sole client/server synchronization point: the complete network
    /// list with connection status and per-channel state.
    pub fn initial_state(&self) -> ServerEvent {
        let mut networks: Vec<_> = self.networks().iter().map(|n| n.snapshot()).collect();
        networks.sort_by_key(|n| n.id);
        ServerEvent::InitialState { networks }
    }

    /// Quit every network (best effort), cancel pending reconnects, and drop
    /// all websocket sinks so their writer tasks wind down.
    pub fn teardown(&self) {
        for network in self.networks() {
            network.cancel_reconnect();
            if let Some(handle) = network.handle() {
                handle.quit(&network.config().quit_message);
            }
            network.mark_disconnected();
        }
        self.websockets.lock().unwrap().clear();
        info!(user = %self.username, "session torn down");
    }
}
