use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::irc::client::IrcHandle;

use super::channel::{parse_member, ChannelMember, ChannelState};
use super::events::NetworkSnapshot;

/// Persisted configuration of one IRC network for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub id: i64,
    pub user_id: i64,
    pub network_name: String,
    pub hostname: String,
    pub port: u16,
    pub use_ssl: bool,
    pub server_password: String,
    pub auto_reconnect: bool,
    pub modules: Vec<String>,
    pub perform_commands: Vec<String>,
    pub initial_channels: Vec<String>,
    pub nickname: String,
    pub alt_nickname: String,
    pub ident: String,
    pub realname: String,
    pub quit_message: String,
}

impl NetworkConfig {
    /// SASL PLAIN is attempted when the module is enabled and a password is
    /// configured; otherwise the password (if any) goes out as PASS.
    pub fn wants_sasl(&self) -> bool {
        !self.server_password.is_empty()
            && self.modules.iter().any(|m| m.eq_ignore_ascii_case("sasl"))
    }

    /// Ident falls back to the nickname when left blank.
    pub fn effective_ident(&self) -> &str {
        let ident = self.ident.trim();
        if ident.is_empty() {
            &self.nickname
        } else {
            ident
        }
    }
}

#[derive(Default)]
struct LinkState {
    handle: Option<IrcHandle>,
    connected: bool,
    connecting: bool,
    attempts: u32,
    reconnect: Option<JoinHandle<()>>,
}

/// Live state of one configured network: connection link, channel map, and
/// the pending NAMES buffers for exchanges still in flight.
pub struct NetworkState {
    pub id: i64,
    config: RwLock<NetworkConfig>,
    link: Mutex<LinkState>,
    channels: RwLock<HashMap<String, Arc<ChannelState>>>,
    pending_names: Mutex<HashMap<String, Vec<String>>>,
}

/// Guard for an in-flight connection attempt. Dropping it releases the
/// gatekeeper, whatever path the attempt exits through.
pub struct ConnectAttempt {
    network: Arc<NetworkState>,
}

impl Drop for ConnectAttempt {
    fn drop(&mut self) {
        self.network.link.lock().unwrap().connecting = false;
    }
}

impl NetworkState {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            id: config.id,
            config: RwLock::new(config),
            link: Mutex::new(LinkState::default()),
            channels: RwLock::new(HashMap::new()),
            pending_names: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> NetworkConfig {
        self.config.read().unwrap().clone()
    }

    pub fn update_config(&self, config: NetworkConfig) {
        *self.config.write().unwrap() = config;
    }

    // ── Connection link ─────────────────────────────────────────────

    /// Gatekeeper: admit at most one connection attempt at a time. Returns
    /// `None` while another attempt or a scheduled reconnect is pending.
    pub fn begin_connect(self: &Arc<Self>) -> Option<ConnectAttempt> {
        let mut link = self.link.lock().unwrap();
        if link.connecting || link.reconnect.is_some() {
            return None;
        }
        link.connecting = true;
        Some(ConnectAttempt {
            network: self.clone(),
        })
    }

    /// Welcome received: install the live handle and reset the backoff
    /// counter. The channel map is wiped here so NAMES repopulates it fresh
    /// after a reconnect.
    pub fn mark_connected(&self, handle: IrcHandle) {
        {
            let mut link = self.link.lock().unwrap();
            link.handle = Some(handle);
            link.connected = true;
            link.attempts = 0;
        }
        self.channels.write().unwrap().clear();
        self.pending_names.lock().unwrap().clear();
    }

    /// Link lost. Returns whether we were connected (callers only announce
    /// a disconnect for links that had reached the welcome).
    pub fn mark_disconnected(&self) -> bool {
        let mut link = self.link.lock().unwrap();
        let was_connected = link.connected;
        link.connected = false;
        link.handle = None;
        was_connected
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().unwrap().connected
    }

    pub fn handle(&self) -> Option<IrcHandle> {
        self.link.lock().unwrap().handle.clone()
    }

    /// Bump the attempt counter and return the next delay in seconds:
    /// `min(120, 2^attempts)`.
    pub fn next_backoff_secs(&self) -> u64 {
        let mut link = self.link.lock().unwrap();
        link.attempts += 1;
        1u64.checked_shl(link.attempts).unwrap_or(u64::MAX).min(120)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.link.lock().unwrap().attempts
    }

    pub fn set_reconnect_task(&self, task: JoinHandle<()>) {
        self.link.lock().unwrap().reconnect = Some(task);
    }

    /// The reconnect timer clears itself when it fires, before retrying.
    pub fn clear_reconnect_task(&self) {
        self.link.lock().unwrap().reconnect = None;
    }

    pub fn cancel_reconnect(&self) {
        if let Some(task) = self.link.lock().unwrap().reconnect.take() {
            task.abort();
        }
    }

    pub fn reconnect_pending(&self) -> bool {
        self.link.lock().unwrap().reconnect.is_some()
    }

    // ── Channel map ─────────────────────────────────────────────────

    /// Insert a channel if absent, preserving the server's casing in the
    /// display name. Returns the channel either way.
    pub fn add_channel(&self, name: &str) -> Arc<ChannelState> {
        let key = name.to_lowercase();
        if let Some(existing) = self.channels.read().unwrap().get(&key) {
            return existing.clone();
        }
        let mut channels = self.channels.write().unwrap();
        channels
            .entry(key)
            .or_insert_with(|| Arc::new(ChannelState::new(name)))
            .clone()
    }

    pub fn remove_channel(&self, name: &str) -> bool {
        self.channels
            .write()
            .unwrap()
            .remove(&name.to_lowercase())
            .is_some()
    }

    pub fn channel(&self, name: &str) -> Option<Arc<ChannelState>> {
        self.channels
            .read()
            .unwrap()
            .get(&name.to_lowercase())
            .cloned()
    }

    /// Lowercased keys of every tracked channel.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.read().unwrap().keys().cloned().collect()
    }

    pub fn set_channel_topic(&self, name: &str, topic: &str) {
        match self.channel(name) {
            Some(channel) => channel.set_topic(topic),
            None => debug!(channel = name, "topic for untracked channel, ignoring"),
        }
    }

    // ── NAMES accumulation ──────────────────────────────────────────

    /// Buffer raw 353 tokens for a channel. The public member list stays
    /// untouched until the exchange finalizes.
    pub fn accumulate_members(&self, channel: &str, raw: Vec<String>) {
        let mut pending = self.pending_names.lock().unwrap();
        pending
            .entry(channel.to_lowercase())
            .or_default()
            .extend(raw);
    }

    /// End of NAMES: parse the buffered tokens, swap the channel's member
    /// list, and hand back (lowercased name, members) for the caller to
    /// fan out. A finalize without prior accumulation is a no-op.
    pub fn finalize_members(&self, channel: &str) -> Option<(String, Vec<ChannelMember>)> {
        let key = channel.to_lowercase();
        let raw = self.pending_names.lock().unwrap().remove(&key)?;

        let members: Vec<ChannelMember> =
            raw.iter().filter_map(|token| parse_member(token)).collect();

        let Some(state) = self.channel(&key) else {
            warn!(channel = %key, "finalized NAMES for untracked channel");
            return None;
        };
        state.replace_members(members.clone());
        Some((key, members))
    }

    // ── Away propagation ────────────────────────────────────────────

    /// Apply an away-notify change across every channel the member is in.
    /// Returns (lowercased name, refreshed member list) per affected channel.
    pub fn update_member_away(
        &self,
        nick: &str,
        is_away: bool,
    ) -> Vec<(String, Vec<ChannelMember>)> {
        let channels: Vec<(String, Arc<ChannelState>)> = self
            .channels
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut affected = Vec::new();
        for (key, channel) in channels {
            if channel.set_member_away(nick, is_away) {
                affected.push((key, channel.members()));
            }
        }
        affected
    }

    /// Lowercased names of channels whose member list contains `nick`.
    pub fn channels_with_member(&self, nick: &str) -> Vec<String> {
        self.channels
            .read()
            .unwrap()
            .iter()
            .filter(|(_, channel)| channel.has_member(nick))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn snapshot(&self) -> NetworkSnapshot {
        let config = self.config.read().unwrap();
        let mut channels: Vec<_> = self
            .channels
            .read()
            .unwrap()
            .values()
            .map(|c| c.snapshot())
            .collect();
        channels.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        NetworkSnapshot {
            id: self.id,
            network_name: config.network_name.clone(),
            is_connected: self.is_connected(),
            channels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> NetworkConfig {
        NetworkConfig {
            id: 1,
            user_id: 1,
            network_name: "testnet".into(),
            hostname: "irc.example.org".into(),
            port: 6697,
            use_ssl: true,
            server_password: String::new(),
            auto_reconnect: true,
            modules: Vec::new(),
            perform_commands: Vec::new(),
            initial_channels: Vec::new(),
            nickname: "alice".into(),
            alt_nickname: "alice_".into(),
            ident: String::new(),
            realname: "Alice".into(),
            quit_message: "bye".into(),
        }
    }

    #[test]
    fn ident_falls_back_to_nickname() {
        let config = test_config();
        assert_eq!(config.effective_ident(), "alice");
        let mut with_ident = test_config();
        with_ident.ident = "al".into();
        assert_eq!(with_ident.effective_ident(), "al");
    }

    #[test]
    fn wants_sasl_requires_module_and_password() {
        let mut config = test_config();
        assert!(!config.wants_sasl());
        config.modules = vec!["SASL".into()];
        assert!(!config.wants_sasl());
        config.server_password = "hunter2".into();
        assert!(config.wants_sasl());
    }

    #[test]
    fn gatekeeper_admits_one_attempt() {
        let network = Arc::new(NetworkState::new(test_config()));
        let attempt = network.begin_connect();
        assert!(attempt.is_some());
        assert!(network.begin_connect().is_none());

        drop(attempt);
        assert!(network.begin_connect().is_some());
    }

    #[tokio::test]
    async fn gatekeeper_blocks_while_reconnect_scheduled() {
        let network = Arc::new(NetworkState::new(test_config()));
        network.set_reconnect_task(tokio::spawn(async {}));
        assert!(network.begin_connect().is_none());
        network.clear_reconnect_task();
        assert!(network.begin_connect().is_some());
    }

    #[test]
    fn backoff_doubles_then_caps_and_resets() {
        let network = Arc::new(NetworkState::new(test_config()));
        assert_eq!(network.next_backoff_secs(), 2);
        assert_eq!(network.next_backoff_secs(), 4);
        assert_eq!(network.next_backoff_secs(), 8);
        assert_eq!(network.next_backoff_secs(), 16);
        for _ in 0..10 {
            network.next_backoff_secs();
        }
        assert_eq!(network.next_backoff_secs(), 120);

        let (handle, _rx) = IrcHandle::channel();
        network.mark_connected(handle);
        assert_eq!(network.reconnect_attempts(), 0);
        assert_eq!(network.next_backoff_secs(), 2);
    }

    #[test]
    fn connect_clears_channels_for_repopulation() {
        let network = Arc::new(NetworkState::new(test_config()));
        network.add_channel("#lobby");
        assert_eq!(network.channel_names().len(), 1);

        let (handle, _rx) = IrcHandle::channel();
        network.mark_connected(handle);
        assert!(network.channel_names().is_empty());
        assert!(network.is_connected());
        assert!(network.handle().is_some());

        assert!(network.mark_disconnected());
        assert!(network.handle().is_none());
        assert!(!network.mark_disconnected());
    }

    #[test]
    fn names_exchange_is_atomic_for_readers() {
        let network = Arc::new(NetworkState::new(test_config()));
        let channel = network.add_channel("#lobby");
        channel.replace_members(vec![parse_member("old").unwrap()]);

        network.accumulate_members("#Lobby", vec!["@alice".into(), "+bob".into()]);
        network.accumulate_members("#lobby", vec!["carol".into(), "~dave".into()]);

        // Mid-exchange readers still see the previous list.
        assert_eq!(channel.members().len(), 1);
        assert_eq!(channel.members()[0].nick, "old");

        let (name, members) = network.finalize_members("#lobby").unwrap();
        assert_eq!(name, "#lobby");
        let nicks: Vec<&str> = members.iter().map(|m| m.nick.as_str()).collect();
        assert_eq!(nicks, vec!["alice", "bob", "carol", "dave"]);
        assert_eq!(channel.members().len(), 4);

        // The buffer is consumed; a second finalize is a no-op.
        assert!(network.finalize_members("#lobby").is_none());
    }

    #[test]
    fn finalize_without_accumulate_is_noop() {
        let network = Arc::new(NetworkState::new(test_config()));
        network.add_channel("#lobby");
        assert!(network.finalize_members("#lobby").is_none());
    }

    #[test]
    fn away_update_touches_only_shared_channels() {
        let network = Arc::new(NetworkState::new(test_config()));
        let lobby = network.add_channel("#lobby");
        let dev = network.add_channel("#dev");
        lobby.replace_members(vec![
            parse_member("bob").unwrap(),
            parse_member("carol").unwrap(),
        ]);
        dev.replace_members(vec![parse_member("carol").unwrap()]);

        let affected = network.update_member_away("bob", true);
        assert_eq!(affected.len(), 1);
        assert_eq!(affected[0].0, "#lobby");
        assert!(affected[0]
            .1
            .iter()
            .find(|m| m.nick == "bob")
            .unwrap()
            .is_away);

        assert_eq!(network.channels_with_member("carol").len(), 2);
    }
}
