use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::session::events::ServerEvent;
use crate::session::history::StoredMessage;

use super::client::{schedule_reconnect, ConnectContext, ConnectError, IrcHandle};
use super::proto::IrcMessage;
use super::sasl;

/// Gap between successive NAMES requests in a sweep.
const NAMES_SWEEP_GAP: Duration = Duration::from_millis(150);
/// Gap between NAMES requests after the channel LIST completes.
const LIST_NAMES_GAP: Duration = Duration::from_millis(100);

/// Capabilities requested from every server; `sasl` is added when the
/// network is configured for it.
const REQUESTED_CAPS: &[&str] = &[
    "server-time",
    "away-notify",
    "multi-prefix",
    "draft/chathistory",
];

/// True when `text` mentions `nick` as a whole word, case-insensitively.
/// A substring match is not enough: `alice` must not fire inside `malice`.
pub fn mentions_nick(nick: &str, text: &str) -> bool {
    let pattern = format!(r"(?i)\b{}\b", regex::escape(nick));
    match Regex::new(&pattern) {
        Ok(re) => re.is_match(text),
        Err(_) => false,
    }
}

#[derive(Default)]
struct Negotiation {
    offered: Vec<String>,
    cap_ended: bool,
}

/// The per-connection translator from parsed wire events to state mutations
/// and fan-out. Exactly one handler observes each connection's stream.
pub struct IrcEventHandler {
    ctx: ConnectContext,
    handle: IrcHandle,
    outcome: mpsc::Sender<Result<(), ConnectError>>,
    negotiation: Mutex<Negotiation>,
    /// Nick the server actually knows us by (may be the alt nickname).
    current_nick: Mutex<String>,
    last_error: Mutex<Option<String>>,
}

impl IrcEventHandler {
    pub fn new(
        ctx: ConnectContext,
        handle: IrcHandle,
        outcome: mpsc::Sender<Result<(), ConnectError>>,
    ) -> Self {
        let nickname = ctx.network.config().nickname;
        Self {
            ctx,
            handle,
            outcome,
            negotiation: Mutex::new(Negotiation::default()),
            current_nick: Mutex::new(nickname),
            last_error: Mutex::new(None),
        }
    }

    pub fn handle(&self, msg: IrcMessage) {
        match msg.command.as_str() {
            "001" => self.on_welcome(&msg),
            "322" => self.on_list_entry(&msg),
            "323" => self.on_list_end(),
            "332" => self.on_topic_reply(&msg),
            "353" => self.on_names_reply(&msg),
            "366" => self.on_names_end(&msg),
            "903" => self.cap_end(),
            "904" | "905" => self.on_sasl_failure(&msg),
            "CAP" => self.on_cap(&msg),
            "AUTHENTICATE" => self.on_authenticate(&msg),
            "PING" => self.on_ping(&msg),
            "JOIN" => self.on_join(&msg),
            "PART" => self.on_part(&msg),
            "QUIT" => self.on_quit(&msg),
            "KICK" => self.on_kick(&msg),
            "TOPIC" => self.on_topic(&msg),
            "AWAY" => self.on_away(&msg),
            "PRIVMSG" => self.on_privmsg(&msg),
            "NOTICE" => self.on_notice(&msg),
            "INVITE" => self.on_invite(&msg),
            "BATCH" => self.on_batch(&msg),
            "ERROR" => {
                let reason = msg.params.first().cloned().unwrap_or_default();
                warn!(network_id = self.ctx.network.id, %reason, "server ERROR");
                *self.last_error.lock().unwrap() = Some(reason);
            }
            other => trace!(command = other, "unhandled wire event"),
        }
    }

    /// Does this nick refer to us on this connection? The server may have
    /// registered us under the alternate nickname.
    fn is_self(&self, nick: &str) -> bool {
        if nick.is_empty() {
            return false;
        }
        if self.current_nick.lock().unwrap().eq_ignore_ascii_case(nick) {
            return true;
        }
        let config = self.ctx.network.config();
        config.nickname.eq_ignore_ascii_case(nick)
            || (!config.alt_nickname.is_empty() && config.alt_nickname.eq_ignore_ascii_case(nick))
    }

    // ── Registration ────────────────────────────────────────────────

    fn on_welcome(&self, msg: &IrcMessage) {
        let config = self.ctx.network.config();
        let nickname = msg
            .params
            .first()
            .cloned()
            .unwrap_or_else(|| config.nickname.clone());
        *self.current_nick.lock().unwrap() = nickname.clone();

        info!(network = %config.network_name, %nickname, "welcome received");
        self.cap_end();
        self.ctx.network.mark_connected(self.handle.clone());
        let _ = self.outcome.try_send(Ok(()));

        self.ctx.session.broadcast(&ServerEvent::NetworkConnect {
            network_id: self.ctx.network.id,
            network_name: config.network_name.clone(),
            status: "connected".into(),
            nickname,
        });

        // Channel discovery. Servers that refuse LIST simply never send
        // 323; channels then appear through explicit JOINs only.
        self.handle.send_raw("LIST");
    }

    fn cap_end(&self) {
        let mut negotiation = self.negotiation.lock().unwrap();
        if !negotiation.cap_ended {
            negotiation.cap_ended = true;
            self.handle.send_raw("CAP END");
        }
    }

    fn on_cap(&self, msg: &IrcMessage) {
        let sub = msg.params.get(1).map(String::as_str).unwrap_or("");
        let caps = msg.params.last().cloned().unwrap_or_default();

        match sub {
            "LS" => {
                let request = {
                    let mut negotiation = self.negotiation.lock().unwrap();
                    negotiation.offered.extend(
                        caps.split_whitespace()
                            .map(|c| c.split('=').next().unwrap_or(c).to_string()),
                    );
                    // A `*` before the cap list marks a continued LS reply.
                    if msg.params.get(2).map(String::as_str) == Some("*") {
                        return;
                    }
                    let mut wanted: Vec<&str> = REQUESTED_CAPS.to_vec();
                    if self.ctx.network.config().wants_sasl() {
                        wanted.push("sasl");
                    }
                    let request: Vec<&str> = wanted
                        .into_iter()
                        .filter(|w| negotiation.offered.iter().any(|o| o.as_str() == *w))
                        .collect();
                    request.join(" ")
                };
                if request.is_empty() {
                    self.cap_end();
                } else {
                    self.handle.send_raw(format!("CAP REQ :{request}"));
                }
            }
            "ACK" => {
                if caps.split_whitespace().any(|c| c == "sasl")
                    && self.ctx.network.config().wants_sasl()
                {
                    self.handle.send_raw("AUTHENTICATE PLAIN");
                } else {
                    self.cap_end();
                }
            }
            "NAK" => self.cap_end(),
            _ => {}
        }
    }

    fn on_authenticate(&self, msg: &IrcMessage) {
        if msg.params.first().map(String::as_str) == Some("+") {
            let config = self.ctx.network.config();
            self.handle.send_raw(format!(
                "AUTHENTICATE {}",
                sasl::encode_plain(&config.nickname, &config.server_password)
            ));
        }
    }

    fn on_sasl_failure(&self, msg: &IrcMessage) {
        let reason = msg.params.last().cloned().unwrap_or_default();
        warn!(network_id = self.ctx.network.id, %reason, "SASL failure");
        let _ = self.outcome.try_send(Err(ConnectError::Auth(reason)));
    }

    fn on_ping(&self, msg: &IrcMessage) {
        let token = msg.params.first().cloned().unwrap_or_default();
        self.handle.send_raw(format!("PONG {token}"));
    }

    // ── Channel discovery and membership ────────────────────────────

    fn on_list_entry(&self, msg: &IrcMessage) {
        if let Some(channel) = msg.params.get(1) {
            self.ctx.network.add_channel(channel);
        }
    }

    fn on_list_end(&self) {
        let channels = self.ctx.network.channel_names();
        debug!(count = channels.len(), "LIST complete, sweeping NAMES");
        let handle = self.handle.clone();
        tokio::spawn(async move {
            for channel in channels {
                handle.names(&channel);
                tokio::time::sleep(LIST_NAMES_GAP).await;
            }
        });
    }

    fn on_join(&self, msg: &IrcMessage) {
        let Some(channel) = msg.params.first().cloned() else {
            return;
        };
        let user = msg.nick().to_string();

        if self.is_self(&user) {
            info!(network_id = self.ctx.network.id, %channel, "joined channel");
            self.ctx.network.add_channel(&channel);
            self.ctx.session.broadcast(&ServerEvent::ChannelJoin {
                network_id: self.ctx.network.id,
                name: channel.clone(),
                user,
            });
            self.handle.names(&channel);
            self.handle.request_topic(&channel);
        } else {
            self.handle.names(&channel);
        }
    }

    fn on_part(&self, msg: &IrcMessage) {
        let Some(channel) = msg.params.first().cloned() else {
            return;
        };
        let user = msg.nick().to_string();

        if self.is_self(&user) {
            info!(network_id = self.ctx.network.id, %channel, "parted channel");
            self.ctx.network.remove_channel(&channel);
            self.ctx.session.broadcast(&ServerEvent::ChannelPart {
                network_id: self.ctx.network.id,
                name: channel,
                user,
            });
        } else {
            self.handle.names(&channel);
        }
    }

    fn on_quit(&self, msg: &IrcMessage) {
        let quitter = msg.nick().to_string();
        let affected = self.ctx.network.channels_with_member(&quitter);
        if affected.is_empty() {
            return;
        }
        let handle = self.handle.clone();
        tokio::spawn(async move {
            for channel in affected {
                handle.names(&channel);
                tokio::time::sleep(NAMES_SWEEP_GAP).await;
            }
        });
    }

    fn on_kick(&self, msg: &IrcMessage) {
        let (Some(channel), Some(target)) = (msg.params.first().cloned(), msg.params.get(1)) else {
            return;
        };

        if self.is_self(target) {
            info!(network_id = self.ctx.network.id, %channel, "kicked from channel");
            self.ctx.network.remove_channel(&channel);
            self.ctx.session.broadcast(&ServerEvent::ChannelPart {
                network_id: self.ctx.network.id,
                name: channel,
                user: target.clone(),
            });
        } else {
            self.handle.names(&channel);
        }
    }

    // ── NAMES exchange ──────────────────────────────────────────────

    fn on_names_reply(&self, msg: &IrcMessage) {
        if msg.params.len() < 4 {
            return;
        }
        let channel = &msg.params[msg.params.len() - 2];
        let raw: Vec<String> = msg.params[msg.params.len() - 1]
            .split_whitespace()
            .map(str::to_string)
            .collect();
        self.ctx.network.accumulate_members(channel, raw);
    }

    fn on_names_end(&self, msg: &IrcMessage) {
        let Some(channel) = msg.params.get(1) else {
            return;
        };
        if let Some((name, members)) = self.ctx.network.finalize_members(channel) {
            self.ctx.session.broadcast(&ServerEvent::MembersUpdate {
                network_id: self.ctx.network.id,
                channel_name: name,
                members,
            });
        }
    }

    // ── Topic ───────────────────────────────────────────────────────

    fn on_topic_reply(&self, msg: &IrcMessage) {
        if msg.params.len() < 3 {
            return;
        }
        let channel = msg.params[1].clone();
        let topic = msg.params[2].clone();
        self.ctx.network.set_channel_topic(&channel, &topic);
        self.ctx.session.broadcast(&ServerEvent::TopicChange {
            network_id: self.ctx.network.id,
            channel,
            topic,
            set_by: String::new(),
        });
    }

    fn on_topic(&self, msg: &IrcMessage) {
        if msg.params.len() < 2 {
            return;
        }
        let channel = msg.params[0].clone();
        let topic = msg.params[1].clone();
        self.ctx.network.set_channel_topic(&channel, &topic);
        self.ctx.session.broadcast(&ServerEvent::TopicChange {
            network_id: self.ctx.network.id,
            channel,
            topic,
            set_by: msg.nick().to_string(),
        });
    }

    // ── Away-notify ─────────────────────────────────────────────────

    fn on_away(&self, msg: &IrcMessage) {
        let nick = msg.nick().to_string();
        let is_away = msg.params.last().map(|m| !m.is_empty()).unwrap_or(false);

        for (channel_name, members) in self.ctx.network.update_member_away(&nick, is_away) {
            self.ctx.session.broadcast(&ServerEvent::MembersUpdate {
                network_id: self.ctx.network.id,
                channel_name,
                members,
            });
        }
    }

    // ── Messages ────────────────────────────────────────────────────

    fn on_privmsg(&self, msg: &IrcMessage) {
        if msg.params.len() < 2 {
            return;
        }
        let target = msg.params[0].clone();
        let text = msg.params[1].clone();
        let sender = msg.nick().to_string();

        let is_private = !(target.starts_with('#') || target.starts_with('&'));
        let conversation = if is_private {
            sender.to_lowercase()
        } else {
            target.to_lowercase()
        };

        let timestamp = msg.server_time().unwrap_or_else(Utc::now);
        let stored = StoredMessage {
            network_id: self.ctx.network.id,
            channel: conversation.clone(),
            sender: sender.clone(),
            text: text.clone(),
            timestamp,
        };
        self.ctx.history.append(stored.clone());
        if let Some(channel) = self.ctx.network.channel(&conversation) {
            channel.append_message(stored, self.ctx.session.max_scrollback());
        }

        let id = format!(
            "msg_{}_{}",
            timestamp.timestamp_nanos_opt().unwrap_or_default(),
            sender
        );
        self.ctx.session.broadcast(&ServerEvent::Message {
            network_id: self.ctx.network.id,
            channel_name: conversation.clone(),
            sender: sender.clone(),
            text: text.clone(),
            time: timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            id,
        });

        self.maybe_push(is_private, &target, &conversation, &sender, &text);
    }

    /// Push only when no client is attached and a push address exists:
    /// DMs to us from someone else, and channel messages that mention our
    /// nick as a whole word.
    fn maybe_push(
        &self,
        is_private: bool,
        target: &str,
        conversation: &str,
        sender: &str,
        text: &str,
    ) {
        if self.ctx.session.is_active() {
            return;
        }
        let Some(token) = self.ctx.session.fcm_token() else {
            return;
        };
        let config = self.ctx.network.config();

        let (title, body, kind) = if is_private && self.is_self(target) && !self.is_self(sender) {
            (
                format!("DM from {} on {}", sender, config.network_name),
                text.to_string(),
                "dm",
            )
        } else if !is_private && !self.is_self(sender) && mentions_nick(&config.nickname, text) {
            (
                format!("Mention in {} on {}", target, config.network_name),
                format!("{sender}: {text}"),
                "mention",
            )
        } else {
            return;
        };

        let mut data = HashMap::new();
        data.insert("network_id".to_string(), self.ctx.network.id.to_string());
        data.insert("channel_name".to_string(), conversation.to_string());
        data.insert("sender".to_string(), sender.to_string());
        data.insert("type".to_string(), kind.to_string());

        let push = self.ctx.push.clone();
        let username = self.ctx.session.username.clone();
        tokio::spawn(async move {
            if let Err(e) = push.send(&token, &title, &body, data).await {
                warn!(user = %username, error = %e, "push send failed");
            }
        });
    }

    fn on_notice(&self, msg: &IrcMessage) {
        if msg.params.len() < 2 {
            return;
        }
        let mut sender = msg.nick().to_string();
        if sender.is_empty() {
            sender = msg.prefix.clone().unwrap_or_default();
        }
        self.ctx.session.broadcast(&ServerEvent::Notice {
            network_id: self.ctx.network.id,
            channel_name: msg.params[0].clone(),
            sender,
            text: msg.params[1].clone(),
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        });
    }

    fn on_invite(&self, msg: &IrcMessage) {
        let Some(channel) = msg.params.get(1) else {
            return;
        };
        info!(network_id = self.ctx.network.id, %channel, "invited, joining");
        self.handle.join(channel);
    }

    /// Historical message replayed inside a `chathistory-messages` batch.
    /// Stored with the server-time tag as its timestamp. Not fanned out;
    /// clients pick history up through the history endpoint.
    fn on_batch(&self, msg: &IrcMessage) {
        if msg.params.len() < 4 || msg.params[1] != "chathistory-messages" {
            return;
        }
        let channel = msg.params[2].to_lowercase();
        let text = msg.params.last().cloned().unwrap_or_default();
        let timestamp = msg.server_time().unwrap_or_else(Utc::now);

        self.ctx.history.append(StoredMessage {
            network_id: self.ctx.network.id,
            channel,
            sender: msg.nick().to_string(),
            text,
            timestamp,
        });
    }

    // ── Disconnect ──────────────────────────────────────────────────

    /// Called when the receive loop ends, for any reason. Announces the
    /// drop if the link had been established and schedules the backoff
    /// retry for auto-reconnect networks.
    pub fn on_disconnect(&self) {
        let reason = self
            .last_error
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| "connection closed".to_string());

        // Unblock a registration still waiting on the welcome. If an auth
        // failure was already delivered, that one wins.
        let _ = self.outcome.try_send(Err(ConnectError::Closed));

        let was_connected = self.ctx.network.mark_disconnected();
        if !was_connected {
            return;
        }

        let config = self.ctx.network.config();
        info!(network = %config.network_name, %reason, "disconnected");
        self.ctx.session.broadcast(&ServerEvent::NetworkDisconnect {
            network_id: self.ctx.network.id,
            network_name: config.network_name.clone(),
            status: "disconnected".into(),
            reason,
        });

        if config.auto_reconnect {
            schedule_reconnect(&self.ctx);
        }
    }
}
