use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::channel::ChannelMember;

/// Server-to-client event pushed over every WebSocket attached to a session.
/// Wire format is `{"type": "...", "payload": {...}}`, which is what the
/// adjacent tagging below produces.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Full server-side truth, sent once when a client attaches.
    InitialState { networks: Vec<NetworkSnapshot> },

    NetworkConnect {
        network_id: i64,
        network_name: String,
        status: String,
        nickname: String,
    },

    NetworkDisconnect {
        network_id: i64,
        network_name: String,
        /// "disconnected" for a lost link, "failed" for a connect attempt
        /// that never reached the welcome.
        status: String,
        reason: String,
    },

    ChannelJoin {
        network_id: i64,
        name: String,
        user: String,
    },

    ChannelPart {
        network_id: i64,
        name: String,
        user: String,
    },

    /// Finalized member list after a NAMES exchange or an away-notify change.
    MembersUpdate {
        network_id: i64,
        channel_name: String,
        members: Vec<ChannelMember>,
    },

    TopicChange {
        network_id: i64,
        channel: String,
        topic: String,
        /// Empty when the topic arrived with the join burst (332).
        set_by: String,
    },

    Message {
        network_id: i64,
        channel_name: String,
        sender: String,
        text: String,
        /// RFC3339 UTC.
        time: String,
        id: String,
    },

    Notice {
        network_id: i64,
        channel_name: String,
        sender: String,
        text: String,
        time: String,
    },

    UserAway { username: String, message: String },

    UserBack { username: String },

    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        network_id: Option<i64>,
    },
}

/// Per-network slice of the `initial_state` payload.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkSnapshot {
    pub id: i64,
    pub network_name: String,
    pub is_connected: bool,
    pub channels: Vec<ChannelSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub name: String,
    pub topic: String,
    pub members: Vec<ChannelMember>,
    pub last_update: DateTime<Utc>,
}

/// Envelope of a client-to-server WebSocket frame. The payload is parsed in
/// a second step so an unrecognized `type` can be logged with its name and
/// dropped.
#[derive(Debug, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Payload of a client `message` frame.
#[derive(Debug, Deserialize)]
pub struct SendMessagePayload {
    pub network_id: i64,
    pub channel_name: String,
    pub text: String,
}

/// Payload of a client `topic_change` frame.
#[derive(Debug, Deserialize)]
pub struct SetTopicPayload {
    pub network_id: i64,
    pub channel: String,
    pub topic: String,
}
