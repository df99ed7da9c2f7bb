use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::ChannelSnapshot;
use super::history::StoredMessage;

/// Channel-mode rank prefixes, highest first: owner, admin, op, halfop, voice.
const MEMBER_PREFIXES: &str = "~&@%+";

/// One entry in a channel's member list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelMember {
    pub nick: String,
    /// At most one character from `~&@%+`; empty means no mode.
    pub prefix: String,
    pub is_away: bool,
}

/// Split a raw NAMES token into (prefix, nick). A token carries at most one
/// leading rank character; the remainder is the nick verbatim.
pub fn parse_member(raw: &str) -> Option<ChannelMember> {
    if raw.is_empty() {
        return None;
    }
    let first = raw.chars().next().unwrap();
    let (prefix, nick) = if MEMBER_PREFIXES.contains(first) {
        (first.to_string(), &raw[first.len_utf8()..])
    } else {
        (String::new(), raw)
    };
    Some(ChannelMember {
        nick: nick.to_string(),
        prefix,
        is_away: false,
    })
}

/// The authoritative in-memory view of one IRC channel for one network.
///
/// `name` keeps the case the server used; lookups key on the lowercased
/// form. The member list is only ever replaced wholesale, so readers never
/// observe a half-accumulated NAMES exchange.
pub struct ChannelState {
    pub name: String,
    inner: Mutex<ChannelInner>,
}

struct ChannelInner {
    topic: String,
    members: Vec<ChannelMember>,
    last_update: DateTime<Utc>,
    scrollback: VecDeque<StoredMessage>,
}

impl ChannelState {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: Mutex::new(ChannelInner {
                topic: String::new(),
                members: Vec::new(),
                last_update: Utc::now(),
                scrollback: VecDeque::new(),
            }),
        }
    }

    pub fn set_topic(&self, topic: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.topic = topic.to_string();
        inner.last_update = Utc::now();
    }

    pub fn topic(&self) -> String {
        self.inner.lock().unwrap().topic.clone()
    }

    /// Swap in a finalized member list from a completed NAMES exchange.
    pub fn replace_members(&self, members: Vec<ChannelMember>) {
        let mut inner = self.inner.lock().unwrap();
        inner.members = members;
        inner.last_update = Utc::now();
    }

    pub fn members(&self) -> Vec<ChannelMember> {
        self.inner.lock().unwrap().members.clone()
    }

    /// Flip a member's away flag. Returns false when the nick is not present
    /// or the flag already matched.
    pub fn set_member_away(&self, nick: &str, is_away: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(member) = inner
            .members
            .iter_mut()
            .find(|m| m.nick.eq_ignore_ascii_case(nick))
        else {
            return false;
        };
        if member.is_away == is_away {
            return false;
        }
        member.is_away = is_away;
        inner.last_update = Utc::now();
        true
    }

    pub fn has_member(&self, nick: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .members
            .iter()
            .any(|m| m.nick.eq_ignore_ascii_case(nick))
    }

    /// Push onto scrollback, discarding from the front past `max_lines`.
    pub fn append_message(&self, message: StoredMessage, max_lines: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.scrollback.push_back(message);
        while inner.scrollback.len() > max_lines {
            inner.scrollback.pop_front();
        }
        inner.last_update = Utc::now();
    }

    pub fn scrollback(&self) -> Vec<StoredMessage> {
        self.inner.lock().unwrap().scrollback.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        let inner = self.inner.lock().unwrap();
        ChannelSnapshot {
            name: self.name.clone(),
            topic: inner.topic.clone(),
            members: inner.members.clone(),
            last_update: inner.last_update,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(text: &str) -> StoredMessage {
        StoredMessage {
            network_id: 1,
            channel: "#lobby".into(),
            sender: "alice".into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn parse_member_strips_one_prefix() {
        assert_eq!(
            parse_member("@alice").unwrap(),
            ChannelMember {
                nick: "alice".into(),
                prefix: "@".into(),
                is_away: false
            }
        );
        assert_eq!(parse_member("carol").unwrap().prefix, "");
        assert_eq!(parse_member("~dave").unwrap().prefix, "~");
        // Only the first rank character is a prefix.
        let double = parse_member("@+eve").unwrap();
        assert_eq!(double.prefix, "@");
        assert_eq!(double.nick, "+eve");
        assert!(parse_member("").is_none());
    }

    #[test]
    fn replace_members_preserves_order() {
        let channel = ChannelState::new("#Lobby");
        let parsed: Vec<ChannelMember> = ["@alice", "+bob", "carol", "~dave"]
            .iter()
            .filter_map(|raw| parse_member(raw))
            .collect();
        channel.replace_members(parsed);

        let members = channel.members();
        assert_eq!(members.len(), 4);
        assert_eq!(members[0].nick, "alice");
        assert_eq!(members[0].prefix, "@");
        assert_eq!(members[1].nick, "bob");
        assert_eq!(members[1].prefix, "+");
        assert_eq!(members[2].prefix, "");
        assert_eq!(members[3].prefix, "~");
        assert!(members.iter().all(|m| !m.is_away));
    }

    #[test]
    fn scrollback_stays_bounded() {
        let channel = ChannelState::new("#lobby");
        for i in 0..12 {
            channel.append_message(stored(&format!("line {i}")), 10);
        }
        let scrollback = channel.scrollback();
        assert_eq!(scrollback.len(), 10);
        assert_eq!(scrollback[0].text, "line 2");
        assert_eq!(scrollback[9].text, "line 11");
    }

    #[test]
    fn set_member_away_reports_changes() {
        let channel = ChannelState::new("#lobby");
        channel.replace_members(vec![parse_member("bob").unwrap()]);

        assert!(channel.set_member_away("BOB", true));
        assert!(!channel.set_member_away("bob", true));
        assert!(channel.members()[0].is_away);
        assert!(!channel.set_member_away("nobody", true));
    }

    #[test]
    fn snapshot_keeps_original_case() {
        let channel = ChannelState::new("#Lobby");
        channel.set_topic("welcome");
        let snapshot = channel.snapshot();
        assert_eq!(snapshot.name, "#Lobby");
        assert_eq!(snapshot.topic, "welcome");
    }
}
