use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

/// One relayed message, as stored in scrollback and in the shared history.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub network_id: i64,
    /// Lowercased conversation key (channel name, or peer nick for DMs).
    pub channel: String,
    pub sender: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Process-wide message log, keyed by (network id, lowercased channel).
///
/// Appends prune anything older than the retention window, so a key's log
/// never grows past what the window admits. Lookup/creation of a key is
/// guarded by the registry lock; appends and reads take only the per-key
/// lock.
pub struct HistoryStore {
    entries: RwLock<HashMap<(i64, String), Arc<Mutex<Vec<StoredMessage>>>>>,
    retention: Duration,
}

impl HistoryStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            retention,
        }
    }

    fn entry(&self, network_id: i64, channel: &str) -> Arc<Mutex<Vec<StoredMessage>>> {
        let key = (network_id, channel.to_lowercase());
        if let Some(existing) = self.entries.read().unwrap().get(&key) {
            return existing.clone();
        }
        let mut entries = self.entries.write().unwrap();
        entries.entry(key).or_default().clone()
    }

    /// Append a message and drop everything older than the retention window.
    pub fn append(&self, message: StoredMessage) {
        let entry = self.entry(message.network_id, &message.channel);
        let mut log = entry.lock().unwrap();
        log.push(message);

        let cutoff = Utc::now() - self.retention;
        let first_valid = log.iter().position(|m| m.timestamp > cutoff);
        match first_valid {
            Some(0) => {}
            Some(idx) => {
                debug!(pruned = idx, "dropped expired history messages");
                log.drain(..idx);
            }
            None => log.clear(),
        }
    }

    /// Copy out a key's messages, optionally only those after `since`,
    /// optionally only the trailing `limit`.
    pub fn get(
        &self,
        network_id: i64,
        channel: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Vec<StoredMessage> {
        let key = (network_id, channel.to_lowercase());
        let Some(entry) = self.entries.read().unwrap().get(&key).cloned() else {
            return Vec::new();
        };

        let log = entry.lock().unwrap();
        let mut messages: Vec<StoredMessage> = match since {
            Some(cutoff) => log.iter().filter(|m| m.timestamp > cutoff).cloned().collect(),
            None => log.clone(),
        };
        if let Some(limit) = limit {
            if messages.len() > limit {
                messages.drain(..messages.len() - limit);
            }
        }
        messages
    }
}
