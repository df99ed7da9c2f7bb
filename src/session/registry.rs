use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use super::user_session::UserSession;

/// Token → session index. Several tokens may point at the same session
/// (one per device); the index itself owns nothing but the mapping.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<UserSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, token: &str, session: Arc<UserSession>) {
        info!(user = %session.username, "session token mapped");
        self.sessions.insert(token.to_string(), session);
    }

    pub fn get(&self, token: &str) -> Option<Arc<UserSession>> {
        self.sessions.get(token).map(|entry| entry.value().clone())
    }

    /// Drop one token without touching the session; used when re-issuing
    /// tokens so other devices stay attached.
    pub fn unmap(&self, token: &str) {
        self.sessions.remove(token);
    }

    /// Drop a token and, if it was the session's last alias, tear the
    /// session down (quit networks, cancel reconnects, close sockets).
    pub fn remove(&self, token: &str) {
        let Some((_, session)) = self.sessions.remove(token) else {
            return;
        };
        let aliased = self
            .sessions
            .iter()
            .any(|entry| Arc::ptr_eq(entry.value(), &session));
        if !aliased {
            session.teardown();
        }
    }

    /// Case-insensitive scan; any one token for the username will do.
    pub fn find_token_by_username(&self, username: &str) -> Option<String> {
        self.sessions
            .iter()
            .find(|entry| entry.value().username.eq_ignore_ascii_case(username))
            .map(|entry| entry.key().clone())
    }

    /// Any live session for the username, regardless of token.
    pub fn find_session_by_username(&self, username: &str) -> Option<Arc<UserSession>> {
        self.sessions
            .iter()
            .find(|entry| entry.value().username.eq_ignore_ascii_case(username))
            .map(|entry| entry.value().clone())
    }

    /// Snapshot iteration over every mapped session.
    pub fn for_each<F: FnMut(&Arc<UserSession>)>(&self, mut f: F) {
        for entry in self.sessions.iter() {
            f(entry.value());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(username: &str) -> Arc<UserSession> {
        Arc::new(UserSession::new(1, username, 500))
    }

    #[test]
    fn tokens_alias_one_session() {
        let registry = SessionRegistry::new();
        let alice = session("alice");
        registry.add("t1", alice.clone());
        registry.add("t2", alice.clone());

        assert!(Arc::ptr_eq(&registry.get("t1").unwrap(), &registry.get("t2").unwrap()));

        registry.unmap("t1");
        assert!(registry.get("t1").is_none());
        assert!(registry.get("t2").is_some());
    }

    #[test]
    fn remove_spares_shared_sessions() {
        let registry = SessionRegistry::new();
        let alice = session("alice");
        registry.add("t1", alice.clone());
        registry.add("t2", alice.clone());

        registry.remove("t1");
        // The session survives through the second token.
        assert!(registry.get("t2").is_some());
        registry.remove("t2");
        assert!(registry.get("t2").is_none());
    }

    #[test]
    fn username_lookup_is_case_insensitive() {
        let registry = SessionRegistry::new();
        registry.add("t1", session("Alice"));

        assert_eq!(registry.find_token_by_username("alice").as_deref(), Some("t1"));
        assert_eq!(
            registry.find_session_by_username("ALICE").unwrap().username,
            "Alice"
        );
        assert!(registry.find_token_by_username("bob").is_none());
    }

    #[test]
    fn for_each_visits_every_mapping() {
        let registry = SessionRegistry::new();
        let alice = session("alice");
        registry.add("t1", alice.clone());
        registry.add("t2", alice);
        registry.add("t3", session("bob"));

        let mut seen = 0;
        registry.for_each(|_| seen += 1);
        assert_eq!(seen, 3);
    }
}
