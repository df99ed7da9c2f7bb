pub mod fcm;

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

pub use fcm::FcmPush;

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("push request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("push rejected: {0}")]
    Rejected(String),
}

/// Outbound notification transport. Implementations must be safe to call
/// concurrently; the gateway fires pushes from connection tasks.
#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn send(
        &self,
        token: &str,
        title: &str,
        body: &str,
        data: HashMap<String, String>,
    ) -> Result<(), PushError>;
}

/// Stand-in used when no push credentials are configured. Drops every
/// notification, loudly enough for debugging.
pub struct NoopPush;

#[async_trait]
impl PushNotifier for NoopPush {
    async fn send(
        &self,
        _token: &str,
        title: &str,
        _body: &str,
        _data: HashMap<String, String>,
    ) -> Result<(), PushError> {
        debug!(%title, "push transport not configured, dropping notification");
        Ok(())
    }
}
