use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{PushError, PushNotifier};

const FCM_SEND_URL: &str = "https://fcm.googleapis.com/fcm/send";

/// Firebase Cloud Messaging transport. Sends data-only messages so the
/// client app renders the notification itself in background/terminated
/// states. High priority wakes sleeping Android devices;
/// `content_available` does the same for iOS.
pub struct FcmPush {
    client: reqwest::Client,
    server_key: String,
}

#[derive(Serialize)]
struct FcmMessage<'a> {
    to: &'a str,
    priority: &'a str,
    content_available: bool,
    data: HashMap<String, String>,
}

impl FcmPush {
    pub fn new(server_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            server_key: server_key.trim().to_string(),
        }
    }

    /// Load the server key from a credentials file. The file holds either
    /// the bare key or a JSON object with a `server_key` field.
    pub fn from_credentials_file(path: &Path) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let key = match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(map)) => map
                .get("server_key")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "credentials file missing server_key",
                    )
                })?,
            _ => contents,
        };
        info!("FCM push transport configured");
        Ok(Self::new(&key))
    }
}

#[async_trait]
impl PushNotifier for FcmPush {
    async fn send(
        &self,
        token: &str,
        title: &str,
        body: &str,
        mut data: HashMap<String, String>,
    ) -> Result<(), PushError> {
        // Everything rides in the data map; the Notification field is
        // intentionally absent.
        data.insert("title".to_string(), title.to_string());
        data.insert("body".to_string(), body.to_string());

        let message = FcmMessage {
            to: token,
            priority: "high",
            content_available: true,
            data,
        };

        let response = self
            .client
            .post(FCM_SEND_URL)
            .header("Authorization", format!("key={}", self.server_key))
            .json(&message)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(PushError::Rejected(format!("{status}: {detail}")));
        }

        debug!(%title, "push notification delivered");
        Ok(())
    }
}
