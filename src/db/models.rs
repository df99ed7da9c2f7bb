use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::warn;

use crate::session::network::NetworkConfig;

/// A stored user account.
#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub hashed_password: String,
    pub is_suspended: bool,
    pub created_at: NaiveDateTime,
}

/// A stored IRC network configuration. The JSON-array columns are decoded
/// into the in-memory config on load.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NetworkRow {
    pub id: i64,
    pub user_id: i64,
    pub network_name: String,
    pub hostname: String,
    pub port: i64,
    pub use_ssl: bool,
    pub server_password: Option<String>,
    pub auto_reconnect: bool,
    pub modules: Option<String>,
    pub perform_commands: Option<String>,
    pub initial_channels: Option<String>,
    pub nickname: String,
    pub alt_nickname: Option<String>,
    pub ident: Option<String>,
    pub realname: Option<String>,
    pub quit_message: Option<String>,
}

fn decode_string_list(column: &str, raw: &Option<String>, network_id: i64) -> Vec<String> {
    let Some(raw) = raw.as_deref().filter(|r| !r.is_empty()) else {
        return Vec::new();
    };
    match serde_json::from_str(raw) {
        Ok(list) => list,
        Err(e) => {
            warn!(network_id, column, error = %e, "malformed JSON column, treating as empty");
            Vec::new()
        }
    }
}

impl NetworkRow {
    pub fn into_config(self) -> NetworkConfig {
        let modules = decode_string_list("modules", &self.modules, self.id);
        let perform_commands =
            decode_string_list("perform_commands", &self.perform_commands, self.id);
        let initial_channels =
            decode_string_list("initial_channels", &self.initial_channels, self.id);

        NetworkConfig {
            id: self.id,
            user_id: self.user_id,
            network_name: self.network_name,
            hostname: self.hostname,
            port: self.port as u16,
            use_ssl: self.use_ssl,
            server_password: self.server_password.unwrap_or_default(),
            auto_reconnect: self.auto_reconnect,
            modules,
            perform_commands,
            initial_channels,
            nickname: self.nickname,
            alt_nickname: self.alt_nickname.unwrap_or_default(),
            ident: self.ident.unwrap_or_default(),
            realname: self.realname.unwrap_or_default(),
            quit_message: self.quit_message.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> NetworkRow {
        NetworkRow {
            id: 1,
            user_id: 2,
            network_name: "libera".into(),
            hostname: "irc.libera.chat".into(),
            port: 6697,
            use_ssl: true,
            server_password: None,
            auto_reconnect: true,
            modules: Some(r#"["sasl"]"#.into()),
            perform_commands: None,
            initial_channels: Some(r##"["#rust","#tokio"]"##.into()),
            nickname: "alice".into(),
            alt_nickname: None,
            ident: None,
            realname: Some("Alice".into()),
            quit_message: None,
        }
    }

    #[test]
    fn json_columns_decode() {
        let config = row().into_config();
        assert_eq!(config.modules, vec!["sasl"]);
        assert_eq!(config.initial_channels, vec!["#rust", "#tokio"]);
        assert!(config.perform_commands.is_empty());
        assert_eq!(config.port, 6697);
    }

    #[test]
    fn malformed_json_column_is_empty() {
        let mut bad = row();
        bad.modules = Some("not json".into());
        let config = bad.into_config();
        assert!(config.modules.is_empty());
    }
}
