use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// Top-level gateway configuration, loaded from vestibule.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerSection,
    pub database: DatabaseSection,
    pub history: HistorySection,
    pub push: PushSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub listen_addr: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub url: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: "sqlite:vestibule.db?mode=rwc".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    /// How long relayed messages stay readable, in hours.
    pub retention_hours: i64,
    /// Per-channel in-memory scrollback cap.
    pub max_scrollback_lines: usize,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            retention_hours: 168, // 7 days
            max_scrollback_lines: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PushSection {
    /// Path to the FCM credentials file. Push is disabled when unset.
    pub credentials_file: Option<String>,
}

impl GatewayConfig {
    /// Load config from a TOML file. Falls back to defaults if the file
    /// doesn't exist. Environment variables override TOML values.
    pub fn load(path: &str) -> Self {
        let mut config = if Path::new(path).exists() {
            let contents = std::fs::read_to_string(path)
                .unwrap_or_else(|e| panic!("failed to read config file {}: {}", path, e));
            toml::from_str(&contents)
                .unwrap_or_else(|e| panic!("failed to parse config file {}: {}", path, e))
        } else {
            info!("No config file found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("LISTEN_ADDR") {
            self.server.listen_addr = v;
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = std::env::var("HISTORY_RETENTION_HOURS") {
            if let Ok(hours) = v.parse() {
                self.history.retention_hours = hours;
            }
        }
        if let Ok(v) = std::env::var("MAX_SCROLLBACK_LINES") {
            if let Ok(lines) = v.parse() {
                self.history.max_scrollback_lines = lines;
            }
        }
        if let Ok(v) = std::env::var("PUSH_CREDENTIALS_FILE") {
            self.push.credentials_file = Some(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
        let _lock = ENV_LOCK.lock().unwrap();

        let keys = [
            "LISTEN_ADDR",
            "DATABASE_URL",
            "HISTORY_RETENTION_HOURS",
            "MAX_SCROLLBACK_LINES",
            "PUSH_CREDENTIALS_FILE",
        ];
        let originals: Vec<_> = keys.iter().map(|k| (*k, std::env::var(k).ok())).collect();

        for key in &keys {
            std::env::remove_var(key);
        }
        for (k, v) in vars {
            std::env::set_var(k, v);
        }

        f();

        for (k, v) in originals {
            match v {
                Some(val) => std::env::set_var(k, val),
                None => std::env::remove_var(k),
            }
        }
    }

    #[test]
    fn defaults_without_file_or_env() {
        with_env(&[], || {
            let config = GatewayConfig::load("/nonexistent/vestibule.toml");
            assert_eq!(config.server.listen_addr, "0.0.0.0:8080");
            assert_eq!(config.history.retention_hours, 168);
            assert_eq!(config.history.max_scrollback_lines, 500);
            assert!(config.push.credentials_file.is_none());
        });
    }

    #[test]
    fn env_overrides_win() {
        with_env(
            &[
                ("LISTEN_ADDR", "127.0.0.1:9999"),
                ("HISTORY_RETENTION_HOURS", "24"),
                ("MAX_SCROLLBACK_LINES", "50"),
            ],
            || {
                let config = GatewayConfig::load("/nonexistent/vestibule.toml");
                assert_eq!(config.server.listen_addr, "127.0.0.1:9999");
                assert_eq!(config.history.retention_hours, 24);
                assert_eq!(config.history.max_scrollback_lines, 50);
            },
        );
    }

    #[test]
    fn malformed_numeric_env_is_ignored() {
        with_env(&[("HISTORY_RETENTION_HOURS", "soon")], || {
            let config = GatewayConfig::load("/nonexistent/vestibule.toml");
            assert_eq!(config.history.retention_hours, 168);
        });
    }
}
