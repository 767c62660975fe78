use std::{fs, path::Path, str::FromStr, time::Duration};

use tracing::warn;

pub use storage::prepare_store_url;

use crate::{
    connection::ReconnectPolicy, conversation::SessionPolicy, notifications::KeepalivePolicy, quota::QuotaRules,
    swapanza::DEFAULT_EXPIRING_WINDOW_SECS,
};

pub const DEFAULT_CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub store_path: String,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
    pub invite_timeout_secs: u64,
    pub unread_poll_secs: u64,
    pub session_poll_secs: u64,
    pub credential_check_secs: u64,
    pub swapanza_message_limit: i64,
    pub swapanza_max_chars: usize,
    pub expiring_window_secs: i64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".into(),
            store_path: "sqlite://./data/client.db".into(),
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 30_000,
            ping_interval_secs: 60,
            pong_timeout_secs: 45,
            invite_timeout_secs: 30,
            unread_poll_secs: 5,
            session_poll_secs: 5,
            credential_check_secs: 30,
            swapanza_message_limit: 2,
            swapanza_max_chars: 7,
            expiring_window_secs: DEFAULT_EXPIRING_WINDOW_SECS,
        }
    }
}

impl ClientSettings {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(self.reconnect_base_ms),
            cap: Duration::from_millis(self.reconnect_cap_ms),
        }
    }

    pub fn keepalive_policy(&self) -> KeepalivePolicy {
        KeepalivePolicy {
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs),
        }
    }

    pub fn quota_rules(&self) -> QuotaRules {
        QuotaRules {
            max_chars: self.swapanza_max_chars,
            message_limit: self.swapanza_message_limit,
        }
    }

    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            rules: self.quota_rules(),
            reconnect: self.reconnect_policy(),
            invite_timeout: Duration::from_secs(self.invite_timeout_secs),
            poll_interval: Duration::from_secs(self.session_poll_secs),
            expiring_window_secs: self.expiring_window_secs,
        }
    }

    pub fn unread_poll_interval(&self) -> Duration {
        Duration::from_secs(self.unread_poll_secs)
    }

    pub fn credential_check_interval(&self) -> Duration {
        Duration::from_secs(self.credential_check_secs)
    }

    /// Applies one `key = value` pair. Unknown keys and unparsable values are
    /// logged and skipped.
    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "server_url" => self.server_url = value.to_string(),
            "store_path" => self.store_path = value.to_string(),
            "reconnect_base_ms" => set_parsed(&mut self.reconnect_base_ms, key, value),
            "reconnect_cap_ms" => set_parsed(&mut self.reconnect_cap_ms, key, value),
            "ping_interval_secs" => set_parsed(&mut self.ping_interval_secs, key, value),
            "pong_timeout_secs" => set_parsed(&mut self.pong_timeout_secs, key, value),
            "invite_timeout_secs" => set_parsed(&mut self.invite_timeout_secs, key, value),
            "unread_poll_secs" => set_parsed(&mut self.unread_poll_secs, key, value),
            "session_poll_secs" => set_parsed(&mut self.session_poll_secs, key, value),
            "credential_check_secs" => set_parsed(&mut self.credential_check_secs, key, value),
            "swapanza_message_limit" => set_parsed(&mut self.swapanza_message_limit, key, value),
            "swapanza_max_chars" => set_parsed(&mut self.swapanza_max_chars, key, value),
            "expiring_window_secs" => set_parsed(&mut self.expiring_window_secs, key, value),
            _ => warn!(key, "ignoring unknown client setting"),
        }
    }

    fn apply_file(&mut self, raw: &str) {
        let file_cfg = match raw.parse::<toml::Table>() {
            Ok(file_cfg) => file_cfg,
            Err(err) => {
                warn!("ignoring unreadable client config: {err}");
                return;
            }
        };
        for (key, value) in &file_cfg {
            match value {
                toml::Value::String(value) => self.apply(key, value),
                toml::Value::Integer(value) => self.apply(key, &value.to_string()),
                other => warn!(key, kind = other.type_str(), "ignoring client setting of unsupported type"),
            }
        }
    }

    fn apply_env(&mut self, vars: impl IntoIterator<Item = (String, String)>) {
        for (name, value) in vars {
            if let Some(key) = name.strip_prefix("APP__") {
                self.apply(&key.to_ascii_lowercase(), &value);
            }
        }
    }
}

fn set_parsed<T: FromStr>(slot: &mut T, key: &str, value: &str) {
    match value.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value, "ignoring unparsable client setting"),
    }
}

/// Defaults, then `client.toml` in the working directory, then `APP__*` variables.
pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_CONFIG_FILE))
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();
    if let Ok(raw) = fs::read_to_string(path) {
        settings.apply_file(&raw);
    }
    settings.apply_env(std::env::vars());
    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
