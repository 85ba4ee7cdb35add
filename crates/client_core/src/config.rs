use std::{collections::HashMap, fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

use crate::{backoff::BackoffPolicy, signaling::SignalingOptions};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSettings {
    pub server_url: String,
    pub ws_path: String,
    pub reconnect_base_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Zero disables the negotiation timeout.
    pub negotiation_timeout_secs: u64,
    pub ice_servers: Vec<String>,
    pub event_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".into(),
            ws_path: "/ws".into(),
            reconnect_base_delay_ms: 1000,
            max_reconnect_attempts: 5,
            negotiation_timeout_secs: 30,
            ice_servers: Vec::new(),
            event_buffer: 256,
        }
    }
}

impl ClientSettings {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.reconnect_base_delay_ms),
            self.max_reconnect_attempts,
        )
    }

    pub fn signaling_options(&self) -> SignalingOptions {
        SignalingOptions {
            ice_servers: self.ice_servers.clone(),
            negotiation_timeout: (self.negotiation_timeout_secs > 0)
                .then(|| Duration::from_secs(self.negotiation_timeout_secs)),
            ..SignalingOptions::default()
        }
    }

    /// Base of the realtime endpoint, before `/<user_id>?token=` is added.
    pub fn websocket_base(&self) -> String {
        format!(
            "{}/{}",
            self.server_url.trim_end_matches('/'),
            self.ws_path.trim_start_matches('/')
        )
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new("client.toml"), |key| std::env::var(key).ok())
}

/// Defaults, then `path` if it parses, then environment overrides. `APP__*`
/// names win over the legacy ones.
pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => apply_file(&mut settings, &file_cfg),
            Err(err) => warn!(path = %path.display(), %err, "config: ignoring unreadable file"),
        }
    }

    for key in ["SERVER_URL", "APP__SERVER_URL"] {
        if let Some(v) = env(key) {
            settings.server_url = v;
        }
    }
    if let Some(v) = env("APP__WS_PATH") {
        settings.ws_path = v;
    }
    if let Some(v) = env("APP__RECONNECT_BASE_DELAY_MS").and_then(|v| v.parse().ok()) {
        settings.reconnect_base_delay_ms = v;
    }
    if let Some(v) = env("APP__MAX_RECONNECT_ATTEMPTS").and_then(|v| v.parse().ok()) {
        settings.max_reconnect_attempts = v;
    }
    if let Some(v) = env("APP__NEGOTIATION_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        settings.negotiation_timeout_secs = v;
    }
    for key in ["ICE_SERVERS", "APP__ICE_SERVERS"] {
        if let Some(v) = env(key) {
            settings.ice_servers = split_list(&v);
        }
    }
    if let Some(v) = env("APP__EVENT_BUFFER").and_then(|v| v.parse().ok()) {
        settings.event_buffer = v;
    }

    settings
}

fn apply_file(settings: &mut ClientSettings, file_cfg: &HashMap<String, toml::Value>) {
    if let Some(v) = file_cfg.get("server_url").and_then(toml::Value::as_str) {
        settings.server_url = v.to_string();
    }
    if let Some(v) = file_cfg.get("ws_path").and_then(toml::Value::as_str) {
        settings.ws_path = v.to_string();
    }
    if let Some(v) = file_integer(file_cfg, "reconnect_base_delay_ms") {
        settings.reconnect_base_delay_ms = v;
    }
    if let Some(v) = file_integer(file_cfg, "max_reconnect_attempts") {
        settings.max_reconnect_attempts = v.try_into().unwrap_or(u32::MAX);
    }
    if let Some(v) = file_integer(file_cfg, "negotiation_timeout_secs") {
        settings.negotiation_timeout_secs = v;
    }
    match file_cfg.get("ice_servers") {
        Some(toml::Value::Array(items)) => {
            settings.ice_servers = items
                .iter()
                .filter_map(toml::Value::as_str)
                .map(str::to_string)
                .collect();
        }
        Some(toml::Value::String(v)) => settings.ice_servers = split_list(v),
        _ => {}
    }
    if let Some(v) = file_integer(file_cfg, "event_buffer") {
        settings.event_buffer = v.try_into().unwrap_or(usize::MAX);
    }
}

/// Accepts both `key = 5` and `key = "5"`.
fn file_integer(file_cfg: &HashMap<String, toml::Value>, key: &str) -> Option<u64> {
    match file_cfg.get(key)? {
        toml::Value::Integer(v) => u64::try_from(*v).ok(),
        toml::Value::String(v) => v.trim().parse().ok(),
        _ => None,
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
