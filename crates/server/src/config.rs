use std::{collections::HashMap, fs, path::Path};

use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub jwt_secret: String,
    pub jwt_algorithm: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8000".into(),
            jwt_secret: "dev-secret".into(),
            jwt_algorithm: "HS256".into(),
        }
    }
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new("server.toml"), |key| std::env::var(key).ok())
}

pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, String>>(&raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.get("bind_addr") {
                    settings.server_bind = v.clone();
                }
                if let Some(v) = file_cfg.get("jwt_secret") {
                    settings.jwt_secret = v.clone();
                }
                if let Some(v) = file_cfg.get("jwt_algorithm") {
                    settings.jwt_algorithm = v.clone();
                }
            }
            Err(err) => warn!(path = %path.display(), %err, "config: ignoring unreadable file"),
        }
    }

    if let Some(v) = env("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = env("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Some(v) = env("SECRET_KEY") {
        settings.jwt_secret = v;
    }
    if let Some(v) = env("APP__JWT_SECRET") {
        settings.jwt_secret = v;
    }

    if let Some(v) = env("ALGORITHM") {
        settings.jwt_algorithm = v;
    }
    if let Some(v) = env("APP__JWT_ALGORITHM") {
        settings.jwt_algorithm = v;
    }

    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
