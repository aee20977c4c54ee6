use std::{collections::HashMap, env, path::Path, time::Duration};

use anyhow::Context;
use config::{Config, Environment, File, FileFormat};
use relay_core::{RelayOptions, WriterConfig};
use serde::Deserialize;
use session_auth::TokenConfig;

pub const DEFAULT_TOKEN_SECRET: &str = "dev-insecure-token-secret";

/// Plain variables honoured for compatibility when the `APP__` form is unset.
const LEGACY_VARS: &[(&str, &str)] = &[
    ("SERVER_BIND", "BIND_ADDR"),
    ("DATABASE_URL", "DATABASE_URL"),
    ("TOKEN_SECRET", "TOKEN_SECRET"),
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    pub token_secret: String,
    pub token_ttl_seconds: i64,
    pub ping_interval_secs: u64,
    pub write_timeout_ms: u64,
    pub outbound_queue: usize,
    pub sweep_interval_secs: u64,
    pub echo_status_to_receiver: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".into(),
            database_url: "sqlite://./data/relay.db".into(),
            token_secret: DEFAULT_TOKEN_SECRET.into(),
            token_ttl_seconds: 72 * 60 * 60,
            ping_interval_secs: 30,
            write_timeout_ms: 10_000,
            outbound_queue: 64,
            sweep_interval_secs: 60 * 60,
            echo_status_to_receiver: false,
        }
    }
}

impl Settings {
    pub fn token_config(&self) -> TokenConfig {
        TokenConfig {
            secret: self.token_secret.clone(),
            ttl_seconds: self.token_ttl_seconds,
        }
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            ping_interval: Duration::from_secs(self.ping_interval_secs.max(1)),
            write_timeout: Duration::from_millis(self.write_timeout_ms.max(1)),
            queue_capacity: self.outbound_queue.max(1),
        }
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            echo_status_to_receiver: self.echo_status_to_receiver,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

pub fn load_settings() -> anyhow::Result<Settings> {
    load_settings_from(Path::new("server.toml"), env::vars().collect())
}

/// Layers defaults, the optional TOML file, `APP__*` variables and finally
/// the legacy plain variables.
pub fn load_settings_from(file: &Path, vars: HashMap<String, String>) -> anyhow::Result<Settings> {
    let mut vars = vars;
    for (legacy, key) in LEGACY_VARS {
        let app_key = format!("APP__{key}");
        if vars.contains_key(&app_key) {
            continue;
        }
        if let Some(value) = vars.get(*legacy).cloned() {
            vars.insert(app_key, value);
        }
    }

    let settings = Config::builder()
        .add_source(File::from(file).format(FileFormat::Toml).required(false))
        .add_source(
            Environment::with_prefix("APP")
                .separator("__")
                .try_parsing(true)
                .source(Some(vars)),
        )
        .build()
        .with_context(|| format!("failed to read settings from '{}'", file.display()))?
        .try_deserialize::<Settings>()
        .context("invalid settings")?;

    Ok(settings)
}

/// Turns plain file paths into `sqlite:` URLs. Other URLs pass through.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }
    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    let path = if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        path
    } else if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        path
    } else if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    } else {
        raw_database_url
    };

    let path = path.replace('\\', "/");
    if has_drive_prefix(&path) {
        format!("sqlite:{path}")
    } else {
        format!("sqlite://{path}")
    }
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
