//! Startup configuration: `settings.json` plus `TASKTREE_*` environment overrides.
//! Read once; nothing re-reads it while the session runs.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

pub const SETTINGS_ENV: &str = "TASKTREE_SETTINGS";
const DEFAULT_SETTINGS: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Base URL of the networked backend, e.g. `http://localhost:3000`.
    pub backend_url: Option<String>,
    pub force_local: bool,
    /// redb file used by the local-only adapter.
    pub data_path: PathBuf,
    /// Supplied by the user-identity collaborator; filters and assigns tasks.
    pub user_id: Option<Uuid>,
    pub probe_timeout_ms: u64,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub bind: String,
    pub database: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backend_url: None,
            force_local: false,
            data_path: PathBuf::from("tasktree.redb"),
            user_id: None,
            probe_timeout_ms: 2_000,
            server: ServerConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "0.0.0.0:3000".to_string(),
            database: PathBuf::from("tasktree.sqlite3"),
        }
    }
}

impl Config {
    /// Load from `$TASKTREE_SETTINGS` (or `./settings.json`), then apply the
    /// process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(SETTINGS_ENV).unwrap_or_else(|_| DEFAULT_SETTINGS.to_string());
        let mut config = Self::from_file(&path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// A missing file is not an error: defaults apply.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no settings file, using defaults");
                return Ok(Config::default());
            }
            Err(source) => {
                return Err(ConfigError::Read { path: path.display().to_string(), source });
            }
        };
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })
    }

    /// Overlay `TASKTREE_*` variables looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(url) = var("TASKTREE_BACKEND_URL") {
            self.backend_url = (!url.trim().is_empty()).then(|| url.trim().to_string());
        }
        if let Some(flag) = var("TASKTREE_FORCE_LOCAL") {
            self.force_local = parse_flag("TASKTREE_FORCE_LOCAL", &flag)?;
        }
        if let Some(path) = var("TASKTREE_DATA_PATH") {
            self.data_path = PathBuf::from(path);
        }
        if let Some(user) = var("TASKTREE_USER_ID") {
            let parsed = Uuid::parse_str(user.trim())
                .map_err(|_| ConfigError::Env { key: "TASKTREE_USER_ID", value: user.clone() })?;
            self.user_id = Some(parsed);
        }
        if let Some(ms) = var("TASKTREE_PROBE_TIMEOUT_MS") {
            self.probe_timeout_ms = ms
                .trim()
                .parse()
                .map_err(|_| ConfigError::Env { key: "TASKTREE_PROBE_TIMEOUT_MS", value: ms.clone() })?;
        }
        if let Some(bind) = var("TASKTREE_BIND") {
            self.server.bind = bind;
        }
        if let Some(db) = var("TASKTREE_DATABASE") {
            self.server.database = PathBuf::from(db);
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Env { key, value: value.to_string() }),
    }
}
