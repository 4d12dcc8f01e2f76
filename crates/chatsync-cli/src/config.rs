//! Configuration file support

use anyhow::Context;
use chatsync_wire::Endpoints;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for chatsync
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend base URL
    pub base_url: Option<String>,
    /// User id sent with chat requests
    pub user_id: Option<String>,
    /// System prompt sent with chat requests
    pub system_prompt: Option<String>,
    /// Delay before task state is reloaded after a stream failure
    pub recovery_delay_ms: Option<u64>,
    /// Endpoint overrides; `{id}` is replaced with the conversation id
    pub chat_path: Option<String>,
    pub messages_path: Option<String>,
    pub tasks_path: Option<String>,
}

pub const DEFAULT_BASE_URL: &str = "http://localhost:3000";

impl Config {
    /// Config file location; `CHATSYNC_CONFIG_PATH` overrides the platform
    /// config directory
    pub fn config_path() -> PathBuf {
        match std::env::var_os("CHATSYNC_CONFIG_PATH") {
            Some(path) => PathBuf::from(path),
            None => dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("chatsync")
                .join("config.toml"),
        }
    }

    /// Load the config file, falling back to defaults when it is missing or
    /// unreadable
    pub fn load() -> Self {
        let path = Self::config_path();
        match Self::read(&path) {
            Ok(Some(config)) => config,
            Ok(None) => Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), "Ignoring config file: {:#}", e);
                Self::default()
            }
        }
    }

    /// Parse a config file; `None` when it does not exist
    pub fn read(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(config))
    }

    /// Write the config as TOML, creating parent directories
    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Write a starter config unless one already exists
    pub fn init() -> anyhow::Result<PathBuf> {
        let path = Self::config_path();
        if !path.exists() {
            let starter = Config {
                base_url: Some(DEFAULT_BASE_URL.to_string()),
                recovery_delay_ms: Some(2000),
                ..Default::default()
            };
            starter.write(&path)?;
        }
        Ok(path)
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms.unwrap_or(2000))
    }

    /// Endpoint templates with config overrides applied
    pub fn endpoints(&self) -> Endpoints {
        let defaults = Endpoints::default();
        Endpoints {
            chat_path: self.chat_path.clone().unwrap_or(defaults.chat_path),
            messages_path: self.messages_path.clone().unwrap_or(defaults.messages_path),
            tasks_path: self.tasks_path.clone().unwrap_or(defaults.tasks_path),
        }
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# chatsync configuration file
# Place at ~/.config/chatsync/config.toml (Linux/Mac) or %APPDATA%\chatsync\config.toml (Windows)

# Backend base URL
base_url = "http://localhost:3000"

# User id sent with chat requests (optional)
# user_id = "alice"

# System prompt sent with chat requests (optional)
# system_prompt = "You are a helpful assistant."

# Delay before task state is reloaded after a stream failure
recovery_delay_ms = 2000

# Endpoint overrides (optional); {id} is replaced with the conversation id
# chat_path = "/api/chat"
# messages_path = "/api/chats/{id}/messages"
# tasks_path = "/api/chats/{id}/tasks"
"#
}
