use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PROXY: &str = "keepassxc-proxy";
pub const DEFAULT_DISCONNECT_TIMEOUT_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config file is malformed: {0}")]
    Format(#[from] serde_json::Error),
}

/// Session behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Associate with databases we have no identity for.
    pub allow_new_database: bool,
    /// Ask KeePassXC to prompt for unlocking when the database is locked.
    pub trigger_unlock: bool,
    /// Request the database hash as soon as the key exchange completes.
    pub open_on_connect: bool,
    /// Follow KeePassXC when the user switches to another database.
    pub allow_database_change: bool,
    pub disconnect_on_close: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            allow_new_database: true,
            trigger_unlock: true,
            open_on_connect: true,
            allow_database_change: false,
            disconnect_on_close: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Proxy executable, resolved through `PATH` when not absolute.
    pub proxy_program: String,
    pub proxy_args: Vec<String>,
    /// Delay between the steps of the disconnect escalation.
    pub disconnect_timeout_ms: u64,
    pub options: ClientOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            proxy_program: DEFAULT_PROXY.into(),
            proxy_args: vec![],
            disconnect_timeout_ms: DEFAULT_DISCONNECT_TIMEOUT_MS,
            options: ClientOptions::default(),
        }
    }
}

impl ClientConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// `load` for an optional file: a missing file yields the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            other => other,
        }
    }

    /// Applies `KPXC_PROXY` and `KPXC_DISCONNECT_TIMEOUT_MS` on top of `self`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(program) = std::env::var("KPXC_PROXY") {
            if !program.is_empty() {
                self.proxy_program = program;
            }
        }
        if let Ok(raw) = std::env::var("KPXC_DISCONNECT_TIMEOUT_MS") {
            match raw.parse() {
                Ok(ms) => self.disconnect_timeout_ms = ms,
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid KPXC_DISCONNECT_TIMEOUT_MS"),
            }
        }
        self
    }

    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}
