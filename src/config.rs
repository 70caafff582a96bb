// Service configuration
// TOML file with environment overrides for deployment secrets

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::account::INITIAL_CREDITS;
use crate::logging::LogFormat;
use crate::similarity::DEFAULT_MAX_INPUT_CHARS;

pub const ENV_ADMIN_SECRET: &str = "SIMILARITY_ADMIN_SECRET";
pub const ENV_DB_PATH: &str = "SIMILARITY_DB_PATH";
pub const ENV_PORT: &str = "SIMILARITY_PORT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("admin secret is not configured (set [admin].secret or SIMILARITY_ADMIN_SECRET)")]
    MissingAdminSecret,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub credits: CreditsConfig,
    pub admin: AdminConfig,
    pub similarity: SimilarityConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 5000,
            log_level: "info".to_string(),
            log_format: LogFormat::Human,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./data/accounts.db".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CreditsConfig {
    /// Credits granted at registration
    pub initial: i64,

    /// When false, refills with a negative amount are rejected
    pub allow_negative_refill: bool,
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            initial: INITIAL_CREDITS,
            allow_negative_refill: true,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct AdminConfig {
    pub secret: Option<String>,
}

impl std::fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminConfig")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SimilarityConfig {
    pub max_input_chars: usize,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
        }
    }
}

impl Config {
    /// Load from a TOML file, falling back to defaults when it does not exist,
    /// then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            Self::from_toml(&raw)?
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production, a map in tests).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secret) = lookup(ENV_ADMIN_SECRET) {
            self.admin.secret = Some(secret);
        }
        if let Some(path) = lookup(ENV_DB_PATH) {
            self.database.path = path;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.server.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                name: ENV_PORT,
                value: port,
            })?;
        }
        Ok(())
    }

    /// Checks needed before serving traffic.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.admin.secret.as_deref() {
            Some(secret) if !secret.is_empty() => Ok(()),
            _ => Err(ConfigError::MissingAdminSecret),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind_addr, self.server.port)
    }
}
