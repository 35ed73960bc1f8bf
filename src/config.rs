//! Application configuration.
//!
//! Defaults cover a local setup. Values can come from YAML or be overridden
//! key by key from prefixed environment variables:
//!
//! | Variable | Key |
//! |---|---|
//! | `{PREFIX}_SERVER_HOST` | `server.host` |
//! | `{PREFIX}_SERVER_PORT` | `server.port` |
//! | `{PREFIX}_SERVER_BODY_LIMIT` | `server.body_limit` |
//! | `{PREFIX}_SSE_KEEP_ALIVE_MS` | `sse.keep_alive_ms` |
//! | `{PREFIX}_QUEUE_HOST` | `queue.connection.host` |
//! | `{PREFIX}_QUEUE_PORT` | `queue.connection.port` |
//! | `{PREFIX}_QUEUE_DB` | `queue.connection.db` |

use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ModularError, ModularResult};
use crate::worker::engine::ConnectionOptions;

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum accepted request body, in bytes
    pub body_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            body_limit: 2 * 1024 * 1024,
        }
    }
}

/// Server-sent events settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SseConfig {
    pub keep_alive_ms: u64,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self { keep_alive_ms: 5000 }
    }
}

impl SseConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }
}

/// Queue engine settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub connection: ConnectionOptions,
}

/// Top-level configuration.
///
/// ```rust
/// use ferrous_modular::ModularConfig;
///
/// let config = ModularConfig::from_yaml_str("server:\n  port: 8080\n").unwrap();
/// assert_eq!(config.server.port, 8080);
/// assert_eq!(config.sse.keep_alive_ms, 5000);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModularConfig {
    pub server: ServerConfig,
    pub sse: SseConfig,
    pub queue: QueueConfig,
}

impl ModularConfig {
    pub fn from_yaml_str(yaml: &str) -> ModularResult<Self> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|e| ModularError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> ModularResult<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    /// Defaults overridden by `{prefix}_*` environment variables.
    pub fn from_env(prefix: &str) -> ModularResult<Self> {
        Self::default().with_overrides(prefix, |key| env::var(key).ok())
    }

    /// Applies `{prefix}_*` overrides read through `lookup`.
    pub fn with_overrides<F>(mut self, prefix: &str, lookup: F) -> ModularResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let source = Overrides { prefix, lookup };
        source.apply("SERVER_HOST", &mut self.server.host)?;
        source.apply("SERVER_PORT", &mut self.server.port)?;
        source.apply("SERVER_BODY_LIMIT", &mut self.server.body_limit)?;
        source.apply("SSE_KEEP_ALIVE_MS", &mut self.sse.keep_alive_ms)?;
        source.apply("QUEUE_HOST", &mut self.queue.connection.host)?;
        source.apply("QUEUE_PORT", &mut self.queue.connection.port)?;
        source.apply("QUEUE_DB", &mut self.queue.connection.db)?;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> ModularResult<()> {
        if self.server.port == 0 {
            return Err(ModularError::Config("server.port must be greater than 0".into()));
        }
        if self.server.body_limit == 0 {
            return Err(ModularError::Config("server.body_limit must be greater than 0".into()));
        }
        if self.sse.keep_alive_ms == 0 {
            return Err(ModularError::Config("sse.keep_alive_ms must be greater than 0".into()));
        }
        Ok(())
    }
}

struct Overrides<'a, F> {
    prefix: &'a str,
    lookup: F,
}

impl<F> Overrides<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn apply<T>(&self, key: &str, slot: &mut T) -> ModularResult<()>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let name = format!("{}_{key}", self.prefix);
        if let Some(raw) = (self.lookup)(&name) {
            *slot = raw
                .trim()
                .parse()
                .map_err(|e| ModularError::Config(format!("{name}={raw}: {e}")))?;
        }
        Ok(())
    }
}
