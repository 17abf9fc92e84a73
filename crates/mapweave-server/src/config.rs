//! Server configuration: defaults, an optional JSON file, then environment
//! overrides.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

pub const ENV_CONFIG: &str = "MAPWEAVE_CONFIG";
pub const ENV_ADDR: &str = "MAPWEAVE_ADDR";
pub const ENV_CHANNEL_CAPACITY: &str = "MAPWEAVE_CHANNEL_CAPACITY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {name}: {value:?}")]
    InvalidVar { name: &'static str, value: String },
    #[error("channel_capacity must be greater than zero")]
    ZeroCapacity,
}

/// Which edit policy the mutation service enforces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    AllowAll,
    EditorsOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Per-space broadcast buffer; slower peers beyond it are told to reload.
    pub channel_capacity: usize,
    /// Create unknown spaces as commons on first join.
    pub auto_create_spaces: bool,
    pub policy: PolicyKind,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 3030)),
            channel_capacity: 256,
            auto_create_spaces: true,
            policy: PolicyKind::AllowAll,
        }
    }
}

impl ServerConfig {
    /// Load from `MAPWEAVE_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(ENV_CONFIG) {
            Ok(path) => Self::from_file(PathBuf::from(path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Check values a file or the environment may have set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }

    pub fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read { path, source })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Apply overrides from `lookup`, which maps variable names to values.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(value) = lookup(ENV_ADDR) {
            self.addr = value.parse().map_err(|_| ConfigError::InvalidVar { name: ENV_ADDR, value })?;
        }
        if let Some(value) = lookup(ENV_CHANNEL_CAPACITY) {
            self.channel_capacity = value
                .parse()
                .map_err(|_| ConfigError::InvalidVar { name: ENV_CHANNEL_CAPACITY, value })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ServerConfig::default();
        config
            .apply_env(env(&[(ENV_ADDR, "127.0.0.1:9000"), (ENV_CHANNEL_CAPACITY, "16")]))
            .unwrap();
        assert_eq!(config.addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.channel_capacity, 16);
    }

    #[test]
    fn test_rejects_bad_capacity() {
        let mut config = ServerConfig::default();
        let err = config.apply_env(env(&[(ENV_CHANNEL_CAPACITY, "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { name: ENV_CHANNEL_CAPACITY, .. }));

        config.apply_env(env(&[(ENV_CHANNEL_CAPACITY, "0")])).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::ZeroCapacity)));
    }

    #[test]
    fn test_zero_capacity_file_is_rejected() {
        let path = std::env::temp_dir().join(format!("mapweave-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{ "channel_capacity": 0 }"#).unwrap();
        let loaded = ServerConfig::from_file(path.clone());
        std::fs::remove_file(&path).unwrap();

        let config = loaded.unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::ZeroCapacity)));
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: ServerConfig = serde_json::from_str(r#"{ "policy": "editors_only" }"#).unwrap();
        assert_eq!(config.policy, PolicyKind::EditorsOnly);
        assert_eq!(config.channel_capacity, 256);
        assert!(config.auto_create_spaces);
    }
}
