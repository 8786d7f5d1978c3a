// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Transport configuration.
//!
//! Configuration comes either from a YAML file (parsed into raw structs, then
//! validated) or from the environment. Invalid values are rejected up front
//! with a [`ConfigError`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Buffer size used when neither configuration nor environment provide one.
pub const DEFAULT_BUFFER_SIZE: usize = 128 * 1024;

/// Environment variable consulted for the default buffer size.
pub const DEFAULT_BUFFER_SIZE_ENV: &str = "SHMLINK_BUFFER_SIZE";

/// Smallest ring buffer capacity a connection will negotiate.
pub const MIN_BUFFER_SIZE: usize = 4096;

/// Largest ring buffer capacity a connection will negotiate.
pub const MAX_BUFFER_SIZE: usize = 256 * 1024 * 1024;

/// Upper bound for the acceptor backlog.
pub const MAX_BACKLOG: usize = 1024;

/// Read the default buffer size from `var`.
///
/// Falls back to [`DEFAULT_BUFFER_SIZE`] if the variable is unset, not a
/// number, or outside `[MIN_BUFFER_SIZE, MAX_BUFFER_SIZE]`.
pub fn buffer_size_from_env(var: &str) -> usize {
    let Ok(raw) = std::env::var(var) else {
        return DEFAULT_BUFFER_SIZE;
    };

    match raw.trim().parse::<usize>() {
        Ok(size) if (MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&size) => size,
        _ => {
            tracing::warn!(
                var = var,
                value = %raw,
                fallback = DEFAULT_BUFFER_SIZE,
                "Ignoring invalid buffer size from environment"
            );
            DEFAULT_BUFFER_SIZE
        }
    }
}

/// Raw configuration as parsed from YAML (before validation).
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTransportConfig {
    #[serde(default = "default_socket_dir")]
    socket_dir: String,
    default_buffer_size: Option<usize>,
    #[serde(default = "default_buffer_size_env")]
    buffer_size_env: String,
    #[serde(default = "default_max_buffer_size")]
    max_buffer_size: usize,
    #[serde(default = "default_backlog")]
    backlog: usize,
    handshake_timeout_ms: Option<u64>,
}

fn default_socket_dir() -> String {
    std::env::temp_dir().to_string_lossy().into_owned()
}

fn default_buffer_size_env() -> String {
    DEFAULT_BUFFER_SIZE_ENV.to_string()
}

fn default_max_buffer_size() -> usize {
    64 * 1024 * 1024 // 64MB
}

fn default_backlog() -> usize {
    16
}

/// Validated transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Directory holding the rendezvous sockets of acceptors.
    pub socket_dir: PathBuf,
    /// Buffer size used when a client passes no hint.
    pub default_buffer_size: usize,
    /// Largest client-to-server buffer an acceptor grants.
    pub max_buffer_size: usize,
    /// Bound on in-flight handshakes plus unaccepted connections.
    pub backlog: usize,
    /// Stalled handshakes are evicted after this long, if set.
    pub handshake_timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from_env(DEFAULT_BUFFER_SIZE_ENV)
    }
}

impl TransportConfig {
    /// Defaults with the default buffer size taken from `buffer_size_env`.
    pub fn from_env(buffer_size_env: &str) -> Self {
        let default_buffer_size = buffer_size_from_env(buffer_size_env);
        Self {
            socket_dir: PathBuf::from(default_socket_dir()),
            default_buffer_size,
            max_buffer_size: default_max_buffer_size().max(default_buffer_size),
            backlog: default_backlog(),
            handshake_timeout: None,
        }
    }

    /// Same configuration rooted at another socket directory.
    pub fn with_socket_dir(mut self, socket_dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = socket_dir.into();
        self
    }

    /// Same configuration with a different backlog bound.
    pub fn with_backlog(mut self, backlog: usize) -> Self {
        self.backlog = backlog;
        self
    }

    /// Same configuration with a handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Check every field against its bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("default_buffer_size", self.default_buffer_size),
            ("max_buffer_size", self.max_buffer_size),
        ] {
            if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&value) {
                return Err(ConfigError::InvalidFieldValue {
                    field,
                    value: value.to_string(),
                    reason: format!(
                        "Must be between {} and {} bytes",
                        MIN_BUFFER_SIZE, MAX_BUFFER_SIZE
                    ),
                });
            }
        }

        if self.default_buffer_size > self.max_buffer_size {
            return Err(ConfigError::InvalidFieldValue {
                field: "default_buffer_size",
                value: self.default_buffer_size.to_string(),
                reason: format!(
                    "Must not exceed max_buffer_size ({})",
                    self.max_buffer_size
                ),
            });
        }

        if self.backlog == 0 || self.backlog > MAX_BACKLOG {
            return Err(ConfigError::InvalidFieldValue {
                field: "backlog",
                value: self.backlog.to_string(),
                reason: format!("Must be between 1 and {}", MAX_BACKLOG),
            });
        }

        if self.handshake_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidFieldValue {
                field: "handshake_timeout_ms",
                value: "0".to_string(),
                reason: "Timeout must be positive; omit it to disable eviction".to_string(),
            });
        }

        if self.socket_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidFieldValue {
                field: "socket_dir",
                value: String::new(),
                reason: "Socket directory cannot be empty".to_string(),
            });
        }

        Ok(())
    }
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> Result<TransportConfig, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> Result<TransportConfig, ConfigError> {
        let raw: RawTransportConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
                message: format!("YAML parse error: {}", e),
            })?;

        Self::validate(raw)
    }

    fn validate(raw: RawTransportConfig) -> Result<TransportConfig, ConfigError> {
        let default_buffer_size = match raw.default_buffer_size {
            Some(size) => size,
            None => buffer_size_from_env(&raw.buffer_size_env),
        };

        let config = TransportConfig {
            socket_dir: PathBuf::from(raw.socket_dir),
            default_buffer_size,
            max_buffer_size: raw.max_buffer_size,
            backlog: raw.backlog,
            handshake_timeout: raw.handshake_timeout_ms.map(Duration::from_millis),
        };
        config.validate()?;

        tracing::debug!(
            socket_dir = %config.socket_dir.display(),
            default_buffer_size = config.default_buffer_size,
            backlog = config.backlog,
            "Loaded transport configuration"
        );

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config() {
        let yaml = r#"
socket_dir: /tmp/shmlink-test
default_buffer_size: 65536
max_buffer_size: 1048576
backlog: 4
handshake_timeout_ms: 250
"#;
        let config = ConfigLoader::load_string(yaml).unwrap();
        assert_eq!(config.socket_dir, PathBuf::from("/tmp/shmlink-test"));
        assert_eq!(config.default_buffer_size, 65536);
        assert_eq!(config.max_buffer_size, 1048576);
        assert_eq!(config.backlog, 4);
        assert_eq!(config.handshake_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_defaults_apply() {
        let config =
            ConfigLoader::load_string("buffer_size_env: SHMLINK_TEST_UNSET_VARIABLE\n").unwrap();
        assert_eq!(config.default_buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.backlog, 16);
        assert_eq!(config.handshake_timeout, None);
    }

    #[test]
    fn test_invalid_buffer_size() {
        let result = ConfigLoader::load_string("default_buffer_size: 100\n");
        assert!(matches!(
            result,
            Err(ConfigError::InvalidFieldValue {
                field: "default_buffer_size",
                ..
            })
        ));
    }

    #[test]
    fn test_default_exceeds_max() {
        let yaml = "default_buffer_size: 1048576\nmax_buffer_size: 65536\n";
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_invalid_backlog_and_timeout() {
        assert!(ConfigLoader::load_string("backlog: 0\n").is_err());
        assert!(ConfigLoader::load_string("backlog: 5000\n").is_err());
        assert!(ConfigLoader::load_string("handshake_timeout_ms: 0\n").is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = ConfigLoader::load_string("bufer_size: 4096\n");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigLoader::load_file("/nonexistent/shmlink.yaml");
        assert!(matches!(result, Err(ConfigError::NotFound { .. })));
    }

    #[test]
    fn test_buffer_size_from_env() {
        // Distinct variable names keep these independent of parallel tests.
        std::env::set_var("SHMLINK_TEST_BUFFER_VALID", "65536");
        assert_eq!(buffer_size_from_env("SHMLINK_TEST_BUFFER_VALID"), 65536);

        std::env::set_var("SHMLINK_TEST_BUFFER_GARBAGE", "lots");
        assert_eq!(
            buffer_size_from_env("SHMLINK_TEST_BUFFER_GARBAGE"),
            DEFAULT_BUFFER_SIZE
        );

        std::env::set_var("SHMLINK_TEST_BUFFER_TINY", "16");
        assert_eq!(
            buffer_size_from_env("SHMLINK_TEST_BUFFER_TINY"),
            DEFAULT_BUFFER_SIZE
        );

        assert_eq!(
            buffer_size_from_env("SHMLINK_TEST_BUFFER_NEVER_SET"),
            DEFAULT_BUFFER_SIZE
        );
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = TransportConfig::from_env("SHMLINK_TEST_BUFFER_NEVER_SET");
        assert!(config.validate().is_ok());
        assert_eq!(config.default_buffer_size, DEFAULT_BUFFER_SIZE);
    }
}
