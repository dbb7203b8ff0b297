//! Server configuration, loaded from a TOML file.

use evio::PollerKind;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Listener and worker settings.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Dotted-quad listen address.
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,

    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Worker loop threads; 0 runs every connection on the base loop.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Multiplexer backend: "epoll", "poll", or "select".
    #[serde(default)]
    pub poller: PollerKind,

    #[serde(default = "default_true")]
    pub reuse_port: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_ip: default_listen_ip(),
            listen_port: default_listen_port(),
            worker_threads: default_worker_threads(),
            poller: PollerKind::default(),
            reuse_port: true,
        }
    }
}

/// Where completed uploads live.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            cache_dir: default_cache_dir(),
        }
    }
}

/// Log output settings. `RUST_LOG` overrides `level` when set.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default = "default_true")]
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    20000
}

fn default_worker_threads() -> usize {
    4
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("filecache")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen_ip, "0.0.0.0");
        assert_eq!(config.server.listen_port, 20000);
        assert_eq!(config.server.worker_threads, 4);
        assert_eq!(config.server.poller, PollerKind::Epoll);
        assert!(config.server.reuse_port);
        assert_eq!(config.storage.cache_dir, PathBuf::from("filecache"));
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_full_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen_ip = "127.0.0.1"
            listen_port = 21000
            worker_threads = 2
            poller = "poll"
            reuse_port = false

            [storage]
            cache_dir = "/var/lib/fileserver"

            [logging]
            level = "debug"
            format = "json"
            timestamps = false
            "#,
        )
        .unwrap();

        assert_eq!(config.server.listen_ip, "127.0.0.1");
        assert_eq!(config.server.listen_port, 21000);
        assert_eq!(config.server.worker_threads, 2);
        assert_eq!(config.server.poller, PollerKind::Poll);
        assert!(!config.server.reuse_port);
        assert_eq!(
            config.storage.cache_dir,
            PathBuf::from("/var/lib/fileserver")
        );
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(!config.logging.timestamps);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            [server]
            listen_prot = 20000
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = Config::load(Path::new("/nonexistent/fileserver.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
