//! Configuration module for latency-probe.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::message::ENVELOPE_OVERHEAD;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Which side of the measurement to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Send paced requests and record round-trip latency
    #[default]
    Client,
    /// Stamp and echo measurement messages
    Server,
}

/// Command-line arguments for the latency prober
#[derive(Parser, Debug)]
#[command(name = "latency-probe")]
#[command(author = "latency-probe authors")]
#[command(version = "0.1.0")]
#[command(about = "WebSocket end-to-end latency tester", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run as measurement client or echo server
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// Echo server address, `host:port` with an optional path prefix
    pub address: Option<String>,

    /// Address the echo server binds to (e.g., 0.0.0.0:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of requests to send (0 = until interrupted)
    #[arg(short = 'r', long)]
    pub reps: Option<u64>,

    /// Interval between requests in milliseconds
    #[arg(short = 'i', long)]
    pub interval: Option<u64>,

    /// Request message size in bytes
    #[arg(long)]
    pub request_payload: Option<u64>,

    /// Response message size in bytes
    #[arg(long)]
    pub response_payload: Option<u64>,

    /// Connect with wss:// instead of ws://
    #[arg(long)]
    pub tls: bool,

    /// Output file prefix for `<log>.csv` and `<log>_tcpstats.csv`
    #[arg(long)]
    pub log: Option<String>,

    /// Bind the client socket to this local port
    #[arg(long)]
    pub source_port: Option<u16>,

    /// Disable TCP statistics sampling
    #[arg(long)]
    pub no_tcp_stats: bool,

    /// Reconnect attempts allowed for a single request
    #[arg(long)]
    pub max_reconnect_attempts: Option<u32>,

    /// Maximum concurrent connections accepted by the echo server
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Client-related configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Echo server address
    pub address: Option<String>,
    /// Requests to send, 0 = until interrupted
    #[serde(default)]
    pub reps: u64,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_payload")]
    pub request_payload: u64,
    #[serde(default = "default_payload")]
    pub response_payload: u64,
    #[serde(default)]
    pub tls: bool,
    /// Output file prefix
    #[serde(default = "default_log_prefix")]
    pub log: String,
    pub source_port: Option<u16>,
    #[serde(default = "default_tcp_stats")]
    pub tcp_stats: bool,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: None,
            reps: 0,
            interval_ms: default_interval_ms(),
            request_payload: default_payload(),
            response_payload: default_payload(),
            tls: false,
            log: default_log_prefix(),
            source_port: None,
            tcp_stats: default_tcp_stats(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl ClientConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Server-related configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            workers: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_payload() -> u64 {
    64
}

fn default_log_prefix() -> String {
    "log".to_string()
}

fn default_tcp_stats() -> bool {
    true
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_backoff_ms() -> u64 {
    1000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = match cli.config {
            Some(ref config_path) => {
                let contents = std::fs::read_to_string(config_path)
                    .map_err(|source| ConfigError::FileRead {
                        path: config_path.clone(),
                        source,
                    })?;
                toml::from_str(&contents)
                    .map_err(|source| ConfigError::TomlParse {
                    path: config_path.clone(),
                    source,
                })?
            }
            None => TomlConfig::default(),
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let file = toml_config.client;
        let client = ClientConfig {
            address: cli.address.or(file.address),
            reps: cli.reps.unwrap_or(file.reps),
            interval_ms: cli.interval.unwrap_or(file.interval_ms),
            request_payload: cli.request_payload.unwrap_or(file.request_payload),
            response_payload: cli.response_payload.unwrap_or(file.response_payload),
            tls: cli.tls || file.tls,
            log: cli.log.unwrap_or(file.log),
            source_port: cli.source_port.or(file.source_port),
            tcp_stats: !cli.no_tcp_stats && file.tcp_stats,
            max_reconnect_attempts: cli
                .max_reconnect_attempts
                .unwrap_or(file.max_reconnect_attempts),
            reconnect_backoff_ms: file.reconnect_backoff_ms,
            handshake_timeout_ms: file.handshake_timeout_ms,
        };

        let server = ServerConfig {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            workers: toml_config.server.workers,
        };

        Config {
            mode: cli.mode.unwrap_or(toml_config.mode),
            workers: cli.workers.or(server.workers),
            client,
            server,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid(
                "workers must be greater than 0".to_string(),
            ));
        }

        match self.mode {
            Mode::Client => {
                let client = &self.client;
                if client.address.is_none() {
                    return Err(ConfigError::Invalid(
                        "an echo server address is required in client mode".to_string(),
                    ));
                }
                if client.interval_ms == 0 {
                    return Err(ConfigError::Invalid(
                        "interval must be greater than 0".to_string(),
                    ));
                }
                for (name, size) in [
                    ("request", client.request_payload),
                    ("response", client.response_payload),
                ] {
                    if size < ENVELOPE_OVERHEAD {
                        return Err(ConfigError::Invalid(format!(
                            "{name} payload must be at least {ENVELOPE_OVERHEAD} bytes, got {size}"
                        )));
                    }
                }
            }
            Mode::Server => {
                if self.server.max_connections == 0 {
                    return Err(ConfigError::Invalid(
                        "max_connections must be greater than 0".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(list: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("latency-probe").chain(list.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.mode, Mode::Client);
        assert_eq!(config.client.interval_ms, 1000);
        assert_eq!(config.client.request_payload, 64);
        assert_eq!(config.client.log, "log");
        assert!(config.client.tcp_stats);
        assert_eq!(config.server.listen, "0.0.0.0:8080");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            mode = "server"

            [client]
            address = "example.com:443"
            reps = 100
            interval_ms = 10
            tls = true

            [server]
            listen = "127.0.0.1:9000"
            workers = 4

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.mode, Mode::Server);
        assert_eq!(config.client.address.as_deref(), Some("example.com:443"));
        assert_eq!(config.client.reps, 100);
        assert_eq!(config.client.interval_ms, 10);
        assert!(config.client.tls);
        assert_eq!(config.client.max_reconnect_attempts, 5);
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[client]\naddress = \"a:1\"\nreps = 3\nresponse_payload = 128\n[logging]\nlevel = \"warn\""
        )
        .unwrap();
        let path = file.path().to_str().unwrap();

        let config =
            Config::from_args(args(&["-c", path, "b:2", "--reps", "7", "--no-tcp-stats"])).unwrap();
        assert_eq!(config.client.address.as_deref(), Some("b:2"));
        assert_eq!(config.client.reps, 7);
        assert_eq!(config.client.response_payload, 128);
        assert!(!config.client.tcp_stats);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_client_requires_address() {
        let err = Config::from_args(args(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        // the server has no use for one
        let config = Config::from_args(args(&["--mode", "server"])).unwrap();
        assert_eq!(config.mode, Mode::Server);
    }

    #[test]
    fn test_rejects_undersized_payload() {
        let err = Config::from_args(args(&["h:1", "--request-payload", "61"])).unwrap_err();
        assert!(err.to_string().contains("request payload"));
        assert!(Config::from_args(args(&["h:1", "--request-payload", "62"])).is_ok());
    }

    #[test]
    fn test_rejects_zero_interval() {
        let err = Config::from_args(args(&["h:1", "-i", "0"])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_args(args(&["-c", "/nonexistent/probe.toml", "h:1"])).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }
}
