//! Configuration for the relay server and client.
//!
//! The server reads command-line arguments and an optional TOML file; CLI
//! arguments take precedence over file values, which take precedence over
//! the built-in defaults. With no arguments at all the server listens on
//! `0.0.0.0:9999` and accepts protocol version 102.
//!
//! The client only takes command-line arguments.

use crate::frame::PROTOCOL_VERSION;
use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Command-line arguments for the relay server
#[derive(Parser, Debug)]
#[command(name = "frame-relay")]
#[command(author = "frame-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "A fixed-frame TCP message relay", long_about = None)]
pub struct ServerArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:9999)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Protocol version accepted from clients
    #[arg(long)]
    pub protocol_version: Option<u8>,

    /// Per-connection write timeout in milliseconds (0 = block forever)
    #[arg(long)]
    pub write_timeout_ms: Option<u64>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Command-line arguments for the relay client
#[derive(Parser, Debug)]
#[command(name = "relay-client")]
#[command(version = "0.1.0")]
#[command(about = "Terminal client for the frame relay", long_about = None)]
pub struct ClientArgs {
    /// Server IP address, or `localhost`
    pub host: String,

    /// Server port
    pub port: u16,

    /// Protocol version used until changed with `v <n>`
    #[arg(long, default_value_t = PROTOCOL_VERSION)]
    pub protocol_version: u8,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub protocol: ProtocolSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

/// Wire protocol configuration
#[derive(Debug, Deserialize)]
pub struct ProtocolSection {
    #[serde(default = "default_protocol_version")]
    pub version: u8,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            version: default_protocol_version(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9999".to_string()
}

fn default_backlog() -> i32 {
    100
}

fn default_write_timeout_ms() -> u64 {
    5000
}

fn default_protocol_version() -> u8 {
    PROTOCOL_VERSION
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub backlog: i32,
    pub write_timeout_ms: u64,
    pub protocol_version: u8,
    pub log_level: String,
}

impl ServerConfig {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(ServerArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    pub fn from_args(cli: ServerArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: ServerArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(file.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen))?;

        Ok(ServerConfig {
            listen,
            backlog: cli.backlog.unwrap_or(file.server.backlog),
            write_timeout_ms: cli
                .write_timeout_ms
                .unwrap_or(file.server.write_timeout_ms),
            protocol_version: cli.protocol_version.unwrap_or(file.protocol.version),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                file.logging.level
            },
        })
    }
}

impl ClientArgs {
    /// Resolve `host` and `port` to the server address.
    ///
    /// `localhost` maps to the IPv4 loopback; anything else must be an IP
    /// literal.
    pub fn server_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip = if self.host == "localhost" {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            self.host
                .parse()
                .map_err(|_| ConfigError::InvalidHost(self.host.clone()))?
        };
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String),
    InvalidHost(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidListen(addr) => write!(f, "Invalid listen address '{addr}'"),
            ConfigError::InvalidHost(host) => write!(f, "Invalid IP Address '{host}'"),
        }
    }
}

impl std::error::Error for ConfigError {}
