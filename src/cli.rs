use crate::config::{Config, ServerConfig};
use crate::discovery::docker::DEFAULT_DOCKER_SOCKET;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format with colors (if enabled)
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for machine parsing
    Json,
}

/// Color output mode.
#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum ColorMode {
    /// Auto-detect based on terminal capabilities
    #[default]
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

impl ColorMode {
    /// Determine if colors should be enabled based on mode and terminal detection.
    pub fn should_enable(&self) -> bool {
        match self {
            ColorMode::Always => true,
            ColorMode::Never => false,
            ColorMode::Auto => std::io::IsTerminal::is_terminal(&std::io::stderr()),
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "dockforward")]
#[command(
    author,
    version,
    about = "Watch containers on a remote Docker host and keep their published ports forwarded to localhost"
)]
pub struct Cli {
    /// Remote host in format `[user@]host[:port]`, bypassing the config file
    #[arg(long = "host", value_name = "HOST")]
    pub host: Option<String>,

    /// Path to SSH identity file
    #[arg(short = 'i', long = "identity")]
    pub identity_file: Option<PathBuf>,

    /// Name of a configured server to connect to instead of the current one
    #[arg(short = 's', long = "server", conflicts_with = "host")]
    pub server: Option<String>,

    /// Remote Docker daemon socket
    #[arg(long = "docker-socket", default_value = DEFAULT_DOCKER_SOCKET)]
    pub docker_socket: String,

    /// Poll interval in milliseconds
    #[arg(long = "interval-ms", default_value = "2000")]
    pub interval_ms: u64,

    /// Keep ports forwarded without the interactive view
    #[arg(long = "headless")]
    pub headless: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Log output format for stderr
    #[arg(long = "log-format", value_enum, default_value = "pretty")]
    pub log_format: LogFormat,

    /// Enable colored log output (auto-detected by default)
    #[arg(long = "color", default_value = "auto")]
    pub color: ColorMode,

    /// Also log to stderr (always on when RUST_LOG is set)
    #[arg(long = "log-stderr")]
    pub log_stderr: bool,
}

impl Cli {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    /// The server to connect to: `--host`, else `--server`, else the
    /// configured current server.
    pub fn resolve_server(&self, config: &Config) -> ServerConfig {
        let fallback = config.current().cloned().unwrap_or_default();

        if let Some(host) = &self.host {
            return ServerConfig::from_target(host, self.identity_file.as_deref(), &fallback);
        }

        let mut server = self
            .server
            .as_deref()
            .and_then(|name| config.servers.iter().find(|s| s.name == name).cloned())
            .unwrap_or(fallback);

        if let Some(identity) = &self.identity_file {
            server.key_path = identity.to_string_lossy().into_owned();
        }
        server
    }
}
