//! Read-only server configuration.
//!
//! The engine only needs a resolved `(user, host, key_path)` triple. This
//! module finds one in `~/.config/dockforward/config.json`, falling back to a
//! built-in default server. The file is never written here.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DockforwardError, Result};

const CONFIG_DIR_NAME: &str = "dockforward";
const CONFIG_FILE_NAME: &str = "config.json";

const DEFAULT_SERVER_NAME: &str = "default";
const DEFAULT_HOST: &str = "c1.local:22";
const DEFAULT_USER: &str = "c1user";
const DEFAULT_KEY_PATH: &str = "~/.ssh/id_rsa";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub key_path: String,
}

impl ServerConfig {
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty()
            && !self.host.is_empty()
            && !self.user.is_empty()
            && !self.key_path.is_empty()
    }

    /// The key path with a leading `~` expanded.
    pub fn expanded_key_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.key_path).into_owned())
    }

    /// Host and SSH port, defaulting the port to 22.
    pub fn host_and_port(&self) -> (String, u16) {
        // Bracketed IPv6: [::1]:2222
        if let Some(rest) = self.host.strip_prefix('[') {
            if let Some((addr, tail)) = rest.split_once(']') {
                let port = tail
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(22);
                return (addr.to_string(), port);
            }
        }

        match self.host.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => match port.parse() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (self.host.clone(), 22),
            },
            _ => (self.host.clone(), 22),
        }
    }

    /// Parse `[user@]host[:port]`, filling gaps from `fallback`.
    pub fn from_target(target: &str, key_path: Option<&Path>, fallback: &ServerConfig) -> Self {
        let (user, host) = match target.split_once('@') {
            Some((user, host)) => (user.to_string(), host.to_string()),
            None => (fallback.user.clone(), target.to_string()),
        };

        Self {
            name: host.clone(),
            host,
            user,
            key_path: key_path
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| fallback.key_path.clone()),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_SERVER_NAME.to_string(),
            host: DEFAULT_HOST.to_string(),
            user: DEFAULT_USER.to_string(),
            key_path: DEFAULT_KEY_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub current_server: String,
    #[serde(default)]
    pub default_server: String,
}

impl Config {
    /// Load from the default location, or fall back to the built-in server.
    pub fn load_default() -> Self {
        let Some(path) = config_path() else {
            debug!("no config directory, using default server");
            return Self::builtin();
        };

        if !path.exists() {
            debug!(path = %path.display(), "no config file, using default server");
            return Self::builtin();
        }

        match Self::load_from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), %e, "failed to load config, using default server");
                Self::builtin()
            }
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| DockforwardError::Config(format!("failed to read {:?}: {}", path, e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = serde_json::from_str(content)
            .map_err(|e| DockforwardError::Config(format!("failed to parse config: {}", e)))?;
        config.validate_and_cleanup();

        if config.servers.is_empty() {
            debug!("config has no valid servers, using default server");
            return Ok(Self::builtin());
        }

        Ok(config)
    }

    fn builtin() -> Self {
        Self {
            servers: vec![ServerConfig::default()],
            current_server: DEFAULT_SERVER_NAME.to_string(),
            default_server: DEFAULT_SERVER_NAME.to_string(),
        }
    }

    /// Drop incomplete servers and repair dangling current/default names.
    fn validate_and_cleanup(&mut self) {
        let before = self.servers.len();
        self.servers.retain(ServerConfig::is_valid);
        if self.servers.len() != before {
            warn!(dropped = before - self.servers.len(), "ignoring incomplete server entries");
        }

        if !self.has_server(&self.default_server) {
            self.default_server.clear();
        }
        if !self.has_server(&self.current_server) {
            self.current_server = self.default_server.clone();
        }

        if self.default_server.is_empty() {
            if let Some(first) = self.servers.first() {
                self.default_server = first.name.clone();
                self.current_server = first.name.clone();
            }
        }
    }

    fn has_server(&self, name: &str) -> bool {
        !name.is_empty() && self.servers.iter().any(|s| s.name == name)
    }

    /// Current server, else the default server, else the first one.
    pub fn current(&self) -> Option<&ServerConfig> {
        self.servers
            .iter()
            .find(|s| s.name == self.current_server)
            .or_else(|| self.servers.iter().find(|s| s.name == self.default_server))
            .or_else(|| self.servers.first())
    }
}

/// `~/.config/dockforward/config.json` (platform equivalent elsewhere).
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}
