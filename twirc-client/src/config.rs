//! Bot configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (given explicitly, or named by TWIRC_CONFIG)
//! 3. Environment variables

use crate::connection::ConnectionConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use twirc_protocol::command::PRIVMSG;

/// Environment variable naming the YAML config file.
pub const CONFIG_ENV_VAR: &str = "TWIRC_CONFIG";

/// Login details for one IRC server.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub nickname: String,
    /// Server password; for Twitch this is the `oauth:` token.
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
}

impl Credentials {
    pub fn new(nickname: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            nickname: nickname.into(),
            password: None,
            host: host.into(),
            port,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Returns `host:port`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("nickname", &self.nickname)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

/// Bot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server to connect to.
    pub server: ServerConfig,
    /// Who to log in as.
    pub identity: IdentityConfig,
    /// Channels to join once logged in.
    pub channels: Vec<String>,
    /// Queueing and flood-control limits.
    pub limits: LimitsConfig,
    /// Hold channel traffic until end of MOTD (376) is seen.
    pub wait_for_motd: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            identity: IdentityConfig::default(),
            channels: Vec::new(),
            limits: LimitsConfig::default(),
            wait_for_motd: true,
        }
    }
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    ///
    /// Without an explicit `path` the file named by `TWIRC_CONFIG` is used,
    /// if set.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from);
        Self::load_with(path.or(env_path.as_deref()), |key| std::env::var(key).ok())
    }

    /// Same as [`Config::load`], reading overrides through `lookup`.
    pub fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(lookup);
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies overrides from any `TWIRC_*` key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        self.server.apply_overrides(&lookup);
        self.identity.apply_overrides(&lookup);
        self.limits.apply_overrides(&lookup);

        if let Some(channels) = lookup("TWIRC_CHANNELS") {
            self.channels = channels
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(normalize_channel)
                .collect();
        }

        if let Some(wait) = lookup("TWIRC_WAIT_FOR_MOTD") {
            self.wait_for_motd = parse_bool(&wait);
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.nickname.trim().is_empty() {
            return Err(ConfigError::Validation("nickname is not set".to_string()));
        }
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::Validation("server host is not set".to_string()));
        }
        if self.server.port == 0 {
            return Err(ConfigError::Validation("server port is 0".to_string()));
        }
        if self.limits.flood_max_messages == 0 {
            return Err(ConfigError::Validation(
                "flood_max_messages must be at least 1".to_string(),
            ));
        }
        if self.limits.flood_window_secs == 0 {
            return Err(ConfigError::Validation(
                "flood_window_secs must be at least 1".to_string(),
            ));
        }

        let needed = self.min_line_length();
        if self.limits.max_line_length < needed {
            return Err(ConfigError::Validation(format!(
                "max_line_length {} cannot hold a message to every channel (need at least {})",
                self.limits.max_line_length, needed
            )));
        }
        Ok(())
    }

    /// Shortest line that fits `PRIVMSG <channel> :` plus one character for
    /// every configured channel and the bot's own channel.
    fn min_line_length(&self) -> usize {
        let own = normalize_channel(&self.identity.nickname);
        let longest = self
            .channels
            .iter()
            .chain(std::iter::once(&own))
            .map(|c| c.chars().count())
            .max()
            .unwrap_or_default();
        PRIVMSG.len() + 1 + longest + 2 + 1
    }

    /// Returns the login credentials.
    pub fn credentials(&self) -> Credentials {
        Credentials {
            nickname: self.identity.nickname.clone(),
            password: self.identity.password.clone().filter(|p| !p.is_empty()),
            host: self.server.host.clone(),
            port: self.server.port,
        }
    }

    /// Validates and builds the runtime connection configuration.
    pub fn connection_config(&self) -> Result<ConnectionConfig, ConfigError> {
        self.validate()?;
        Ok(ConnectionConfig::new(self.credentials())
            .with_connect_timeout(self.server.connect_timeout())
            .with_read_chunk_size(self.limits.read_chunk_size)
            .with_max_queued_per_channel(self.limits.max_queued_per_channel)
            .with_max_line_length(self.limits.max_line_length)
            .with_flood_control(self.limits.flood_window(), self.limits.flood_max_messages)
            .with_wait_for_motd(self.wait_for_motd))
    }
}

/// Server address configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "irc.chat.twitch.tv".to_string(),
            port: twirc_protocol::DEFAULT_PORT,
            connect_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("TWIRC_HOST") {
            self.host = host;
        }

        if let Some(port) = lookup("TWIRC_PORT") {
            if let Ok(parsed) = port.parse() {
                self.port = parsed;
            }
        }

        if let Some(timeout) = lookup("TWIRC_CONNECT_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.connect_timeout_secs = secs;
            }
        }
    }

    /// Returns connect timeout as Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Login identity.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub nickname: String,
    /// Server password (Twitch: `oauth:...`). Prefer TWIRC_PASSWORD over the file.
    pub password: Option<String>,
}

impl IdentityConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(nick) = lookup("TWIRC_NICK") {
            self.nickname = nick;
        }

        if let Some(password) = lookup("TWIRC_PASSWORD") {
            if !password.is_empty() {
                self.password = Some(password);
            }
        }
    }
}

impl fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("nickname", &self.nickname)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Queueing and flood-control limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Bytes requested per socket read.
    pub read_chunk_size: usize,
    /// Capacity of each channel's outbound queue.
    pub max_queued_per_channel: usize,
    /// Outbound lines are cut to this many characters.
    pub max_line_length: usize,
    /// Flood-control window in seconds.
    pub flood_window_secs: u64,
    /// Messages allowed per channel within the window.
    pub flood_max_messages: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 512,
            max_queued_per_channel: 1000,
            max_line_length: 500,
            flood_window_secs: 30,
            flood_max_messages: 20,
        }
    }
}

impl LimitsConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(size) = lookup("TWIRC_READ_CHUNK_SIZE") {
            if let Ok(n) = size.parse() {
                self.read_chunk_size = n;
            }
        }

        if let Some(max) = lookup("TWIRC_MAX_QUEUED") {
            if let Ok(n) = max.parse() {
                self.max_queued_per_channel = n;
            }
        }

        if let Some(len) = lookup("TWIRC_MAX_LINE_LENGTH") {
            if let Ok(n) = len.parse() {
                self.max_line_length = n;
            }
        }

        if let Some(window) = lookup("TWIRC_FLOOD_WINDOW_SECS") {
            if let Ok(secs) = window.parse() {
                self.flood_window_secs = secs;
            }
        }

        if let Some(max) = lookup("TWIRC_FLOOD_MAX_MESSAGES") {
            if let Ok(n) = max.parse() {
                self.flood_max_messages = n;
            }
        }
    }

    /// Returns the flood-control window as Duration.
    pub fn flood_window(&self) -> Duration {
        Duration::from_secs(self.flood_window_secs)
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{}': {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("configuration validation failed: {0}")]
    Validation(String),

    #[error("max count is not configured for this window")]
    MaxCountNotConfigured,
}

/// Prefixes `#` when a channel name has no channel sigil.
pub fn normalize_channel(name: &str) -> String {
    if name.starts_with('#') || name.starts_with('&') {
        name.to_string()
    } else {
        format!("#{name}")
    }
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}
