//! Configuration system for the Murmur server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/murmur-server/config.toml`)
//! 4. Compiled defaults

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use murmur_proto::message::{DEFAULT_MAX_MESSAGE_CHARS, UserId, UserProfile};

use crate::engine::{DEFAULT_PAGE_SIZE, DEFAULT_TYPING_TIMEOUT, EngineConfig};
use crate::gateway::{
    DEFAULT_AUTH_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_OUTBOUND_QUEUE_SIZE, GatewayConfig,
};
use crate::identity::{ConfiguredVerifier, JwtVerifier, StaticVerifier};

/// Errors that can occur when loading server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A value is out of range or malformed.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Configuration key.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// Neither a JWT secret nor static tokens were configured.
    #[error("no identity verifier configured: set auth.jwt_secret or auth.static_tokens")]
    NoVerifier,
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerConfigFile {
    server: ServerSection,
    chat: ChatSection,
    auth: AuthSection,
    storage: StorageSection,
}

/// `[server]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerSection {
    bind_addr: Option<String>,
    log_level: Option<String>,
    auth_timeout_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    outbound_queue_size: Option<usize>,
}

/// `[chat]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatSection {
    history_page_size: Option<usize>,
    max_message_chars: Option<usize>,
    typing_timeout_ms: Option<u64>,
}

/// `[auth]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct AuthSection {
    jwt_secret: Option<String>,
    /// token -> user id
    static_tokens: BTreeMap<String, String>,
}

/// `[storage]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageSection {
    database_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Murmur real-time messaging server")]
pub struct ServerCliArgs {
    /// Address to bind the server to.
    #[arg(short, long, env = "MURMUR_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/murmur-server/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, env = "MURMUR_LOG")]
    pub log_level: Option<String>,

    /// Messages per history page.
    #[arg(long)]
    pub history_page_size: Option<usize>,

    /// Maximum characters per message.
    #[arg(long)]
    pub max_message_chars: Option<usize>,

    /// Typing indicator expiry in milliseconds.
    #[arg(long)]
    pub typing_timeout_ms: Option<u64>,

    /// Seconds a client has to authenticate.
    #[arg(long)]
    pub auth_timeout_secs: Option<u64>,

    /// Seconds between server pings.
    #[arg(long)]
    pub heartbeat_interval_secs: Option<u64>,

    /// Per-session outbound queue capacity.
    #[arg(long)]
    pub outbound_queue_size: Option<usize>,

    /// HS256 secret for access tokens.
    #[arg(long, env = "MURMUR_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Development token, as `TOKEN=USER_ID`. Repeatable.
    #[arg(long = "static-token", value_name = "TOKEN=USER_ID")]
    pub static_tokens: Vec<String>,

    /// SQLite database file; omit for an in-memory store.
    #[arg(long, env = "MURMUR_DATABASE")]
    pub database_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:9000`).
    pub bind_addr: String,
    /// Log level filter string.
    pub log_level: String,
    /// Messages per history page.
    pub history_page_size: usize,
    /// Maximum characters per message.
    pub max_message_chars: usize,
    /// Typing indicator expiry.
    pub typing_timeout: Duration,
    /// Authentication window.
    pub auth_timeout: Duration,
    /// Interval between server pings.
    pub heartbeat_interval: Duration,
    /// Per-session outbound queue capacity.
    pub outbound_queue_size: usize,
    /// HS256 secret, if JWT auth is enabled.
    pub jwt_secret: Option<String>,
    /// Development tokens: token -> user id.
    pub static_tokens: BTreeMap<String, UserId>,
    /// SQLite file; `None` means in-memory.
    pub database_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            log_level: "info".to_string(),
            history_page_size: DEFAULT_PAGE_SIZE,
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            outbound_queue_size: DEFAULT_OUTBOUND_QUEUE_SIZE,
            jwt_secret: None,
            static_tokens: BTreeMap::new(),
            database_path: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and missing file
    /// is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if a value is out of range.
    pub fn load(cli: &ServerCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Resolve a `ServerConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &ServerCliArgs, file: &ServerConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let mut static_tokens = BTreeMap::new();
        for (token, user) in &file.auth.static_tokens {
            static_tokens.insert(token.clone(), parse_user("auth.static_tokens", user)?);
        }
        for entry in &cli.static_tokens {
            let (token, user) = entry.split_once('=').ok_or_else(|| ConfigError::Invalid {
                key: "static-token",
                reason: format!("expected TOKEN=USER_ID, got {entry:?}"),
            })?;
            static_tokens.insert(token.to_string(), parse_user("static-token", user)?);
        }

        let config = Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            log_level: cli
                .log_level
                .clone()
                .or_else(|| file.server.log_level.clone())
                .unwrap_or(defaults.log_level),
            history_page_size: cli
                .history_page_size
                .or(file.chat.history_page_size)
                .unwrap_or(defaults.history_page_size),
            max_message_chars: cli
                .max_message_chars
                .or(file.chat.max_message_chars)
                .unwrap_or(defaults.max_message_chars),
            typing_timeout: cli
                .typing_timeout_ms
                .or(file.chat.typing_timeout_ms)
                .map_or(defaults.typing_timeout, Duration::from_millis),
            auth_timeout: cli
                .auth_timeout_secs
                .or(file.server.auth_timeout_secs)
                .map_or(defaults.auth_timeout, Duration::from_secs),
            heartbeat_interval: cli
                .heartbeat_interval_secs
                .or(file.server.heartbeat_interval_secs)
                .map_or(defaults.heartbeat_interval, Duration::from_secs),
            outbound_queue_size: cli
                .outbound_queue_size
                .or(file.server.outbound_queue_size)
                .unwrap_or(defaults.outbound_queue_size),
            jwt_secret: cli.jwt_secret.clone().or_else(|| file.auth.jwt_secret.clone()),
            static_tokens,
            database_path: cli
                .database_path
                .clone()
                .or_else(|| file.storage.database_path.clone()),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("history_page_size", self.history_page_size),
            ("max_message_chars", self.max_message_chars),
            ("outbound_queue_size", self.outbound_queue_size),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "heartbeat_interval_secs",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Engine tunables derived from this configuration.
    #[must_use]
    pub const fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            page_size: self.history_page_size,
            max_message_chars: self.max_message_chars,
            typing_timeout: self.typing_timeout,
        }
    }

    /// Gateway tunables derived from this configuration.
    #[must_use]
    pub const fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            auth_timeout: self.auth_timeout,
            heartbeat_interval: self.heartbeat_interval,
            outbound_queue_size: self.outbound_queue_size,
        }
    }

    /// Builds the identity verifier: JWT when a secret is set, otherwise the
    /// static token table.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoVerifier`] if neither is configured.
    pub fn verifier(&self) -> Result<ConfiguredVerifier, ConfigError> {
        if let Some(secret) = &self.jwt_secret {
            return Ok(ConfiguredVerifier::Jwt(JwtVerifier::new(secret.as_bytes())));
        }
        if self.static_tokens.is_empty() {
            return Err(ConfigError::NoVerifier);
        }
        Ok(ConfiguredVerifier::Static(self.static_tokens.iter().fold(
            StaticVerifier::new(),
            |verifier, (token, user)| {
                verifier.with_token(token.clone(), UserProfile::new(user.clone(), user.as_str()))
            },
        )))
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn parse_user(key: &'static str, raw: &str) -> Result<UserId, ConfigError> {
    UserId::parse(raw).map_err(|e| ConfigError::Invalid {
        key,
        reason: e.to_string(),
    })
}

/// Load and parse a TOML config file for the server.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<ServerConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ServerConfigFile::default());
        };
        config_dir.join("murmur-server").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
