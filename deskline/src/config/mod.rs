//! Configuration system for the Deskline console.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/deskline/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur when loading configuration.
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

    /// A required value was not provided anywhere.
    #[error("missing required setting `{0}` (pass it on the command line or in [server])")]
    Missing(&'static str),

    /// A URL setting could not be parsed.
    #[error("invalid URL for `{name}`: {source}")]
    InvalidUrl {
        /// Setting name.
        name: &'static str,
        /// Parse failure.
        source: url::ParseError,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    sync: SyncFileConfig,
    reconnect: ReconnectFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    ws_url: Option<String>,
    api_url: Option<String>,
    project: Option<String>,
    connect_timeout_secs: Option<u64>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    conversation_page_size: Option<u32>,
    message_page_size: Option<u32>,
    notification_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    initial_delay_ms: Option<u64>,
    max_delay_secs: Option<u64>,
    max_attempts: Option<u32>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Paging and notification settings used by the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// `limit` sent with `getConversations`.
    pub conversation_page_size: u32,
    /// `limit` sent with `getMessages`.
    pub message_page_size: u32,
    /// How long a notification stays visible.
    pub notification_duration: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conversation_page_size: 20,
            message_page_size: 30,
            notification_duration: Duration::from_secs(4),
        }
    }
}

/// Exponential backoff used after an abnormal disconnect.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Attempts before the connection gives up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (1-based): doubles from
    /// `initial_delay` and is capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1_u32 << shift)
            .min(self.max_delay)
    }
}

/// Fully resolved console configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint of the backend.
    pub ws_url: Option<String>,
    /// Base URL of the REST API.
    pub api_url: Option<String>,
    /// Project scope the console works in.
    pub project: Option<String>,
    /// Timeout for establishing the WebSocket.
    pub connect_timeout: Duration,
    /// Capacity of the intent channel feeding the engine.
    pub channel_capacity: usize,
    /// Engine paging and notification settings.
    pub sync: SyncConfig,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: None,
            api_url: None,
            project: None,
            connect_timeout: Duration::from_secs(10),
            channel_capacity: 256,
            sync: SyncConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Endpoints needed to go online, validated.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub ws_url: url::Url,
    pub api_url: url::Url,
    pub project: String,
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            ws_url: cli.ws_url.clone().or_else(|| file.server.ws_url.clone()),
            api_url: cli.api_url.clone().or_else(|| file.server.api_url.clone()),
            project: cli.project.clone().or_else(|| file.server.project.clone()),
            connect_timeout: file
                .server
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            channel_capacity: file
                .sync
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            sync: SyncConfig {
                conversation_page_size: cli
                    .page_size
                    .or(file.sync.conversation_page_size)
                    .unwrap_or(defaults.sync.conversation_page_size),
                message_page_size: file
                    .sync
                    .message_page_size
                    .unwrap_or(defaults.sync.message_page_size),
                notification_duration: file
                    .sync
                    .notification_secs
                    .map_or(defaults.sync.notification_duration, Duration::from_secs),
            },
            reconnect: ReconnectConfig {
                initial_delay: file
                    .reconnect
                    .initial_delay_ms
                    .map_or(defaults.reconnect.initial_delay, Duration::from_millis),
                max_delay: file
                    .reconnect
                    .max_delay_secs
                    .map_or(defaults.reconnect.max_delay, Duration::from_secs),
                max_attempts: file
                    .reconnect
                    .max_attempts
                    .unwrap_or(defaults.reconnect.max_attempts),
            },
        }
    }

    /// Validate and return the endpoints needed to go online.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when a URL or the project is not
    /// configured, or [`ConfigError::InvalidUrl`] when a URL does not parse.
    pub fn endpoints(&self) -> Result<Endpoints, ConfigError> {
        let ws_url = self.ws_url.as_deref().ok_or(ConfigError::Missing("ws_url"))?;
        let api_url = self
            .api_url
            .as_deref()
            .ok_or(ConfigError::Missing("api_url"))?;
        let project = self
            .project
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or(ConfigError::Missing("project"))?;

        Ok(Endpoints {
            ws_url: url::Url::parse(ws_url).map_err(|source| ConfigError::InvalidUrl {
                name: "ws_url",
                source,
            })?,
            api_url: url::Url::parse(api_url).map_err(|source| ConfigError::InvalidUrl {
                name: "api_url",
                source,
            })?,
            project,
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Live customer-conversation console")]
pub struct CliArgs {
    /// WebSocket URL of the backend (e.g. `ws://localhost:9300/ws`).
    #[arg(long, env = "DESKLINE_WS_URL")]
    pub ws_url: Option<String>,

    /// Base URL of the REST API (e.g. `http://localhost:9300/api`).
    #[arg(long, env = "DESKLINE_API_URL")]
    pub api_url: Option<String>,

    /// Project to open.
    #[arg(short, long, env = "DESKLINE_PROJECT")]
    pub project: Option<String>,

    /// Conversations fetched per page.
    #[arg(long)]
    pub page_size: Option<u32>,

    /// Path to config file (default: `~/.config/deskline/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "DESKLINE_LOG")]
    pub log_level: String,

    /// Path to log file (logs go to stderr when unset).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("deskline").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
