//! Configuration for the sandbox backend.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/deskline-sandbox/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;

/// Errors that can occur when loading sandbox configuration.
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
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SandboxConfigFile {
    sandbox: SandboxFileConfig,
}

/// `[sandbox]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SandboxFileConfig {
    bind_addr: Option<String>,
    public_url: Option<String>,
    seed: Option<bool>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the sandbox backend.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "In-memory Deskline backend for tests and local development")]
pub struct SandboxCliArgs {
    /// Address to bind to.
    #[arg(short, long, env = "DESKLINE_SANDBOX_ADDR")]
    pub bind: Option<String>,

    /// Base URL clients use to reach this server (upload and file links).
    #[arg(long, env = "DESKLINE_SANDBOX_PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Start every project empty instead of with demo conversations.
    #[arg(long)]
    pub no_seed: bool,

    /// Path to config file (default: `~/.config/deskline-sandbox/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "DESKLINE_SANDBOX_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved sandbox configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Address to bind the server to (e.g., `127.0.0.1:9300`).
    pub bind_addr: String,
    /// Externally visible base URL; derived from the bound address when unset.
    pub public_url: Option<String>,
    /// Seed new projects with demo conversations.
    pub seed: bool,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9300".to_string(),
            public_url: None,
            seed: true,
            log_level: "info".to_string(),
        }
    }
}

impl SandboxConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &SandboxCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &SandboxCliArgs, file: &SandboxConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.sandbox.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            public_url: cli
                .public_url
                .clone()
                .or_else(|| file.sandbox.public_url.clone()),
            seed: !cli.no_seed && file.sandbox.seed.unwrap_or(defaults.seed),
            log_level: cli.log_level.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<SandboxConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(SandboxConfigFile::default());
        };
        config_dir.join("deskline-sandbox").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SandboxConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
