//! Configuration management for tailshare
//!
//! Handles loading and saving configuration from ~/.config/tailshare/config.toml
//! and merging it with command-line overrides into a [`RuntimeConfig`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration file name
const CONFIG_FILE: &str = "config.toml";

/// Application name for config and data directories
const APP_NAME: &str = "tailshare";

/// Port the local HTTP listener binds when nothing else is configured
pub const DEFAULT_PORT: u16 = 7780;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Application configuration as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Port for the local HTTP listener
    #[serde(default)]
    pub default_port: Option<u16>,

    /// Start the background server automatically when a share is created
    #[serde(default)]
    pub autostart: Option<bool>,

    /// Never touch overlay routes; simulate success instead
    #[serde(default)]
    pub dry_run: Option<bool>,

    /// Path to the tailscale executable
    #[serde(default)]
    pub tailscale_bin: Option<PathBuf>,

    /// Path to the cloudflared executable
    #[serde(default)]
    pub cloudflared_bin: Option<PathBuf>,

    /// Backend ports that stale-route cleanup must never remove.
    /// Replaces the baseline set entirely when present.
    #[serde(default)]
    pub protected_ports: Option<Vec<u16>>,

    /// Directory for state, pid and generated tunnel config
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Log file for CLI invocations
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Create a new empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the config file path
    ///
    /// Returns ~/.config/tailshare/config.toml on Linux
    pub fn config_path() -> ConfigResult<PathBuf> {
        Ok(Self::config_dir()?.join(CONFIG_FILE))
    }

    /// Get the config directory path
    pub fn config_dir() -> ConfigResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join(APP_NAME))
    }

    /// Load configuration from file
    ///
    /// Returns default config if file doesn't exist
    pub fn load() -> ConfigResult<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> ConfigResult<()> {
        let path = Self::config_path()?;
        let dir = Self::config_dir()?;

        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(&path, contents)?;
        Ok(())
    }

    /// Merge this file configuration with command-line overrides.
    ///
    /// Overrides win over file values, file values win over built-in defaults.
    pub fn resolve(&self, overrides: &Overrides) -> RuntimeConfig {
        let dry_run = overrides.dry_run || self.dry_run.unwrap_or(false);

        RuntimeConfig {
            mode: if dry_run {
                RuntimeMode::DryRun
            } else {
                RuntimeMode::Live
            },
            data_dir: overrides
                .data_dir
                .clone()
                .or_else(|| self.data_dir.clone())
                .unwrap_or_else(default_data_dir),
            default_port: overrides
                .port
                .or(self.default_port)
                .unwrap_or(DEFAULT_PORT),
            autostart: self.autostart.unwrap_or(true),
            tailscale_bin: overrides
                .tailscale_bin
                .clone()
                .or_else(|| self.tailscale_bin.clone())
                .unwrap_or_else(|| PathBuf::from("tailscale")),
            cloudflared_bin: overrides
                .cloudflared_bin
                .clone()
                .or_else(|| self.cloudflared_bin.clone())
                .unwrap_or_else(|| PathBuf::from("cloudflared")),
            protected_ports: self.protected_ports.clone(),
            log_file: self.log_file.clone(),
        }
    }
}

/// Values supplied on the command line that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub dry_run: bool,
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub tailscale_bin: Option<PathBuf>,
    pub cloudflared_bin: Option<PathBuf>,
}

/// Whether overlay-tool side effects are performed or simulated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeMode {
    #[default]
    Live,
    DryRun,
}

impl RuntimeMode {
    pub fn is_dry_run(self) -> bool {
        self == RuntimeMode::DryRun
    }
}

/// Fully resolved settings threaded through every component
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub mode: RuntimeMode,
    pub data_dir: PathBuf,
    pub default_port: u16,
    pub autostart: bool,
    pub tailscale_bin: PathBuf,
    pub cloudflared_bin: PathBuf,
    pub protected_ports: Option<Vec<u16>>,
    pub log_file: Option<PathBuf>,
}

impl RuntimeConfig {
    /// Runtime config rooted at `data_dir` with every other value defaulted
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let mut config = Config::default().resolve(&Overrides::default());
        config.data_dir = data_dir.into();
        config
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("server.pid")
    }

    pub fn tunnel_config_path(&self) -> PathBuf {
        self.data_dir.join("cloudflared.yml")
    }

    pub fn server_log_path(&self) -> PathBuf {
        self.data_dir.join("server.log")
    }

    pub fn tunnel_log_path(&self) -> PathBuf {
        self.data_dir.join("cloudflared.log")
    }
}

/// Default directory for state and runtime files
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Format the configuration for display
pub fn format_config(config: &Config, runtime: &RuntimeConfig) -> String {
    let mut lines = Vec::new();

    lines.push("Current configuration:".to_string());
    lines.push(String::new());

    match config.default_port {
        Some(port) => lines.push(format!("  default_port = {}", port)),
        None => lines.push(format!("  default_port = (not set, using {})", DEFAULT_PORT)),
    }

    match config.autostart {
        Some(autostart) => lines.push(format!("  autostart = {}", autostart)),
        None => lines.push("  autostart = (not set, using true)".to_string()),
    }

    lines.push(format!("  dry_run = {}", runtime.mode.is_dry_run()));
    lines.push(format!(
        "  tailscale_bin = \"{}\"",
        runtime.tailscale_bin.display()
    ));
    lines.push(format!(
        "  cloudflared_bin = \"{}\"",
        runtime.cloudflared_bin.display()
    ));

    match config.protected_ports {
        Some(ref ports) => lines.push(format!("  protected_ports = {:?}", ports)),
        None => lines.push("  protected_ports = (not set, using state)".to_string()),
    }

    lines.push(format!("  data_dir = \"{}\"", runtime.data_dir.display()));

    lines.join("\n")
}
