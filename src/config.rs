//! Layered application configuration.
//!
//! Sources, lowest priority first: compiled defaults, the system config file,
//! the user config file (or `--config`), `EXTDRIVE_*` environment variables,
//! then command line overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const SYSTEM_CONFIG_PATH: &str = "/etc/extdrive/config.toml";
const ENV_PREFIX: &str = "EXTDRIVE_";

/// Locations of the external tools, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub lsblk: PathBuf,
    pub udisksctl: PathBuf,
    pub sync: PathBuf,
    pub dd: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            lsblk: PathBuf::from("lsblk"),
            udisksctl: PathBuf::from("udisksctl"),
            sync: PathBuf::from("sync"),
            dd: PathBuf::from("dd"),
        }
    }
}

impl ToolPaths {
    /// Resolve bare tool names against `PATH`. Names that cannot be found are
    /// kept as-is so the failure surfaces when the tool is used.
    pub fn resolve(&self) -> Self {
        Self {
            lsblk: resolve_tool(&self.lsblk),
            udisksctl: resolve_tool(&self.udisksctl),
            sync: resolve_tool(&self.sync),
            dd: resolve_tool(&self.dd),
        }
    }
}

fn resolve_tool(tool: &Path) -> PathBuf {
    if tool.components().count() > 1 {
        return tool.to_path_buf();
    }
    match which::which(tool) {
        Ok(path) => {
            debug!(tool = %tool.display(), path = %path.display(), "Resolved tool");
            path
        }
        Err(e) => {
            warn!(tool = %tool.display(), error = %e, "Tool not found on PATH");
            tool.to_path_buf()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloneConfig {
    /// Copy tool block size in bytes.
    pub block_size: u64,
    pub poll_interval_ms: u64,
    /// How long a cancelled copy may take to exit before it is killed.
    pub terminate_grace_ms: u64,
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            block_size: 4 * 1024 * 1024,
            poll_interval_ms: 333,
            terminate_grace_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Where generated clone images are written.
    pub backup_directory: PathBuf,
    pub refresh_interval_ms: u64,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    pub tools: ToolPaths,
    pub clone: CloneConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backup_directory: PathBuf::from("."),
            refresh_interval_ms: 1000,
            simulation: false,
            verbose: false,
            json_logs: false,
            log_file: None,
            tools: ToolPaths::default(),
            clone: CloneConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load the layered configuration.
    ///
    /// `config_file` replaces the per-user config file. `overrides` is
    /// serialized on top of everything else; fields it skips keep their value.
    pub fn new<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH));

        match config_file {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file not found: {}", path.display());
                }
                figment = figment.merge(Toml::file(path));
            }
            None => {
                if let Some(path) = user_config_path() {
                    figment = figment.merge(Toml::file(path));
                }
            }
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment
            .extract()
            .context("Failed to load configuration")
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

fn user_config_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(base.join("extdrive").join("config.toml"))
}
