//! Configuration surface consumed by the gateway and cluster manager.
//!
//! The file lives in the platform config directory as TOML. The core only
//! reads it; persistence, backup, and editing belong to outer tooling.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::algorithms::Algorithm;
use crate::balancer::Target;
use crate::cluster::Mode;
use crate::error::ConfigError;
use crate::gateway::DEFAULT_HEARTBEAT_MS;
use crate::upstream::ClientConfig;

const APP_QUALIFIER: &str = "dev";
const APP_ORG: &str = "proxygate";
const APP_NAME: &str = "proxy_gate";

/// Heartbeat as written in config: a single steady interval or a graduated
/// schedule, both in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeartbeatSpec {
    Steady(u64),
    Schedule(Vec<u64>),
}

impl HeartbeatSpec {
    pub fn delays(&self) -> Vec<u64> {
        match self {
            Self::Steady(ms) => vec![*ms],
            Self::Schedule(delays) => delays.clone(),
        }
    }
}

impl Default for HeartbeatSpec {
    fn default() -> Self {
        Self::Schedule(DEFAULT_HEARTBEAT_MS.to_vec())
    }
}

/// Health probe tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    #[serde(default = "default_probe_host")]
    pub host: String,
    #[serde(default = "default_probe_port")]
    pub port: u16,
    /// Budget for connecting to a target's local port
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Budget for the whole probe exchange
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_probe_host() -> String {
    crate::health::DEFAULT_PROBE_HOST.to_string()
}

fn default_probe_port() -> u16 {
    crate::health::DEFAULT_PROBE_PORT
}

fn default_connect_timeout_ms() -> u64 {
    1_000
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            host: default_probe_host(),
            port: default_probe_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub heartbeat: HeartbeatSpec,
    #[serde(default = "default_cluster_size")]
    pub cluster_size: usize,
    #[serde(default)]
    pub probe: ProbeSettings,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    1081
}

fn default_cluster_size() -> usize {
    3
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            mode: Mode::default(),
            algorithm: Algorithm::default(),
            heartbeat: HeartbeatSpec::default(),
            cluster_size: default_cluster_size(),
            probe: ProbeSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub settings: Settings,
    /// Static targets for running the gateway without a managed cluster
    #[serde(default)]
    pub targets: Vec<Target>,
    /// Candidate configs for cluster mode; only some run at a time
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound { path: path.clone() }.into());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed reading config {}", path.display()))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("Failed parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed creating config dir {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed writing config {}", path.display()))?;
        Ok(())
    }

    /// Reject configs the core cannot run with. Returns the typed error so
    /// a settings surface can match on it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for target in &self.targets {
            if !seen.insert(target.id) {
                return Err(ConfigError::DuplicateTarget { id: target.id });
            }
        }
        if self.settings.heartbeat.delays().is_empty() {
            return Err(ConfigError::EmptyHeartbeat);
        }
        Ok(())
    }
}

pub fn config_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or(ConfigError::ProjectDirsNotFound)?;
    Ok(dirs.config_dir().to_path_buf())
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn state_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or(ConfigError::ProjectDirsNotFound)?;
    Ok(dirs.data_dir().to_path_buf())
}
