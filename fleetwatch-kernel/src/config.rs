use crate::models::FleetUnit;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "FLEETWATCH_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "fleet.yaml";

/// Loopback entries are placeholders in deployment files, never monitored.
const LOOPBACK: &str = "127.0.0.1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub fleet: BTreeMap<String, UnitConf>,
    #[serde(default)]
    pub system: SystemConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitConf {
    pub name: String,
    pub ip: Option<String>,
    #[serde(default)]
    pub has_motors: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConf {
    /// Status cycle period, seconds
    pub update_interval: f64,
    /// Telemetry cycle period, seconds
    pub motor_update_interval: f64,
    pub ping_timeout_secs: f64,
    pub ssh_connect_timeout_secs: f64,
    pub ssh_command_timeout_secs: f64,
    pub api_timeout_secs: f64,
    pub allow_simulated_telemetry: bool,
    pub log_dir: PathBuf,
    /// Extra ssh arguments, shell-quoted
    pub ssh_options: Option<String>,
}

impl Default for SystemConf {
    fn default() -> Self {
        Self {
            update_interval: 1.0,
            motor_update_interval: 1.0,
            ping_timeout_secs: 5.0,
            ssh_connect_timeout_secs: 15.0,
            ssh_command_timeout_secs: 20.0,
            api_timeout_secs: 10.0,
            allow_simulated_telemetry: false,
            log_dir: PathBuf::from("logs"),
            ssh_options: None,
        }
    }
}

impl SystemConf {
    pub fn status_interval(&self) -> Duration {
        Duration::from_secs_f64(self.update_interval)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs_f64(self.motor_update_interval)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ping_timeout_secs)
    }

    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ssh_connect_timeout_secs)
    }

    pub fn ssh_command_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ssh_command_timeout_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.api_timeout_secs)
    }
}

impl FleetConfig {
    pub fn from_yaml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: FleetConfig = serde_yaml::from_str(text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sys = &self.system;
        for (name, value) in [
            ("update_interval", sys.update_interval),
            ("motor_update_interval", sys.motor_update_interval),
            ("ping_timeout_secs", sys.ping_timeout_secs),
            ("ssh_connect_timeout_secs", sys.ssh_connect_timeout_secs),
            ("ssh_command_timeout_secs", sys.ssh_command_timeout_secs),
            ("api_timeout_secs", sys.api_timeout_secs),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid(format!("{} must be > 0, got {}", name, value)));
            }
            if Duration::try_from_secs_f64(value).is_err() {
                return Err(ConfigError::Invalid(format!("{} is out of range, got {}", name, value)));
            }
        }
        if sys.ssh_connect_timeout_secs > sys.ssh_command_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "ssh_connect_timeout_secs ({}) exceeds ssh_command_timeout_secs ({})",
                sys.ssh_connect_timeout_secs, sys.ssh_command_timeout_secs
            )));
        }
        if let Some(options) = &sys.ssh_options {
            shell_words::split(options)
                .map_err(|e| ConfigError::Invalid(format!("ssh_options: {}", e)))?;
        }
        Ok(())
    }

    /// Registry entries, in config key order. Entries without an address or
    /// on loopback are left out.
    pub fn units(&self) -> Vec<FleetUnit> {
        self.fleet
            .iter()
            .filter_map(|(key, conf)| {
                let ip = conf.ip.as_deref().map(str::trim).unwrap_or("");
                if ip.is_empty() || ip == LOOPBACK {
                    info!(entry = %key, "fleet entry without a routable address, not monitored");
                    return None;
                }
                Some(FleetUnit::new(conf.name.trim(), ip, conf.has_motors))
            })
            .collect()
    }
}

pub async fn load_config_from(path: &Path) -> Result<FleetConfig, ConfigError> {
    if !path.exists() {
        warn!(path = %path.display(), "no config file, using defaults with an empty fleet");
        return Ok(FleetConfig::default());
    }
    let text = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    FleetConfig::from_yaml(&text, path)
}

/// Path from `FLEETWATCH_CONFIG`, falling back to `fleet.yaml`.
pub async fn load_config() -> Result<FleetConfig, ConfigError> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    load_config_from(Path::new(&path)).await
}
