use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
}

impl Config {
    pub fn load(explicit_path: Option<PathBuf>) -> Result<Self> {
        let config_path = explicit_path
            .or_else(resolve_config_path)
            .context("manager config path not found (SERVOLINK_CONFIG_PATH or servolink-manager.yaml)")?;

        let raw = std::fs::read(&config_path).with_context(|| {
            format!("failed to read config file {}", config_path.display())
        })?;
        let mut config: Config =
            serde_yaml::from_slice(&raw).with_context(|| {
                format!("failed to parse YAML config {}", config_path.display())
            })?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        self.network.normalize();
        for spec in self.services.values_mut() {
            spec.normalize();
        }
    }

    fn validate(&self) -> Result<()> {
        for (name, spec) in &self.services {
            if spec.command.is_empty() {
                bail!("service '{name}' has an empty command");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    #[serde(default = "default_bind_host")]
    pub host: String,
    #[serde(default = "default_manager_port")]
    pub port: u16,
    #[serde(default)]
    pub api_token: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_bind_host(),
            port: default_manager_port(),
            api_token: None,
        }
    }
}

impl NetworkConfig {
    fn normalize(&mut self) {
        self.host = self.host.trim().to_string();
        if self.host.is_empty() {
            self.host = default_bind_host();
        }
        self.api_token = self.api_token.take().and_then(|token| {
            let trimmed = token.trim();
            if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
        });
    }
}

/// One supervised service: the command to spawn plus an optional TCP
/// readiness probe.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub ready_host: Option<String>,
    #[serde(default)]
    pub ready_port: Option<u16>,
    #[serde(default = "default_start_timeout_s")]
    pub start_timeout_s: f64,
    #[serde(default = "default_stop_timeout_s")]
    pub stop_timeout_s: f64,
}

impl ServiceSpec {
    fn normalize(&mut self) {
        self.command = self.command.trim().to_string();
        self.start_timeout_s = self.start_timeout_s.max(0.1);
        self.stop_timeout_s = self.stop_timeout_s.max(0.1);
    }
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(path) = env::var("SERVOLINK_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }

    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    for name in ["servolink-manager.yaml", "servolink-manager.yml"] {
        let candidate = cwd.join(name);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_manager_port() -> u16 {
    7100
}

fn default_start_timeout_s() -> f64 {
    10.0
}

fn default_stop_timeout_s() -> f64 {
    5.0
}
