use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;
use servolink_driver::TeleopSpec;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    pub teleop: TeleopSpec,
    #[serde(default = "default_teleop_id")]
    pub teleop_id: String,
}

impl Config {
    pub fn load(explicit_path: Option<PathBuf>) -> Result<Self> {
        let config_path = explicit_path
            .or_else(resolve_config_path)
            .context("teleop config path not found (SERVOLINK_CONFIG_PATH or servolink-teleop.yaml)")?;

        let raw = std::fs::read(&config_path).with_context(|| {
            format!("failed to read config file {}", config_path.display())
        })?;
        let mut config: Config =
            serde_yaml::from_slice(&raw).with_context(|| {
                format!("failed to parse YAML config {}", config_path.display())
            })?;
        config.normalize();
        Ok(config)
    }

    fn normalize(&mut self) {
        self.network.normalize();
        self.teleop_id = self.teleop_id.trim().to_string();
        if self.teleop_id.is_empty() {
            self.teleop_id = default_teleop_id();
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    #[serde(default = "default_bind_host")]
    pub host: String,
    #[serde(default = "default_teleop_port")]
    pub port: u16,
    #[serde(default)]
    pub api_token: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_bind_host(),
            port: default_teleop_port(),
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

fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(path) = env::var("SERVOLINK_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }

    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    for name in ["servolink-teleop.yaml", "servolink-teleop.yml"] {
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

fn default_teleop_port() -> u16 {
    7001
}

fn default_teleop_id() -> String {
    "teleop".to_string()
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn teleop_config_parses() {
        let config: Config = serde_yaml::from_str(
            r#"
network:
  port: 7001
teleop:
  type: sim
  joints: [elbow]
teleop_id: sim-gamepad
"#,
        )
        .expect("parse");
        assert_eq!(config.teleop_id, "sim-gamepad");
        assert_eq!(config.network.port, 7001);
    }
}
