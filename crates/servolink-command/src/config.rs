use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use servolink_driver::{RobotSpec, TeleopSpec};

use crate::adapters::Gr00tActionConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub default_mode: Option<String>,
    #[serde(default)]
    pub teleops: BTreeMap<String, TeleopEndpointConfig>,
    #[serde(default)]
    pub ai: Option<AiConfig>,
    #[serde(default)]
    pub data: Option<DataConfig>,
    #[serde(default)]
    pub webviz: Option<WebvizConfig>,
    #[serde(default)]
    pub camera_stream: Option<CameraEndpointConfig>,
    #[serde(default)]
    pub metadata: Option<serde_yaml::Value>,
}

impl Config {
    pub fn load(explicit_path: Option<PathBuf>) -> Result<Self> {
        let config_path = explicit_path
            .or_else(resolve_config_path)
            .context("command config path not found (SERVOLINK_CONFIG_PATH or servolink-command.yaml)")?;

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
        if let Some(mode) = &self.default_mode {
            let trimmed = mode.trim().to_string();
            self.default_mode =
                if trimmed.is_empty() { None } else { Some(trimmed) };
        }
        for endpoint in self.teleops.values_mut() {
            endpoint.normalize();
        }
        if let Some(ai) = &mut self.ai {
            ai.normalize();
        }
        if let Some(data) = &mut self.data {
            data.normalize();
        }
    }

    fn validate(&self) -> Result<()> {
        for (name, endpoint) in &self.teleops {
            endpoint.validate(name)?;
        }
        if let Some(data) = &self.data {
            data.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    #[serde(default = "default_bind_host")]
    pub host: String,
    #[serde(default = "default_command_port")]
    pub port: u16,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub api_token: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_bind_host(),
            port: default_command_port(),
            timeout_ms: default_timeout_ms(),
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
        self.timeout_ms = self.timeout_ms.max(1);
        self.api_token = normalize_opt(self.api_token.take());
    }
}

/// Where an external dashboard should serve; the orchestrator only feeds
/// it through the exchange hook.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebvizConfig {
    #[serde(default = "default_bind_host")]
    pub host: String,
    #[serde(default = "default_webviz_port")]
    pub port: u16,
}

/// Where browser observers can subscribe to the edge's camera stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraEndpointConfig {
    #[serde(default = "default_bind_host")]
    pub host: String,
    #[serde(default = "default_camera_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeleopMode {
    Local,
    Remote,
}

/// One named teleop endpoint: either a local driver or a remote teleop
/// action server, optionally supervised by a process manager.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TeleopEndpointConfig {
    pub mode: TeleopMode,
    #[serde(default)]
    pub config: Option<TeleopSpec>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub manager: Option<ManagerEndpointConfig>,
}

impl TeleopEndpointConfig {
    fn normalize(&mut self) {
        self.host = normalize_opt(self.host.take());
        self.timeout_ms = self.timeout_ms.max(1);
        self.api_token = normalize_opt(self.api_token.take());
        if let Some(manager) = &mut self.manager {
            manager.normalize();
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        match self.mode {
            TeleopMode::Local => {
                if self.config.is_none() {
                    bail!("teleop '{name}' is local but has no 'config' block");
                }
            }
            TeleopMode::Remote => {
                if self.host.is_none() || self.port.is_none() {
                    bail!("teleop '{name}' is remote but lacks host/port");
                }
            }
        }
        if let Some(manager) = &self.manager {
            if manager.service.trim().is_empty() {
                bail!("teleop '{name}' manager config requires 'service'");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerEndpointConfig {
    pub service: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_manager_port")]
    pub port: u16,
    #[serde(default = "default_start_timeout_s")]
    pub start_timeout_s: f64,
    #[serde(default = "default_stop_timeout_s")]
    pub stop_timeout_s: f64,
}

impl ManagerEndpointConfig {
    fn normalize(&mut self) {
        self.service = self.service.trim().to_string();
        self.host = normalize_opt(self.host.take());
        self.start_timeout_s = self.start_timeout_s.max(0.1);
        self.stop_timeout_s = self.stop_timeout_s.max(0.1);
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AiConfig {
    #[serde(default = "default_loopback_host")]
    pub host: String,
    #[serde(default = "default_ai_port")]
    pub port: u16,
    #[serde(default = "default_ai_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub startup_timeout_ms: Option<u64>,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_instruction_key")]
    pub instruction_key: String,
    #[serde(default)]
    pub modality_config_path: Option<PathBuf>,
    #[serde(default)]
    pub camera_keys: Option<Vec<String>>,
    #[serde(default)]
    pub state_keys: Option<Vec<String>>,
    #[serde(default = "default_action_horizon")]
    pub action_horizon: usize,
    #[serde(default)]
    pub adapter: Option<Gr00tActionConfig>,
}

impl AiConfig {
    fn normalize(&mut self) {
        self.host = self.host.trim().to_string();
        if self.host.is_empty() {
            self.host = default_loopback_host();
        }
        self.timeout_ms = self.timeout_ms.max(1);
        self.api_token = normalize_opt(self.api_token.take());
        self.instruction_key = self.instruction_key.trim().to_string();
        if self.instruction_key.is_empty() {
            self.instruction_key = default_instruction_key();
        }
        self.action_horizon = self.action_horizon.max(1);
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    /// Robot the dataset is recorded for; used to announce the expected
    /// actuator channels.
    #[serde(default)]
    pub robot: Option<RobotSpec>,
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub teleop: Option<TeleopEndpointConfig>,
    #[serde(default)]
    pub display_data: bool,
    #[serde(default)]
    pub resume: bool,
    #[serde(default)]
    pub play_sounds: bool,
}

impl DataConfig {
    fn normalize(&mut self) {
        self.dataset.normalize();
        if let Some(teleop) = &mut self.teleop {
            teleop.normalize();
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(teleop) = &self.teleop {
            teleop.validate("data")?;
        }
        self.dataset.validate()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub repo_id: Option<String>,
    #[serde(default = "default_episode_time_s")]
    pub episode_time_s: f64,
    #[serde(default = "default_reset_time_s")]
    pub reset_time_s: f64,
    #[serde(default = "default_num_episodes")]
    pub num_episodes: usize,
    pub single_task: String,
}

impl DatasetConfig {
    fn normalize(&mut self) {
        self.episode_time_s = self.episode_time_s.max(1e-3);
        self.reset_time_s = self.reset_time_s.max(0.0);
        self.single_task = self.single_task.trim().to_string();
    }

    fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            bail!("data config missing `dataset.root`");
        }
        if self.single_task.is_empty() {
            bail!("data config missing `dataset.single_task`");
        }
        Ok(())
    }
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env("SERVOLINK_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }

    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    for name in ["servolink-command.yaml", "servolink-command.yml"] {
        let candidate = cwd.join(name);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_loopback_host() -> String {
    "127.0.0.1".to_string()
}

fn default_command_port() -> u16 {
    6000
}

fn default_manager_port() -> u16 {
    7100
}

fn default_webviz_port() -> u16 {
    8080
}

fn default_camera_port() -> u16 {
    7005
}

fn default_ai_port() -> u16 {
    5555
}

fn default_timeout_ms() -> u64 {
    1500
}

fn default_ai_timeout_ms() -> u64 {
    5000
}

fn default_instruction_key() -> String {
    "language_instruction".to_string()
}

fn default_action_horizon() -> usize {
    90
}

fn default_start_timeout_s() -> f64 {
    10.0
}

fn default_stop_timeout_s() -> f64 {
    5.0
}

fn default_episode_time_s() -> f64 {
    60.0
}

fn default_reset_time_s() -> f64 {
    10.0
}

fn default_num_episodes() -> usize {
    50
}

#[cfg(test)]
mod tests {
    use super::{Config, TeleopMode};

    #[test]
    fn minimal_document_gets_defaults() {
        let config: Config = serde_yaml::from_str("{}").expect("parse");
        assert_eq!(config.network.port, 6000);
        assert!(config.teleops.is_empty());
        assert!(config.ai.is_none());
    }

    #[test]
    fn full_document_parses() {
        let mut config: Config = serde_yaml::from_str(
            r#"
network:
  host: "0.0.0.0"
  port: 6001
  timeout_ms: 2000
  api_token: "secret"
default_mode: gamepad
teleops:
  gamepad:
    mode: local
    config:
      type: sim
      joints: [elbow]
  offsite:
    mode: remote
    host: "10.0.0.7"
    port: 7001
    timeout_ms: 1200
    manager:
      service: teleop-server
      port: 7100
ai:
  host: "10.0.0.9"
  port: 5555
  instruction_key: language_instruction
  action_horizon: 16
  adapter:
    left_arm: [l1.pos]
    left_gripper: lg.pos
data:
  robot:
    type: sim
  dataset:
    root: /tmp/demo-data
    episode_time_s: 30
    reset_time_s: 5
    num_episodes: 3
    single_task: "fold the towel"
  teleop:
    mode: local
    config:
      type: sim
webviz:
  host: "0.0.0.0"
  port: 8080
camera_stream:
  host: "0.0.0.0"
  port: 7005
"#,
        )
        .expect("parse");
        config.normalize();
        config.validate().expect("validate");

        assert_eq!(config.teleops.len(), 2);
        assert_eq!(config.teleops["gamepad"].mode, TeleopMode::Local);
        assert_eq!(config.teleops["offsite"].mode, TeleopMode::Remote);
        let ai = config.ai.expect("ai section");
        assert_eq!(ai.action_horizon, 16);
        assert!(ai.adapter.is_some());
        let data = config.data.expect("data section");
        assert_eq!(data.dataset.num_episodes, 3);
        assert!(data.robot.is_some());
        assert_eq!(config.webviz.expect("webviz section").port, 8080);
    }

    #[test]
    fn remote_teleop_without_endpoint_is_rejected() {
        let mut config: Config = serde_yaml::from_str(
            r#"
teleops:
  broken:
    mode: remote
"#,
        )
        .expect("parse");
        config.normalize();
        let err = config.validate().expect_err("must fail");
        assert!(err.to_string().contains("host/port"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed: Result<Config, _> =
            serde_yaml::from_str("surprise: true");
        assert!(parsed.is_err());
    }
}
