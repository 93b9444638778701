use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use servolink_driver::RobotSpec;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub robot: RobotSpec,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default = "default_loop_hz")]
    pub loop_hz: f64,
    #[serde(default = "default_max_missed_actions")]
    pub max_missed_actions: u32,
    #[serde(default)]
    pub fallback_action: Option<BTreeMap<String, f64>>,
    #[serde(default = "default_true")]
    pub calibrate_on_start: bool,
    #[serde(default = "default_observation_adapter")]
    pub observation_adapter: String,
    #[serde(default)]
    pub observation_preprocess: Option<PreprocessConfig>,
    #[serde(default)]
    pub action_filter: Option<ActionFilterConfig>,
    #[serde(default)]
    pub camera_stream: Option<CameraStreamConfig>,
    #[serde(default)]
    pub metadata: Option<serde_yaml::Value>,
}

impl Config {
    pub fn load(explicit_path: Option<PathBuf>) -> Result<Self> {
        let config_path = explicit_path
            .or_else(resolve_config_path)
            .context("edge config path not found (SERVOLINK_CONFIG_PATH or servolink-control.yaml)")?;

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
        self.loop_hz = self.loop_hz.max(1e-3);
        self.observation_adapter =
            self.observation_adapter.trim().to_ascii_lowercase();
        if let Some(filter) = &mut self.action_filter {
            filter.normalize();
        }
        if let Some(stream) = &mut self.camera_stream {
            stream.normalize();
        }

        // Without an explicit stream section every robot camera is
        // published under its own name.
        if self.camera_stream.is_none() {
            let sources: Vec<CameraStreamSourceConfig> = self
                .robot
                .camera_names()
                .into_iter()
                .map(|name| CameraStreamSourceConfig {
                    path: format!("robot.cameras.{name}"),
                    name,
                    fps: None,
                    quality: None,
                })
                .collect();
            if !sources.is_empty() {
                self.camera_stream = Some(CameraStreamConfig {
                    host: default_publish_host(),
                    port: default_camera_port(),
                    quality: default_camera_quality(),
                    sources,
                });
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if !matches!(
            self.observation_adapter.as_str(),
            "numeric_only" | "identity"
        ) {
            bail!(
                "unknown observation_adapter '{}' (expected numeric_only or identity)",
                self.observation_adapter
            );
        }
        if let Some(filter) = &self.action_filter {
            filter.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    #[serde(default = "default_command_host")]
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
            host: default_command_host(),
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
            self.host = default_command_host();
        }
        self.timeout_ms = self.timeout_ms.max(1);
        self.api_token = self.api_token.take().and_then(|token| {
            let trimmed = token.trim();
            if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
        });
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreprocessConfig {
    #[serde(default = "default_preprocess_dim")]
    pub target_height: u32,
    #[serde(default = "default_preprocess_dim")]
    pub target_width: u32,
    #[serde(default = "default_interpolation")]
    pub interpolation: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionFilterConfig {
    #[serde(rename = "type", default = "default_filter_type")]
    pub filter_type: String,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_blend_alpha")]
    pub blend_alpha: f64,
}

impl ActionFilterConfig {
    fn normalize(&mut self) {
        self.filter_type = self.filter_type.trim().to_ascii_lowercase();
        self.window_size = self.window_size.max(1);
        self.blend_alpha = self.blend_alpha.clamp(0.0, 1.0);
    }

    fn validate(&self) -> Result<()> {
        if self.filter_type != "median" {
            bail!("unknown action filter type '{}'", self.filter_type);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraStreamConfig {
    #[serde(default = "default_publish_host")]
    pub host: String,
    #[serde(default = "default_camera_port")]
    pub port: u16,
    #[serde(default = "default_camera_quality")]
    pub quality: u8,
    #[serde(default)]
    pub sources: Vec<CameraStreamSourceConfig>,
}

impl CameraStreamConfig {
    fn normalize(&mut self) {
        self.host = self.host.trim().to_string();
        if self.host.is_empty() {
            self.host = default_publish_host();
        }
        self.quality = self.quality.clamp(1, 100);
        for source in &mut self.sources {
            source.name = source.name.trim().to_string();
            if source.path.trim().is_empty() {
                source.path = source.name.clone();
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraStreamSourceConfig {
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub quality: Option<u8>,
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(path) = env::var("SERVOLINK_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }

    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    for name in ["servolink-control.yaml", "servolink-control.yml"] {
        let candidate = cwd.join(name);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

fn default_loop_hz() -> f64 {
    30.0
}

fn default_max_missed_actions() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_observation_adapter() -> String {
    "numeric_only".to_string()
}

fn default_command_host() -> String {
    "127.0.0.1".to_string()
}

fn default_publish_host() -> String {
    "0.0.0.0".to_string()
}

fn default_command_port() -> u16 {
    6000
}

fn default_camera_port() -> u16 {
    7005
}

fn default_camera_quality() -> u8 {
    70
}

fn default_timeout_ms() -> u64 {
    1500
}

fn default_preprocess_dim() -> u32 {
    224
}

fn default_interpolation() -> String {
    "linear".to_string()
}

fn default_filter_type() -> String {
    "median".to_string()
}

fn default_window_size() -> usize {
    3
}

fn default_blend_alpha() -> f64 {
    0.3
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn minimal_edge_config_parses_with_defaults() {
        let mut config: Config = serde_yaml::from_str(
            r#"
robot:
  type: sim
"#,
        )
        .expect("parse");
        config.normalize();
        config.validate().expect("validate");

        assert_eq!(config.loop_hz, 30.0);
        assert_eq!(config.max_missed_actions, 3);
        assert!(config.calibrate_on_start);
        assert!(config.camera_stream.is_none());
    }

    #[test]
    fn camera_stream_is_inferred_from_robot_cameras() {
        let mut config: Config = serde_yaml::from_str(
            r#"
robot:
  type: sim
  camera:
    name: front
"#,
        )
        .expect("parse");
        config.normalize();

        let stream = config.camera_stream.expect("inferred stream");
        assert_eq!(stream.sources.len(), 1);
        assert_eq!(stream.sources[0].name, "front");
        assert_eq!(stream.sources[0].path, "robot.cameras.front");
    }

    #[test]
    fn full_edge_config_parses() {
        let mut config: Config = serde_yaml::from_str(
            r#"
robot:
  type: sim
  joints: [elbow]
network:
  host: "10.0.0.4"
  port: 6001
  timeout_ms: 800
  api_token: secret
loop_hz: 15
max_missed_actions: 2
fallback_action:
  elbow.pos: 0.1
calibrate_on_start: false
observation_adapter: identity
observation_preprocess:
  target_height: 128
  target_width: 128
  interpolation: nearest
action_filter:
  type: median
  window_size: 5
  blend_alpha: 0.4
camera_stream:
  host: "0.0.0.0"
  port: 7010
  quality: 60
  sources:
    - name: front
      path: robot.cameras.front
      fps: 10
"#,
        )
        .expect("parse");
        config.normalize();
        config.validate().expect("validate");

        assert_eq!(config.loop_hz, 15.0);
        let filter = config.action_filter.expect("filter");
        assert_eq!(filter.window_size, 5);
        let stream = config.camera_stream.expect("stream");
        assert_eq!(stream.sources[0].fps, Some(10.0));
    }

    #[test]
    fn bogus_filter_type_is_rejected() {
        let mut config: Config = serde_yaml::from_str(
            r#"
robot:
  type: sim
action_filter:
  type: kalman
"#,
        )
        .expect("parse");
        config.normalize();
        let err = config.validate().expect_err("must fail");
        assert!(err.to_string().contains("kalman"));
    }
}
