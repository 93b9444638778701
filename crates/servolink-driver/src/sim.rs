use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use servolink_proto::{NdArray, Value, ValueMap};
use tracing::info;

use crate::{ActionFeatures, DriverError, RobotController, Teleoperator};

fn default_joints() -> Vec<String> {
    ["shoulder_pan", "shoulder_lift", "elbow_flex", "wrist_flex", "gripper"]
        .iter()
        .map(|name| name.to_string())
        .collect()
}

fn default_camera_dim() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimCameraConfig {
    pub name: String,
    #[serde(default = "default_camera_dim")]
    pub width: usize,
    #[serde(default = "default_camera_dim")]
    pub height: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimRobotConfig {
    #[serde(default = "default_joints")]
    pub joints: Vec<String>,
    #[serde(default)]
    pub camera: Option<SimCameraConfig>,
}

/// Deterministic loopback robot: joints drift toward the last commanded
/// targets, the optional camera renders a moving gradient. Exists so the
/// services can run end to end without hardware.
pub struct SimRobot {
    config: SimRobotConfig,
    connected: bool,
    tick: u64,
    targets: BTreeMap<String, f64>,
    positions: BTreeMap<String, f64>,
}

impl SimRobot {
    pub fn new(config: SimRobotConfig) -> Self {
        let positions = config
            .joints
            .iter()
            .map(|joint| (format!("{joint}.pos"), 0.0))
            .collect();
        Self {
            config,
            connected: false,
            tick: 0,
            targets: BTreeMap::new(),
            positions,
        }
    }

    fn render_camera(
        &self,
        camera: &SimCameraConfig,
    ) -> Result<NdArray, DriverError> {
        let width = camera.width.max(1);
        let height = camera.height.max(1);
        let mut pixels = Vec::with_capacity(width * height * 3);
        let phase = (self.tick % 256) as usize;
        for row in 0..height {
            for col in 0..width {
                pixels.push(((row + phase) % 256) as u8);
                pixels.push(((col + phase) % 256) as u8);
                pixels.push((phase % 256) as u8);
            }
        }
        NdArray::from_u8(vec![height, width, 3], pixels)
            .map_err(|err| DriverError::Hardware(err.to_string()))
    }
}

#[async_trait]
impl RobotController for SimRobot {
    async fn connect(&mut self, calibrate: bool) -> Result<(), DriverError> {
        self.connected = true;
        self.tick = 0;
        info!("sim robot connected: calibrate={}", calibrate);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DriverError> {
        self.connected = false;
        info!("sim robot disconnected");
        Ok(())
    }

    async fn observe(&mut self) -> Result<ValueMap, DriverError> {
        if !self.connected {
            return Err(DriverError::NotConnected);
        }
        self.tick += 1;

        // Each joint closes 20% of the gap to its commanded target per tick.
        for (channel, position) in self.positions.iter_mut() {
            let target = self.targets.get(channel).copied().unwrap_or(0.0);
            *position += (target - *position) * 0.2;
        }

        let mut observation = ValueMap::new();
        for (channel, position) in &self.positions {
            observation.insert(channel.clone(), Value::Float(*position));
        }
        if let Some(camera) = self.config.camera.clone() {
            let frame = self.render_camera(&camera)?;
            let mut cameras = ValueMap::new();
            cameras.insert(camera.name, Value::NdArray(frame));
            observation.insert("cameras".to_string(), Value::Map(cameras));
        }
        Ok(observation)
    }

    async fn actuate(&mut self, action: &ActionFeatures) -> Result<(), DriverError> {
        if !self.connected {
            return Err(DriverError::NotConnected);
        }
        for (channel, value) in action {
            if !value.is_finite() {
                return Err(DriverError::Hardware(format!(
                    "non-finite command for {channel}"
                )));
            }
            self.targets.insert(channel.clone(), *value);
        }
        Ok(())
    }

    fn action_features(&self) -> Vec<String> {
        self.config
            .joints
            .iter()
            .map(|joint| format!("{joint}.pos"))
            .collect()
    }
}

fn default_amplitude() -> f64 {
    0.5
}

fn default_period_ticks() -> u64 {
    120
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptedTeleopConfig {
    #[serde(default = "default_joints")]
    pub joints: Vec<String>,
    #[serde(default = "default_amplitude")]
    pub amplitude: f64,
    #[serde(default = "default_period_ticks")]
    pub period_ticks: u64,
}

/// Scripted input device that replays a phase-shifted sine wave per joint.
pub struct ScriptedTeleoperator {
    config: ScriptedTeleopConfig,
    connected: bool,
    tick: u64,
}

impl ScriptedTeleoperator {
    pub fn new(config: ScriptedTeleopConfig) -> Self {
        Self { config, connected: false, tick: 0 }
    }
}

#[async_trait]
impl Teleoperator for ScriptedTeleoperator {
    async fn connect(&mut self) -> Result<(), DriverError> {
        self.connected = true;
        self.tick = 0;
        info!("scripted teleoperator connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DriverError> {
        self.connected = false;
        info!("scripted teleoperator disconnected");
        Ok(())
    }

    async fn get_action(&mut self) -> Result<ActionFeatures, DriverError> {
        if !self.connected {
            return Err(DriverError::NotConnected);
        }
        self.tick += 1;
        let period = self.config.period_ticks.max(1) as f64;
        let base = (self.tick as f64 / period) * std::f64::consts::TAU;

        let mut action = ActionFeatures::new();
        for (index, joint) in self.config.joints.iter().enumerate() {
            let phase = index as f64 * 0.5;
            action.insert(
                format!("{joint}.pos"),
                self.config.amplitude * (base + phase).sin(),
            );
        }
        Ok(action)
    }
}
