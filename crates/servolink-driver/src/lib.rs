mod sim;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use servolink_proto::ValueMap;
use thiserror::Error;

pub use sim::{ScriptedTeleopConfig, ScriptedTeleoperator, SimCameraConfig, SimRobot, SimRobotConfig};

/// Errors raised by hardware drivers. `Hardware` faults during actuation are
/// treated as fatal by the edge loop.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver not connected")]
    NotConnected,
    #[error("hardware fault: {0}")]
    Hardware(String),
}

/// Actuator map produced by teleoperators and consumed by robots.
pub type ActionFeatures = BTreeMap<String, f64>;

/// Edge-side driver boundary: everything the control loop needs from a
/// robot. Concrete hardware integrations implement this trait; the bundled
/// `sim` driver exists for demos and tests.
#[async_trait]
pub trait RobotController: Send {
    async fn connect(&mut self, calibrate: bool) -> Result<(), DriverError>;

    async fn disconnect(&mut self) -> Result<(), DriverError>;

    /// Samples one raw observation: numeric channels plus named camera
    /// arrays.
    async fn observe(&mut self) -> Result<ValueMap, DriverError>;

    async fn actuate(&mut self, action: &ActionFeatures) -> Result<(), DriverError>;

    /// The actuator channels this robot accepts, used to build zero and
    /// fallback commands.
    fn action_features(&self) -> Vec<String>;
}

/// Orchestrator-side driver boundary for human input devices.
#[async_trait]
pub trait Teleoperator: Send {
    async fn connect(&mut self) -> Result<(), DriverError>;

    async fn disconnect(&mut self) -> Result<(), DriverError>;

    async fn get_action(&mut self) -> Result<ActionFeatures, DriverError>;

    /// Optional feedback channel; drivers that mirror robot state override
    /// this.
    async fn on_observation(&mut self, _robot_obs: &ValueMap) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Robot driver selection as it appears in YAML config. Unknown `type`
/// values fail at config load time.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RobotSpec {
    Sim(SimRobotConfig),
}

impl RobotSpec {
    pub fn camera_names(&self) -> Vec<String> {
        match self {
            RobotSpec::Sim(config) => config
                .camera
                .as_ref()
                .map(|camera| vec![camera.name.clone()])
                .unwrap_or_default(),
        }
    }
}

/// Teleoperator driver selection as it appears in YAML config.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TeleopSpec {
    Sim(ScriptedTeleopConfig),
}

pub fn make_robot(spec: &RobotSpec) -> Box<dyn RobotController> {
    match spec {
        RobotSpec::Sim(config) => Box::new(SimRobot::new(config.clone())),
    }
}

pub fn make_teleoperator(spec: &TeleopSpec) -> Box<dyn Teleoperator> {
    match spec {
        TeleopSpec::Sim(config) => {
            Box::new(ScriptedTeleoperator::new(config.clone()))
        }
    }
}
