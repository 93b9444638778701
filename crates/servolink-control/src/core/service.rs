use std::collections::BTreeMap;

use anyhow::{Context, Result};
use image::imageops::FilterType;
use servolink_driver::RobotController;
use servolink_proto::{Action, Dtype, NdArray, Observation, Value, ValueMap};
use tracing::debug;

/// Observation shape currently requested by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationMode {
    Numeric,
    Full,
    FullPreprocessed,
}

impl ObservationMode {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "numeric" => Some(ObservationMode::Numeric),
            "full" => Some(ObservationMode::Full),
            "full_preprocessed" => Some(ObservationMode::FullPreprocessed),
            _ => None,
        }
    }
}

/// Which fields of the raw driver observation are forwarded upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationAdapterKind {
    NumericOnly,
    Identity,
}

#[derive(Debug, Clone)]
pub struct PreprocessSettings {
    pub target_height: u32,
    pub target_width: u32,
    pub filter: FilterType,
}

/// Maps a configured interpolation name onto the image crate's filters.
pub fn parse_interpolation(name: &str) -> FilterType {
    match name {
        "nearest" => FilterType::Nearest,
        "cubic" => FilterType::CatmullRom,
        "area" => FilterType::Triangle,
        "lanczos" => FilterType::Lanczos3,
        _ => FilterType::Triangle,
    }
}

/// Edge-side robot wrapper: shapes observations per the current mode and
/// tracks the last applied action for the fallback ladder.
pub struct RobotControlService {
    robot: Box<dyn RobotController>,
    adapter: ObservationAdapterKind,
    preprocess: Option<PreprocessSettings>,
    mode: ObservationMode,
    last_action: Action,
}

impl RobotControlService {
    pub fn new(
        robot: Box<dyn RobotController>,
        adapter: ObservationAdapterKind,
        preprocess: Option<PreprocessSettings>,
    ) -> Self {
        Self {
            robot,
            adapter,
            preprocess,
            mode: ObservationMode::Numeric,
            last_action: Action::empty(),
        }
    }

    pub async fn connect(&mut self, calibrate: bool) -> Result<()> {
        self.robot.connect(calibrate).await.context("robot connect failed")
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.robot
            .disconnect()
            .await
            .context("robot disconnect failed")
    }

    pub fn action_features(&self) -> Vec<String> {
        self.robot.action_features()
    }

    pub fn observation_mode(&self) -> ObservationMode {
        self.mode
    }

    pub fn set_observation_mode(&mut self, mode: ObservationMode) {
        if self.mode != mode {
            debug!("observation mode switched: mode={:?}", mode);
        }
        self.mode = mode;
    }

    /// Samples the robot and returns both the shaped wire observation and
    /// the raw driver map (for the camera publisher).
    pub async fn observe(&mut self) -> Result<(Observation, ValueMap)> {
        let raw = self.robot.observe().await.context("robot observe failed")?;
        let shaped = self.shape_observation(&raw);

        let mut payload = ValueMap::new();
        payload.insert("robot".to_string(), Value::Map(shaped));
        payload.insert("base".to_string(), Value::Map(ValueMap::new()));
        Ok((Observation::new(payload), raw))
    }

    /// Actuates a non-empty action and records it as last-applied.
    pub async fn apply(&mut self, action: &Action) -> Result<()> {
        if !action.actions.is_empty() {
            self.robot
                .actuate(&action.actions)
                .await
                .context("robot actuate failed")?;
        }
        self.last_action = action.clone();
        Ok(())
    }

    pub fn last_command(&self) -> Action {
        self.last_action.clone()
    }

    pub fn fallback_command(&self) -> Action {
        Action::new(self.last_action.actions.clone())
    }

    /// All known actuator channels set to zero; also becomes last-applied.
    pub fn zero_command(&mut self) -> Action {
        let mut zeros = BTreeMap::new();
        for channel in self.robot.action_features() {
            zeros.insert(channel, 0.0);
        }
        let action = Action::new(zeros);
        self.last_action = action.clone();
        action
    }

    fn shape_observation(&self, raw: &ValueMap) -> ValueMap {
        match self.mode {
            ObservationMode::Numeric => match self.adapter {
                ObservationAdapterKind::NumericOnly => numeric_channels(raw),
                ObservationAdapterKind::Identity => raw.clone(),
            },
            ObservationMode::Full => raw.clone(),
            ObservationMode::FullPreprocessed => match &self.preprocess {
                Some(settings) => preprocess_cameras(raw, settings),
                None => raw.clone(),
            },
        }
    }
}

/// Keeps scalar channels only; arrays and nested groups such as `cameras`
/// are dropped wholesale.
fn numeric_channels(raw: &ValueMap) -> ValueMap {
    let mut shaped = ValueMap::new();
    for (key, value) in raw {
        if value.is_numeric_scalar() {
            shaped.insert(key.clone(), value.clone());
        }
    }
    shaped
}

/// Resizes every rank-2/3 uint8 array to the target geometry; everything
/// else passes through untouched.
fn preprocess_cameras(raw: &ValueMap, settings: &PreprocessSettings) -> ValueMap {
    let mut shaped = ValueMap::new();
    for (key, value) in raw {
        let replacement = match value {
            Value::NdArray(array) => {
                resize_frame(array, settings).map(Value::NdArray)
            }
            Value::Map(nested) => {
                Some(Value::Map(preprocess_cameras(nested, settings)))
            }
            _ => None,
        };
        shaped.insert(key.clone(), replacement.unwrap_or_else(|| value.clone()));
    }
    shaped
}

fn resize_frame(
    array: &NdArray,
    settings: &PreprocessSettings,
) -> Option<NdArray> {
    if array.dtype() != Dtype::U8 {
        return None;
    }
    let target_w = settings.target_width.max(1);
    let target_h = settings.target_height.max(1);

    match array.shape() {
        [height, width] => {
            let img = image::GrayImage::from_raw(
                *width as u32,
                *height as u32,
                array.data().to_vec(),
            )?;
            let resized =
                image::imageops::resize(&img, target_w, target_h, settings.filter);
            NdArray::from_u8(
                vec![target_h as usize, target_w as usize],
                resized.into_raw(),
            )
            .ok()
        }
        [height, width, 3] => {
            let img = image::RgbImage::from_raw(
                *width as u32,
                *height as u32,
                array.data().to_vec(),
            )?;
            let resized =
                image::imageops::resize(&img, target_w, target_h, settings.filter);
            NdArray::from_u8(
                vec![target_h as usize, target_w as usize, 3],
                resized.into_raw(),
            )
            .ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use image::imageops::FilterType;
    use servolink_driver::{SimCameraConfig, SimRobot, SimRobotConfig};
    use servolink_proto::Value;

    use super::{
        ObservationAdapterKind, ObservationMode, PreprocessSettings,
        RobotControlService,
    };

    fn service(adapter: ObservationAdapterKind) -> RobotControlService {
        let robot = SimRobot::new(SimRobotConfig {
            joints: vec!["elbow".to_string()],
            camera: Some(SimCameraConfig {
                name: "front".to_string(),
                width: 16,
                height: 8,
            }),
        });
        RobotControlService::new(
            Box::new(robot),
            adapter,
            Some(PreprocessSettings {
                target_height: 4,
                target_width: 4,
                filter: FilterType::Triangle,
            }),
        )
    }

    #[tokio::test]
    async fn numeric_mode_strips_cameras() {
        let mut service = service(ObservationAdapterKind::NumericOnly);
        service.connect(false).await.expect("connect");

        let (observation, raw) = service.observe().await.expect("observe");
        assert!(raw.contains_key("cameras"));
        let robot =
            observation.payload.get("robot").and_then(Value::as_map).expect("robot");
        assert!(robot.contains_key("elbow.pos"));
        assert!(!robot.contains_key("cameras"));
        assert!(!observation.contains_image());
    }

    #[tokio::test]
    async fn full_mode_forwards_camera_frames() {
        let mut service = service(ObservationAdapterKind::NumericOnly);
        service.connect(false).await.expect("connect");
        service.set_observation_mode(ObservationMode::Full);

        let (observation, _raw) = service.observe().await.expect("observe");
        assert!(observation.contains_image());
    }

    #[tokio::test]
    async fn preprocessed_mode_resizes_frames() {
        let mut service = service(ObservationAdapterKind::NumericOnly);
        service.connect(false).await.expect("connect");
        service.set_observation_mode(ObservationMode::FullPreprocessed);

        let (observation, _raw) = service.observe().await.expect("observe");
        let frame = observation
            .payload
            .get("robot")
            .and_then(Value::as_map)
            .and_then(|robot| robot.get("cameras"))
            .and_then(Value::as_map)
            .and_then(|cameras| cameras.get("front"))
            .and_then(Value::as_array)
            .expect("camera frame");
        assert_eq!(frame.shape(), &[4, 4, 3]);
    }

    #[tokio::test]
    async fn zero_command_covers_all_channels_and_is_recorded() {
        let mut service = service(ObservationAdapterKind::NumericOnly);
        service.connect(false).await.expect("connect");

        let zero = service.zero_command();
        assert_eq!(zero.actions.get("elbow.pos"), Some(&0.0));
        assert_eq!(service.last_command().actions, zero.actions);
    }
}
