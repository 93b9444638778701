use std::collections::BTreeMap;
use std::ops::Range;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use servolink_proto::{Dtype, NdArray, Value, ValueMap};

/// One named span of the flattened state vector.
#[derive(Debug, Clone, Deserialize)]
struct SliceSpec {
    #[serde(default)]
    start: usize,
    #[serde(default)]
    end: usize,
}

#[derive(Debug, Clone, Deserialize)]
struct ModalityFile {
    #[serde(default)]
    state: BTreeMap<String, SliceSpec>,
    #[serde(default)]
    video: BTreeMap<String, serde_json::Value>,
}

/// Reshapes observations into the input layout a GR00T-style inference
/// server expects: `state.<name>` f32 slices and `video.<name>` 4-D uint8
/// tensors, driven by a modality config file.
pub struct Gr00tObservationMapper {
    state_slices: Vec<(String, Range<usize>)>,
    state_keys: Vec<String>,
    camera_keys: Vec<String>,
}

impl Gr00tObservationMapper {
    pub fn from_file(
        path: &Path,
        state_keys: Vec<String>,
        camera_keys: Option<Vec<String>>,
    ) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| {
            format!("failed to read modality config {}", path.display())
        })?;
        let parsed: ModalityFile =
            serde_json::from_str(&raw).with_context(|| {
                format!("failed to parse modality config {}", path.display())
            })?;

        let mut state_slices: Vec<(String, Range<usize>)> = parsed
            .state
            .iter()
            .map(|(name, spec)| {
                (name.clone(), spec.start..spec.end.max(spec.start))
            })
            .collect();
        state_slices.sort_by_key(|(_, range)| range.start);
        if state_slices.is_empty() {
            bail!("modality config is missing state definitions");
        }

        let expected = state_slices
            .iter()
            .map(|(_, range)| range.end)
            .max()
            .unwrap_or(0);
        if state_keys.len() < expected {
            bail!(
                "state_keys length ({}) is smaller than the modality expectation ({})",
                state_keys.len(),
                expected
            );
        }

        let camera_keys = match camera_keys {
            Some(keys) if !keys.is_empty() => keys,
            _ => parsed.video.keys().cloned().collect(),
        };
        if camera_keys.is_empty() {
            bail!("no camera keys supplied and modality config lacks a video section");
        }

        Ok(Self { state_slices, state_keys, camera_keys })
    }

    pub fn build(&self, payload: &ValueMap) -> Result<ValueMap> {
        let robot_data = payload
            .get("robot")
            .and_then(Value::as_map)
            .cloned()
            .unwrap_or_default();
        let camera_group = robot_data
            .get("cameras")
            .and_then(Value::as_map)
            .cloned()
            .unwrap_or_default();

        let mut result = ValueMap::new();

        for key in &self.camera_keys {
            let frame = self
                .lookup_camera(key, &camera_group, &robot_data, payload)
                .with_context(|| {
                    format!("camera '{key}' not found in observation payload")
                })?;
            result.insert(format!("video.{key}"), Value::NdArray(frame));
        }

        let state = self.gather_state_vector(&robot_data)?;
        for (name, range) in &self.state_slices {
            let chunk = &state[range.clone()];
            result.insert(
                format!("state.{name}"),
                Value::NdArray(NdArray::from_f32(vec![chunk.len()], chunk)?),
            );
        }

        Ok(result)
    }

    fn gather_state_vector(&self, robot_data: &ValueMap) -> Result<Vec<f32>> {
        let mut values = Vec::with_capacity(self.state_keys.len());
        for key in &self.state_keys {
            let value = robot_data
                .get(key)
                .and_then(Value::as_f64)
                .with_context(|| {
                    format!("state key '{key}' missing from robot observation")
                })?;
            values.push(value as f32);
        }
        Ok(values)
    }

    fn lookup_camera(
        &self,
        name: &str,
        camera_group: &ValueMap,
        robot_data: &ValueMap,
        payload: &ValueMap,
    ) -> Option<NdArray> {
        for source in [camera_group, robot_data, payload] {
            if let Some(value) = source.get(name) {
                if let Some(frame) = coerce_frame(value) {
                    return Some(frame);
                }
            }
        }
        None
    }
}

/// Coerces a camera value into the 4-D uint8 layout: grayscale gains a
/// channel axis, single frames gain a leading batch axis, floats in [0, 1]
/// are rescaled to byte range.
pub fn coerce_frame(value: &Value) -> Option<NdArray> {
    let array = value.as_array()?;
    let mut shape = array.shape().to_vec();
    match shape.len() {
        2 => {
            shape.push(1);
            shape.insert(0, 1);
        }
        3 => shape.insert(0, 1),
        4 => {}
        _ => return None,
    }

    if array.dtype() == Dtype::U8 {
        return NdArray::from_u8(shape, array.data().to_vec()).ok();
    }

    let values = array.to_f64_vec();
    let is_float = matches!(array.dtype(), Dtype::F16 | Dtype::F32 | Dtype::F64);
    let scale = if is_float
        && values.iter().fold(f64::MIN, |max, value| max.max(*value)) <= 1.0
    {
        255.0
    } else {
        1.0
    };
    let bytes: Vec<u8> = values
        .iter()
        .map(|value| (value * scale).clamp(0.0, 255.0) as u8)
        .collect();
    NdArray::from_u8(shape, bytes).ok()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use servolink_proto::{NdArray, Value, ValueMap};

    use super::{coerce_frame, Gr00tObservationMapper};

    fn write_modality_config() -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "servolink-modality-{}.json",
            uuid::Uuid::now_v7()
        ));
        std::fs::write(
            &path,
            r#"{
                "state": {
                    "arm": {"start": 0, "end": 2},
                    "gripper": {"start": 2, "end": 3}
                },
                "video": {"front": {}}
            }"#,
        )
        .expect("write modality config");
        path
    }

    fn observation_payload() -> ValueMap {
        let mut cameras = ValueMap::new();
        cameras.insert(
            "front".to_string(),
            Value::NdArray(
                NdArray::from_u8(vec![4, 4, 3], vec![1; 48]).expect("frame"),
            ),
        );
        let mut robot = ValueMap::new();
        robot.insert("cameras".to_string(), Value::Map(cameras));
        robot.insert("shoulder.pos".to_string(), Value::Float(0.1));
        robot.insert("elbow.pos".to_string(), Value::Float(0.2));
        robot.insert("gripper.pos".to_string(), Value::Float(0.9));
        let mut payload = ValueMap::new();
        payload.insert("robot".to_string(), Value::Map(robot));
        payload
    }

    #[test]
    fn mapper_projects_state_slices_and_video() {
        let path = write_modality_config();
        let mapper = Gr00tObservationMapper::from_file(
            &path,
            vec![
                "shoulder.pos".to_string(),
                "elbow.pos".to_string(),
                "gripper.pos".to_string(),
            ],
            None,
        )
        .expect("build mapper");

        let result = mapper.build(&observation_payload()).expect("map");
        let arm = result
            .get("state.arm")
            .and_then(Value::as_array)
            .expect("arm slice");
        assert_eq!(arm.shape(), &[2]);
        assert_eq!(arm.to_f64_vec(), vec![0.10000000149011612, 0.20000000298023224]);

        let video = result
            .get("video.front")
            .and_then(Value::as_array)
            .expect("video tensor");
        assert_eq!(video.shape(), &[1, 4, 4, 3]);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_state_key_is_an_error() {
        let path = write_modality_config();
        let mapper = Gr00tObservationMapper::from_file(
            &path,
            vec![
                "shoulder.pos".to_string(),
                "elbow.pos".to_string(),
                "missing.pos".to_string(),
            ],
            None,
        )
        .expect("build mapper");

        let err = mapper.build(&observation_payload()).expect_err("missing key");
        assert!(err.to_string().contains("missing.pos"));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn frames_coerce_to_four_dims() {
        let gray = Value::NdArray(
            NdArray::from_u8(vec![2, 2], vec![5; 4]).expect("gray"),
        );
        assert_eq!(coerce_frame(&gray).expect("coerced").shape(), &[1, 2, 2, 1]);

        let float_frame = Value::NdArray(
            NdArray::from_f32(vec![1, 1, 3], &[0.0, 0.5, 1.0]).expect("float"),
        );
        let coerced = coerce_frame(&float_frame).expect("coerced");
        assert_eq!(coerced.data(), &[0, 127, 255]);

        let vector = Value::NdArray(
            NdArray::from_f32(vec![3], &[0.0; 3]).expect("vector"),
        );
        assert!(coerce_frame(&vector).is_none());
    }
}
