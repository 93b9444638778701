use std::collections::BTreeMap;

use anyhow::Result;
use serde::Deserialize;
use servolink_proto::{Observation, Value, ValueMap};

use crate::groot::Gr00tObservationMapper;
use crate::providers::numeric_only;

/// Turns an observation into the payload sent to the inference server.
pub enum ObservationAdapter {
    /// The observation payload as-is.
    Passthrough,
    /// GR00T modality projection: numbered state slices + video tensors.
    Groot(Gr00tObservationMapper),
}

impl ObservationAdapter {
    pub fn build(&self, observation: &Observation) -> Result<ValueMap> {
        match self {
            ObservationAdapter::Passthrough => Ok(observation.payload.clone()),
            ObservationAdapter::Groot(mapper) => {
                mapper.build(&observation.payload)
            }
        }
    }
}

/// Joint-name lists for the GR00T action layout, configured in YAML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Gr00tActionConfig {
    #[serde(default)]
    pub left_arm: Vec<String>,
    #[serde(default)]
    pub right_arm: Vec<String>,
    #[serde(default)]
    pub left_gripper: Option<String>,
    #[serde(default)]
    pub right_gripper: Option<String>,
}

/// Turns an inference reply into a chunk of per-tick action maps.
pub enum ActionAdapter {
    /// Numeric key/value pairs of the reply become a single step.
    NumericOnly,
    /// Slice `action.*` chunk arrays onto configured joint names.
    Groot(Gr00tActionConfig),
}

impl ActionAdapter {
    pub fn extract(
        &self,
        reply: &ValueMap,
        horizon: usize,
    ) -> Result<Vec<BTreeMap<String, f64>>> {
        match self {
            ActionAdapter::NumericOnly => {
                let numeric = numeric_only(reply);
                if numeric.is_empty() {
                    Ok(vec![BTreeMap::new()])
                } else {
                    Ok(vec![numeric])
                }
            }
            ActionAdapter::Groot(config) => {
                Ok(extract_groot_chunk(config, reply, horizon))
            }
        }
    }
}

/// Walks chunk indices until the reply stops yielding values. Rank-1 arm
/// arrays only describe step 0; rank-2 arrays describe one row per step.
fn extract_groot_chunk(
    config: &Gr00tActionConfig,
    reply: &ValueMap,
    horizon: usize,
) -> Vec<BTreeMap<String, f64>> {
    let mut steps = Vec::new();
    for index in 0..horizon.max(1) {
        let mut step = BTreeMap::new();

        slice_arm(reply, "action.left_arm", &config.left_arm, index, &mut step);
        slice_arm(reply, "action.right_arm", &config.right_arm, index, &mut step);
        slice_gripper(
            reply,
            "action.left_gripper",
            config.left_gripper.as_deref(),
            index,
            &mut step,
        );
        slice_gripper(
            reply,
            "action.right_gripper",
            config.right_gripper.as_deref(),
            index,
            &mut step,
        );
        pass_through_extras(reply, index, &mut step);

        if step.is_empty() {
            break;
        }
        steps.push(step);
    }
    steps
}

fn slice_arm(
    reply: &ValueMap,
    key: &str,
    joints: &[String],
    index: usize,
    step: &mut BTreeMap<String, f64>,
) {
    if joints.is_empty() {
        return;
    }
    let Some(array) = reply.get(key).and_then(Value::as_array) else {
        return;
    };
    if array.ndim() == 1 && index > 0 {
        return;
    }
    let Some(row) = array.row_f64(index) else {
        return;
    };
    for (joint, value) in joints.iter().zip(row) {
        step.insert(joint.clone(), value);
    }
}

fn slice_gripper(
    reply: &ValueMap,
    key: &str,
    channel: Option<&str>,
    index: usize,
    step: &mut BTreeMap<String, f64>,
) {
    let Some(channel) = channel else {
        return;
    };
    let Some(entry) = reply.get(key) else {
        return;
    };
    match entry {
        Value::NdArray(array) => {
            let values = array.to_f64_vec();
            if let Some(value) = values.get(index) {
                step.insert(channel.to_string(), *value);
            }
        }
        other => {
            if index == 0 {
                if let Some(value) = other.as_f64() {
                    step.insert(channel.to_string(), value);
                }
            }
        }
    }
}

const ARM_KEYS: [&str; 4] = [
    "action.left_arm",
    "action.right_arm",
    "action.left_gripper",
    "action.right_gripper",
];

/// Any other `action.*` entry passes through under its suffix.
fn pass_through_extras(
    reply: &ValueMap,
    index: usize,
    step: &mut BTreeMap<String, f64>,
) {
    for (key, entry) in reply {
        if !key.starts_with("action.") || ARM_KEYS.contains(&key.as_str()) {
            continue;
        }
        let channel = &key["action.".len()..];
        match entry {
            Value::NdArray(array) if array.ndim() == 1 => {
                let values = array.to_f64_vec();
                if let Some(value) = values.get(index) {
                    step.insert(channel.to_string(), *value);
                }
            }
            other => {
                if index == 0 {
                    if let Some(value) = other.as_f64() {
                        step.insert(channel.to_string(), value);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use servolink_proto::{NdArray, Value, ValueMap};

    use super::{ActionAdapter, Gr00tActionConfig};

    fn chunk_reply() -> ValueMap {
        let mut reply = ValueMap::new();
        reply.insert(
            "action.left_arm".to_string(),
            Value::NdArray(
                NdArray::from_f32(
                    vec![3, 2],
                    &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6],
                )
                .expect("left arm"),
            ),
        );
        reply.insert(
            "action.left_gripper".to_string(),
            Value::NdArray(
                NdArray::from_f32(vec![3], &[1.0, 0.0, 1.0]).expect("gripper"),
            ),
        );
        reply.insert(
            "action.base_speed".to_string(),
            Value::NdArray(
                NdArray::from_f32(vec![3], &[9.0, 8.0, 7.0]).expect("extra"),
            ),
        );
        reply
    }

    fn groot_config() -> Gr00tActionConfig {
        Gr00tActionConfig {
            left_arm: vec!["l1.pos".to_string(), "l2.pos".to_string()],
            right_arm: Vec::new(),
            left_gripper: Some("lg.pos".to_string()),
            right_gripper: None,
        }
    }

    #[test]
    fn groot_adapter_slices_chunk_rows() {
        let adapter = ActionAdapter::Groot(groot_config());
        let steps = adapter.extract(&chunk_reply(), 5).expect("extract");

        assert_eq!(steps.len(), 3);
        let step1 = &steps[1];
        assert!((step1["l1.pos"] - 0.3).abs() < 1e-6);
        assert!((step1["l2.pos"] - 0.4).abs() < 1e-6);
        assert_eq!(step1["lg.pos"], 0.0);
        assert_eq!(step1["base_speed"], 8.0);
    }

    #[test]
    fn rank_one_arm_only_yields_step_zero() {
        let mut reply = ValueMap::new();
        reply.insert(
            "action.left_arm".to_string(),
            Value::NdArray(
                NdArray::from_f32(vec![2], &[0.7, 0.8]).expect("arm"),
            ),
        );
        let adapter = ActionAdapter::Groot(groot_config());
        let steps = adapter.extract(&reply, 4).expect("extract");
        assert_eq!(steps.len(), 1);
        assert!((steps[0]["l1.pos"] - 0.7).abs() < 1e-6);
    }

    #[test]
    fn numeric_only_extracts_scalars_as_single_step() {
        let mut reply = ValueMap::new();
        reply.insert("a".to_string(), Value::Float(0.5));
        reply.insert("note".to_string(), Value::Str("text".into()));
        let steps =
            ActionAdapter::NumericOnly.extract(&reply, 3).expect("extract");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].get("a"), Some(&0.5));
        assert!(!steps[0].contains_key("note"));
    }
}
