pub mod ai;
pub mod data;
pub mod teleop;

use std::any::Any;
use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use servolink_proto::{Action, Observation, Value, ValueMap};

pub use ai::AiCommandProvider;
pub use data::DataCollectionProvider;
pub use teleop::{LocalTeleopProvider, RemoteTeleopProvider, numeric_observation_payload};

/// Shape of the observation the edge should send on its next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationHint {
    Numeric,
    Full,
    FullPreprocessed,
}

impl ObservationHint {
    pub fn as_str(self) -> &'static str {
        match self {
            ObservationHint::Numeric => "numeric",
            ObservationHint::Full => "full",
            ObservationHint::FullPreprocessed => "full_preprocessed",
        }
    }
}

/// A named strategy for turning observations into actions.
///
/// At most one provider is prepared at a time; the orchestrator pairs every
/// `prepare` with exactly one `shutdown` before the provider can be prepared
/// again.
#[async_trait]
pub trait CommandProvider: Send {
    async fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    async fn compute(&mut self, observation: &Observation) -> Result<Action>;

    fn wants_full_observation(&self) -> bool {
        false
    }

    fn observation_hint(&self) -> ObservationHint {
        if self.wants_full_observation() {
            ObservationHint::Full
        } else {
            ObservationHint::Numeric
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Keeps the numeric channels of a wire map, widened to f64.
pub fn numeric_only(values: &ValueMap) -> BTreeMap<String, f64> {
    let mut numeric = BTreeMap::new();
    for (key, value) in values {
        if let Some(number) = value.as_f64() {
            numeric.insert(key.clone(), number);
        }
    }
    numeric
}

/// Transform applied to an action map given the raw robot observation.
pub type ActionPipeline =
    Box<dyn Fn(&BTreeMap<String, f64>, &ValueMap) -> BTreeMap<String, f64> + Send + Sync>;

/// Runs an optional pipeline, passing the action through unchanged when none
/// is configured.
pub fn apply_pipeline(
    pipeline: Option<&ActionPipeline>,
    action: BTreeMap<String, f64>,
    robot_obs: &ValueMap,
) -> BTreeMap<String, f64> {
    match pipeline {
        Some(pipeline) => pipeline(&action, robot_obs),
        None => action,
    }
}

/// Returns the observation's `robot` sub-map, or an empty map.
pub fn robot_payload(observation: &Observation) -> ValueMap {
    observation
        .payload
        .get("robot")
        .and_then(Value::as_map)
        .cloned()
        .unwrap_or_default()
}

/// Provider that answers a configured constant action; the registry default
/// when nothing else is active.
pub struct IdleCommandProvider {
    actions: BTreeMap<String, f64>,
}

impl IdleCommandProvider {
    pub fn new(actions: BTreeMap<String, f64>) -> Self {
        Self { actions }
    }
}

impl Default for IdleCommandProvider {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

#[async_trait]
impl CommandProvider for IdleCommandProvider {
    async fn compute(&mut self, _observation: &Observation) -> Result<Action> {
        Ok(Action::new(self.actions.clone()))
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
