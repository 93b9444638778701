use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ProtoError;
use crate::value::{Value, ValueMap};

const MESSAGE_TYPE: &str = "message_type";
const CURRENT_VERSION: u16 = 1;

/// Wall-clock nanoseconds used to stamp outgoing envelopes.
pub fn now_timestamp_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as i64)
        .unwrap_or(0)
}

/// One sampled robot observation. `payload` carries the well-known `robot`
/// and `base` sub-maps plus free top-level keys.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub payload: ValueMap,
    pub timestamp_ns: i64,
    pub metadata: Option<ValueMap>,
    pub version: u16,
}

impl Observation {
    pub fn new(payload: ValueMap) -> Self {
        Self {
            payload,
            timestamp_ns: now_timestamp_ns(),
            metadata: None,
            version: CURRENT_VERSION,
        }
    }

    pub fn robot(&self) -> Option<&ValueMap> {
        self.payload.get("robot").and_then(Value::as_map)
    }

    /// True when the robot payload carries at least one rank >= 2 array,
    /// i.e. camera frames are present.
    pub fn contains_image(&self) -> bool {
        let Some(robot) = self.robot() else {
            return false;
        };
        robot.values().any(|value| {
            value.as_array().is_some_and(|array| array.ndim() >= 2)
        })
    }

    pub fn to_value(&self) -> Value {
        let mut map = ValueMap::new();
        map.insert(MESSAGE_TYPE.to_string(), Value::Str("observation".into()));
        map.insert("payload".to_string(), Value::Map(self.payload.clone()));
        map.insert("timestamp_ns".to_string(), Value::Int(self.timestamp_ns));
        insert_metadata(&mut map, &self.metadata);
        map.insert("version".to_string(), Value::Int(self.version as i64));
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtoError> {
        let map = expect_envelope(value, "observation")?;
        let payload = map
            .get("payload")
            .and_then(Value::as_map)
            .cloned()
            .ok_or_else(|| {
                ProtoError::Decode("observation missing payload".to_string())
            })?;
        Ok(Self {
            payload,
            timestamp_ns: read_timestamp(map),
            metadata: read_metadata(map),
            version: read_version(map),
        })
    }
}

/// Per-tick actuator command, keyed by actuator-channel identifiers.
/// An empty map means "do not move".
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub actions: BTreeMap<String, f64>,
    pub timestamp_ns: i64,
    pub metadata: Option<ValueMap>,
    pub version: u16,
}

impl Action {
    pub fn new(actions: BTreeMap<String, f64>) -> Self {
        Self {
            actions,
            timestamp_ns: now_timestamp_ns(),
            metadata: None,
            version: CURRENT_VERSION,
        }
    }

    pub fn empty() -> Self {
        Self::new(BTreeMap::new())
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn to_value(&self) -> Value {
        let mut actions = ValueMap::new();
        for (key, value) in &self.actions {
            actions.insert(key.clone(), Value::Float(*value));
        }
        let mut map = ValueMap::new();
        map.insert(MESSAGE_TYPE.to_string(), Value::Str("action".into()));
        map.insert("actions".to_string(), Value::Map(actions));
        map.insert("timestamp_ns".to_string(), Value::Int(self.timestamp_ns));
        insert_metadata(&mut map, &self.metadata);
        map.insert("version".to_string(), Value::Int(self.version as i64));
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtoError> {
        let map = expect_envelope(value, "action")?;
        let raw = map.get("actions").and_then(Value::as_map).ok_or_else(|| {
            ProtoError::Decode("action missing actions map".to_string())
        })?;
        let mut actions = BTreeMap::new();
        for (key, entry) in raw {
            let number = entry.as_f64().ok_or_else(|| {
                ProtoError::Decode(format!(
                    "action channel {key} is not numeric"
                ))
            })?;
            actions.insert(key.clone(), number);
        }
        Ok(Self {
            actions,
            timestamp_ns: read_timestamp(map),
            metadata: read_metadata(map),
            version: read_version(map),
        })
    }
}

/// Out-of-band notification, e.g. `status = "shutdown"`.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub status: String,
    pub timestamp_ns: i64,
    pub metadata: Option<ValueMap>,
    pub version: u16,
}

impl Status {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            timestamp_ns: now_timestamp_ns(),
            metadata: None,
            version: CURRENT_VERSION,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = ValueMap::new();
        map.insert(MESSAGE_TYPE.to_string(), Value::Str("status".into()));
        map.insert("status".to_string(), Value::Str(self.status.clone()));
        map.insert("timestamp_ns".to_string(), Value::Int(self.timestamp_ns));
        insert_metadata(&mut map, &self.metadata);
        map.insert("version".to_string(), Value::Int(self.version as i64));
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtoError> {
        let map = expect_envelope(value, "status")?;
        let status = map
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ProtoError::Decode("status envelope missing status".to_string())
            })?
            .to_string();
        Ok(Self {
            status,
            timestamp_ns: read_timestamp(map),
            metadata: read_metadata(map),
            version: read_version(map),
        })
    }
}

/// Decodes an envelope and insists it is an action.
pub fn ensure_action(value: &Value) -> Result<Action, ProtoError> {
    Action::from_value(value)
}

/// Decodes an envelope and insists it is an observation.
pub fn ensure_observation(value: &Value) -> Result<Observation, ProtoError> {
    Observation::from_value(value)
}

fn expect_envelope<'a>(
    value: &'a Value,
    expected: &str,
) -> Result<&'a ValueMap, ProtoError> {
    let map = value.as_map().ok_or_else(|| {
        ProtoError::Decode(format!("{expected} envelope is not a map"))
    })?;
    let kind = map
        .get(MESSAGE_TYPE)
        .and_then(Value::as_str)
        .unwrap_or("status");
    if kind != expected {
        return Err(ProtoError::Decode(format!(
            "expected {expected} envelope, got {kind}"
        )));
    }
    Ok(map)
}

fn insert_metadata(map: &mut ValueMap, metadata: &Option<ValueMap>) {
    match metadata {
        Some(fields) => {
            map.insert("metadata".to_string(), Value::Map(fields.clone()));
        }
        None => {
            map.insert("metadata".to_string(), Value::Nil);
        }
    }
}

fn read_metadata(map: &ValueMap) -> Option<ValueMap> {
    map.get("metadata").and_then(Value::as_map).cloned()
}

fn read_timestamp(map: &ValueMap) -> i64 {
    map.get("timestamp_ns")
        .and_then(Value::as_i64)
        .unwrap_or_else(now_timestamp_ns)
}

fn read_version(map: &ValueMap) -> u16 {
    map.get("version")
        .and_then(Value::as_i64)
        .and_then(|raw| u16::try_from(raw).ok())
        .unwrap_or(CURRENT_VERSION)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{ensure_action, Action, Observation, Status};
    use crate::value::{NdArray, Value};

    #[test]
    fn observation_round_trips_through_value() {
        let mut robot = Value::map();
        robot.insert("shoulder.pos".to_string(), Value::Float(1.0));
        let mut payload = Value::map();
        payload.insert("robot".to_string(), Value::Map(robot));
        payload.insert("base".to_string(), Value::Map(Value::map()));

        let message = Observation::new(payload);
        let decoded = Observation::from_value(&message.to_value())
            .expect("decode observation");
        assert_eq!(decoded, message);
    }

    #[test]
    fn image_detection_requires_rank_two_array() {
        let mut robot = Value::map();
        robot.insert("x".to_string(), Value::Float(1.0));
        robot.insert(
            "vector".to_string(),
            Value::NdArray(
                NdArray::from_f32(vec![4], &[0.0; 4]).expect("vector"),
            ),
        );
        let mut payload = Value::map();
        payload.insert("robot".to_string(), Value::Map(robot.clone()));
        assert!(!Observation::new(payload.clone()).contains_image());

        robot.insert(
            "cam".to_string(),
            Value::NdArray(
                NdArray::from_u8(vec![2, 2], vec![0; 4]).expect("frame"),
            ),
        );
        payload.insert("robot".to_string(), Value::Map(robot));
        assert!(Observation::new(payload).contains_image());
    }

    #[test]
    fn action_round_trips_and_checks_type() {
        let mut actions = BTreeMap::new();
        actions.insert("a".to_string(), 0.5);
        let message = Action::new(actions);
        let decoded = ensure_action(&message.to_value()).expect("decode");
        assert_eq!(decoded, message);

        let status = Status::new("shutdown");
        let err = ensure_action(&status.to_value()).expect_err("type check");
        assert!(err.to_string().contains("expected action"));
    }

    #[test]
    fn status_round_trips() {
        let message = Status::new("shutdown");
        let decoded =
            Status::from_value(&message.to_value()).expect("decode status");
        assert_eq!(decoded.status, "shutdown");
    }
}
