use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

/// Accepts either a bare number of seconds or a humantime string
/// (`"500ms"`, `"2s"`, `"1min"`); absent or empty values become `None`.
pub fn deserialize_optional_duration<'de, D>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Seconds(f64),
        Text(String),
    }

    match Option::<RawDuration>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawDuration::Seconds(secs)) => {
            if !secs.is_finite() || secs < 0.0 {
                return Err(D::Error::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_secs_f64(secs)))
        }
        Some(RawDuration::Text(value)) => {
            let value = value.trim();
            if value.is_empty() {
                return Ok(None);
            }
            humantime::parse_duration(value).map(Some).map_err(D::Error::custom)
        }
    }
}
