use serde_json::Value as Json;

use crate::events::ModeEvent;

/// Translates one JSON command object into mode events.
///
/// Returns an empty vector for unrecognised objects; callers reply
/// `ERROR: unsupported command` in that case. The `data` key accepts three
/// payload forms: a `{mode, command}` object, a bare command string, and an
/// empty value meaning "switch to the data provider".
pub fn parse_mode_command(data: &Json) -> Vec<ModeEvent> {
    let Some(object) = data.as_object() else {
        return Vec::new();
    };

    if let Some(value) = object.get("data") {
        let mut events = Vec::new();
        match value {
            Json::Object(fields) => {
                if let Some(target) = fields.get("mode") {
                    let alias = json_text(target);
                    events.push(ModeEvent::Teleop {
                        alias: if alias.is_empty() {
                            "data".to_string()
                        } else {
                            alias
                        },
                    });
                }
                if let Some(command) = fields.get("command") {
                    let command = json_text(command);
                    if !command.is_empty() {
                        events.push(ModeEvent::Data { command });
                    }
                }
            }
            Json::Null => {
                events.push(ModeEvent::Teleop { alias: "data".to_string() });
            }
            other => {
                let text = json_text(other);
                if text.is_empty() {
                    events.push(ModeEvent::Teleop { alias: "data".to_string() });
                } else {
                    events.push(ModeEvent::Data { command: text });
                }
            }
        }
        return events;
    }

    if let Some(alias) = object.get("teleop") {
        return vec![ModeEvent::Teleop { alias: json_text(alias) }];
    }
    if let Some(instruction) = object.get("infer") {
        return vec![ModeEvent::Infer {
            instruction: json_text(instruction).trim().to_string(),
        }];
    }
    if let Some(reason) = object.get("idle") {
        return vec![ModeEvent::Idle { reason: optional_text(reason) }];
    }
    if let Some(reason) = object.get("shutdown") {
        return vec![ModeEvent::Shutdown { reason: optional_text(reason) }];
    }

    Vec::new()
}

fn json_text(value: &Json) -> String {
    match value {
        Json::String(text) => text.clone(),
        Json::Null => String::new(),
        other => other.to_string(),
    }
}

fn optional_text(value: &Json) -> Option<String> {
    let text = json_text(value);
    if text.is_empty() { None } else { Some(text) }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_mode_command;
    use crate::events::ModeEvent;

    #[test]
    fn teleop_infer_idle_shutdown_shapes() {
        assert_eq!(
            parse_mode_command(&json!({"teleop": "gamepad"})),
            vec![ModeEvent::Teleop { alias: "gamepad".to_string() }]
        );
        assert_eq!(
            parse_mode_command(&json!({"infer": " pick the cup "})),
            vec![ModeEvent::Infer { instruction: "pick the cup".to_string() }]
        );
        assert_eq!(
            parse_mode_command(&json!({"idle": ""})),
            vec![ModeEvent::Idle { reason: None }]
        );
        assert_eq!(
            parse_mode_command(&json!({"shutdown": "operator done"})),
            vec![ModeEvent::Shutdown {
                reason: Some("operator done".to_string())
            }]
        );
    }

    #[test]
    fn data_object_form_emits_switch_then_control() {
        let events = parse_mode_command(
            &json!({"data": {"mode": "data", "command": "next"}}),
        );
        assert_eq!(
            events,
            vec![
                ModeEvent::Teleop { alias: "data".to_string() },
                ModeEvent::Data { command: "next".to_string() },
            ]
        );
    }

    #[test]
    fn data_bare_and_empty_forms() {
        assert_eq!(
            parse_mode_command(&json!({"data": "stop"})),
            vec![ModeEvent::Data { command: "stop".to_string() }]
        );
        assert_eq!(
            parse_mode_command(&json!({"data": ""})),
            vec![ModeEvent::Teleop { alias: "data".to_string() }]
        );
        assert_eq!(
            parse_mode_command(&json!({"data": null})),
            vec![ModeEvent::Teleop { alias: "data".to_string() }]
        );
    }

    #[test]
    fn unsupported_objects_yield_nothing() {
        assert!(parse_mode_command(&json!({"dance": true})).is_empty());
        assert!(parse_mode_command(&json!([1, 2, 3])).is_empty());
    }
}
