use crate::ParseError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const DONE_ACTION: &str = "DONE";
const COMPLETION_MARKER: &str = "TASK_COMPLETE:";
const DEFAULT_COMPLETION_RESULT: &str = "Task completed.";

/// One tool invocation chosen by the planner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl Action {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            name: name.into(),
            arguments,
        }
    }

    pub fn arguments_value(&self) -> Value {
        Value::Object(self.arguments.clone())
    }
}

/// What a single planner turn asks for.
#[derive(Clone, Debug, PartialEq)]
pub enum PlannerReply {
    Action(Action),
    Complete { result: String },
}

/// Parses raw planner text into exactly one action or a completion proposal.
///
/// The planner replies with `{"action": "<tool>", "args": {...}}` or
/// `{"action": "DONE", "result": "..."}`, optionally wrapped in prose or code
/// fences. A reply carrying `TASK_COMPLETE:` is read as a completion whose
/// result follows the marker.
pub fn parse_planner_output(raw: &str) -> Result<PlannerReply, ParseError> {
    let fail = |reason: &str| ParseError {
        reason: reason.to_string(),
        raw: raw.to_string(),
    };

    // The marker wins unless it only appears inside the JSON object, e.g. as
    // file contents in a write_file action.
    let json = extract_json_object(raw);
    if let Some(index) = raw.find(COMPLETION_MARKER) {
        if json.is_none_or(|(start, _)| index < start) {
            return Ok(PlannerReply::Complete {
                result: completion_result(&raw[index + COMPLETION_MARKER.len()..]),
            });
        }
    }
    let Some((start, end)) = json else {
        return Err(fail("no JSON object found"));
    };
    let json = &raw[start..=end];

    let value: Value = serde_json::from_str(json).map_err(|error| ParseError {
        reason: format!("invalid JSON: {error}"),
        raw: raw.to_string(),
    })?;
    let Value::Object(mut object) = value else {
        return Err(fail("reply must be a JSON object"));
    };

    let name = match object.remove("action") {
        Some(Value::String(name)) if !name.trim().is_empty() => name.trim().to_string(),
        Some(_) => return Err(fail("'action' must be a non-empty string")),
        None => return Err(fail("missing 'action' field")),
    };

    if name.eq_ignore_ascii_case(DONE_ACTION) {
        let result = match object.remove("result") {
            Some(Value::String(text)) => completion_result(&text),
            Some(Value::Null) | None => DEFAULT_COMPLETION_RESULT.to_string(),
            Some(other) => other.to_string(),
        };
        return Ok(PlannerReply::Complete { result });
    }

    let arguments = match object.remove("args").or_else(|| object.remove("arguments")) {
        Some(Value::Object(map)) => map,
        Some(Value::Null) | None => Map::new(),
        Some(_) => return Err(fail("'args' must be a JSON object")),
    };

    Ok(PlannerReply::Action(Action { name, arguments }))
}

/// Byte offsets of the outermost `{` and `}`.
fn extract_json_object(raw: &str) -> Option<(usize, usize)> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then_some((start, end))
}

fn completion_result(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        DEFAULT_COMPLETION_RESULT.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_action_wrapped_in_prose_and_fences() {
        let raw = "Sure, here it is:\n```json\n{\"action\": \"read_file\", \"args\": {\"path\": \"a.txt\"}}\n```";
        let reply = parse_planner_output(raw).expect("reply should parse");
        assert_eq!(
            reply,
            PlannerReply::Action(Action::new("read_file", json!({"path": "a.txt"})))
        );
    }

    #[test]
    fn accepts_arguments_alias_and_missing_args() {
        let reply = parse_planner_output(r#"{"action":"list_dir","arguments":{"path":"."}}"#)
            .expect("alias should parse");
        let PlannerReply::Action(action) = reply else {
            panic!("expected action");
        };
        assert_eq!(action.arguments.get("path"), Some(&json!(".")));

        let reply = parse_planner_output(r#"{"action":"list_tasks"}"#).expect("should parse");
        assert!(matches!(reply, PlannerReply::Action(action) if action.arguments.is_empty()));
    }

    #[test]
    fn done_without_result_uses_default_summary() {
        let reply = parse_planner_output(r#"{"action": "done"}"#).expect("done should parse");
        assert_eq!(
            reply,
            PlannerReply::Complete {
                result: "Task completed.".to_string()
            }
        );
    }

    #[test]
    fn completion_marker_is_a_completion_proposal() {
        let reply = parse_planner_output("All wired up. TASK_COMPLETE: schema migrated")
            .expect("marker should parse");
        assert_eq!(
            reply,
            PlannerReply::Complete {
                result: "schema migrated".to_string()
            }
        );
    }

    #[test]
    fn completion_marker_wins_over_braces_in_the_summary() {
        let reply = parse_planner_output("TASK_COMPLETE: added the {TodoList} component")
            .expect("marker should parse");
        assert_eq!(
            reply,
            PlannerReply::Complete {
                result: "added the {TodoList} component".to_string()
            }
        );
    }

    #[test]
    fn marker_inside_action_arguments_is_not_a_completion() {
        let raw = r#"{"action": "write_file", "args": {"path": "log.txt", "contents": "TASK_COMPLETE: later"}}"#;
        let reply = parse_planner_output(raw).expect("action should parse");
        assert!(matches!(reply, PlannerReply::Action(action) if action.name == "write_file"));
    }

    #[test]
    fn malformed_outputs_are_parse_errors() {
        for raw in [
            "I am thinking about it",
            "{not json}",
            r#"{"args": {}}"#,
            r#"{"action": 7}"#,
            r#"{"action": "write_file", "args": "path=a"}"#,
            "} backwards {",
        ] {
            let error = parse_planner_output(raw).expect_err("should fail");
            assert_eq!(error.raw, raw);
        }
    }
}
