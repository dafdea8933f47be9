mod delegate;
mod edit_file;
mod glob;
mod grep;
mod list_dir;
mod read_file;
mod registry;
mod run_command;
mod tasks;
mod write_file;

pub use registry::*;

use crate::{ExecResult, SessionConfig, ToolError};
use serde_json::{Map, Value};

pub const READ_FILE_TOOL: &str = "read_file";
pub const WRITE_FILE_TOOL: &str = "write_file";
pub const EDIT_FILE_TOOL: &str = "edit_file";
pub const LIST_DIR_TOOL: &str = "list_dir";
pub const GREP_SEARCH_TOOL: &str = "grep_search";
pub const GLOB_TOOL: &str = "glob";
pub const RUN_COMMAND_TOOL: &str = "run_command";
pub const CREATE_TASK_TOOL: &str = "create_task";
pub const LIST_TASKS_TOOL: &str = "list_tasks";
pub const UPDATE_TASK_TOOL: &str = "update_task";
pub const COMPLETE_TASK_TOOL: &str = "complete_task";
pub const DELEGATE_TOOL: &str = "delegate";

pub fn register_builtin_tools(registry: &mut ToolRegistry) {
    registry.register(read_file::read_file_tool());
    registry.register(write_file::write_file_tool());
    registry.register(edit_file::edit_file_tool());
    registry.register(list_dir::list_dir_tool());
    registry.register(grep::grep_search_tool());
    registry.register(glob::glob_tool());
    registry.register(run_command::run_command_tool());
    registry.register(tasks::create_task_tool());
    registry.register(tasks::list_tasks_tool());
    registry.register(tasks::update_task_tool());
    registry.register(tasks::complete_task_tool());
    registry.register(delegate::delegate_tool());
}

fn required_string_argument(arguments: &Value, key: &str) -> Result<String, ToolError> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ToolError::Validation(format!("missing required argument '{key}'")))
}

fn optional_string_argument(arguments: &Value, key: &str) -> Result<Option<String>, ToolError> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(ToolError::Validation(format!(
            "argument '{key}' must be a string"
        ))),
    }
}

fn optional_usize_argument(arguments: &Value, key: &str) -> Result<Option<usize>, ToolError> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|value| usize::try_from(value).ok())
            .map(Some)
            .ok_or_else(|| {
                ToolError::Validation(format!(
                    "argument '{key}' must be a non-negative integer"
                ))
            }),
    }
}

fn required_u64_argument(arguments: &Value, key: &str) -> Result<u64, ToolError> {
    arguments
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            ToolError::Validation(format!(
                "missing required non-negative integer argument '{key}'"
            ))
        })
}

fn optional_bool_argument(arguments: &Value, key: &str) -> Result<Option<bool>, ToolError> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(value)) => Ok(Some(*value)),
        Some(_) => Err(ToolError::Validation(format!(
            "argument '{key}' must be a boolean"
        ))),
    }
}

fn optional_string_array_argument(
    arguments: &Value,
    key: &str,
) -> Result<Vec<String>, ToolError> {
    let Some(value) = arguments.get(key) else {
        return Ok(Vec::new());
    };
    let Some(items) = value.as_array() else {
        return Err(ToolError::Validation(format!(
            "argument '{key}' must be an array of strings"
        )));
    };
    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                ToolError::Validation(format!("argument '{key}' must contain only strings"))
            })
        })
        .collect()
}

fn format_exec_result(result: &ExecResult) -> String {
    let mut output = format!(
        "exit_code: {}\nduration_ms: {}",
        result.exit_code, result.duration_ms
    );
    if !result.stdout.is_empty() {
        output.push_str("\nstdout:\n");
        output.push_str(&result.stdout);
    }
    if !result.stderr.is_empty() {
        output.push_str("\nstderr:\n");
        output.push_str(&result.stderr);
    }
    output
}

fn format_line_numbered_content(content: &str, first_line: usize) -> String {
    content
        .lines()
        .enumerate()
        .map(|(offset, line)| format!("{:>4} | {line}", first_line + offset))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Fills in and clamps command timeouts before validation.
pub(crate) fn normalize_tool_arguments_for_dispatch(
    tool_name: &str,
    arguments: Value,
    config: &SessionConfig,
) -> Value {
    if tool_name != RUN_COMMAND_TOOL {
        return arguments;
    }
    let Value::Object(mut object) = arguments else {
        return arguments;
    };

    let timeout = match object.get("timeout_ms") {
        None | Some(Value::Null) => Some(config.default_command_timeout_ms),
        Some(value) => value
            .as_u64()
            .map(|timeout| timeout.min(config.max_command_timeout_ms)),
    };
    if let Some(timeout) = timeout {
        object.insert("timeout_ms".to_string(), Value::from(timeout));
    }
    Value::Object(object)
}

/// Checks arguments against the subset of JSON schema the built-in tools use:
/// required keys, `additionalProperties: false`, and primitive `type`s.
pub(crate) fn validate_tool_arguments(schema: &Value, arguments: &Value) -> Result<(), ToolError> {
    let object = arguments
        .as_object()
        .ok_or_else(|| ToolError::Validation("tool arguments must be a JSON object".to_string()))?;
    let schema_object = schema.as_object().ok_or_else(|| {
        ToolError::Validation("tool schema root must be a JSON object".to_string())
    })?;

    if let Some(required) = schema_object.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(key) {
                return Err(ToolError::Validation(format!(
                    "missing required argument '{key}'"
                )));
            }
        }
    }

    let empty = Map::new();
    let properties = schema_object
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let additional_allowed = schema_object
        .get("additionalProperties")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    for (key, value) in object {
        let Some(property) = properties.get(key) else {
            if additional_allowed {
                continue;
            }
            return Err(ToolError::Validation(format!(
                "unexpected argument '{key}' not allowed by schema"
            )));
        };
        check_value_type(key, property, value)?;
    }

    Ok(())
}

fn check_value_type(key: &str, property: &Value, value: &Value) -> Result<(), ToolError> {
    let Some(type_name) = property.get("type").and_then(Value::as_str) else {
        return Ok(());
    };
    let is_valid = match type_name {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    };
    if !is_valid {
        return Err(ToolError::Validation(format!(
            "argument '{key}' expected type '{type_name}' but received '{}'",
            json_type_name(value)
        )));
    }

    if let Some(allowed) = property.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(ToolError::Validation(format!(
                "argument '{key}' must be one of {}",
                Value::Array(allowed.clone())
            )));
        }
    }

    if let (Some(items), Some(values)) = (property.get("items"), value.as_array()) {
        for item in values {
            check_value_type(key, items, item)?;
        }
    }
    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Action, CommandPolicy, ExecutionEnvironment, LocalSandbox, TaskLedger, TaskStatus,
    };
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        _dir: tempfile::TempDir,
        sandbox: Arc<LocalSandbox>,
        ledger: Arc<TaskLedger>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("temp dir should be created");
            let sandbox = Arc::new(
                LocalSandbox::new(dir.path(), CommandPolicy::default())
                    .expect("sandbox should open"),
            );
            Self {
                _dir: dir,
                sandbox,
                ledger: Arc::new(TaskLedger::new()),
            }
        }

        fn context(&self) -> ToolContext {
            ToolContext {
                session_id: "s1".to_string(),
                step_budget: 10,
                sandbox: self.sandbox.clone(),
                ledger: self.ledger.clone(),
                delegator: None,
            }
        }

        async fn dispatch(&self, name: &str, arguments: Value) -> Result<String, ToolError> {
            ToolRegistry::with_builtin_tools()
                .dispatch(
                    &Action::new(name, arguments),
                    self.context(),
                    &SessionConfig::default(),
                )
                .await
        }
    }

    fn counting_tool(name: &str, calls: Arc<AtomicUsize>) -> RegisteredTool {
        RegisteredTool {
            definition: ToolDefinition {
                name: name.to_string(),
                description: "counts calls".to_string(),
                class: ToolClass::Mutating,
                parameters: json!({
                    "type": "object",
                    "required": ["value"],
                    "properties": { "value": { "type": "integer" } },
                    "additionalProperties": false
                }),
            },
            executor: Arc::new(move |_args, _context| {
                let calls = calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("counted".to_string())
                })
            }),
        }
    }

    #[test]
    fn builtin_registry_classifies_every_tool() {
        let registry = ToolRegistry::with_builtin_tools();
        assert_eq!(registry.len(), 12);
        assert_eq!(registry.class_of(READ_FILE_TOOL), Some(ToolClass::Pure));
        assert_eq!(registry.class_of(WRITE_FILE_TOOL), Some(ToolClass::Mutating));
        assert_eq!(registry.class_of(RUN_COMMAND_TOOL), Some(ToolClass::Execution));
        assert_eq!(registry.class_of(DELEGATE_TOOL), Some(ToolClass::Execution));
        let names = registry.names();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn restricted_registry_keeps_only_named_tools() {
        let allowed = BTreeSet::from([READ_FILE_TOOL.to_string(), "missing".to_string()]);
        let registry = ToolRegistry::with_builtin_tools().restricted(&allowed);
        assert_eq!(registry.names(), vec![READ_FILE_TOOL.to_string()]);
    }

    #[tokio::test]
    async fn dispatch_unknown_tool_is_typed_error() {
        let fixture = Fixture::new();
        let error = fixture
            .dispatch("launch_rocket", json!({}))
            .await
            .expect_err("unknown tool should fail");
        assert_eq!(error, ToolError::UnknownTool("launch_rocket".to_string()));
    }

    #[tokio::test]
    async fn dispatch_validation_error_skips_execution() {
        let fixture = Fixture::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(counting_tool("count", calls.clone()));
        let config = SessionConfig::default();

        for arguments in [json!({}), json!({"value": "seven"}), json!({"value": 1, "x": 2})] {
            let error = registry
                .dispatch(&Action::new("count", arguments), fixture.context(), &config)
                .await
                .expect_err("invalid arguments should fail");
            assert!(matches!(error, ToolError::Validation(_)));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        registry
            .dispatch(&Action::new("count", json!({"value": 1})), fixture.context(), &config)
            .await
            .expect("valid call should run");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn external_adapter_failure_surfaces_as_execution_error() {
        let fixture = Fixture::new();
        let mut registry = ToolRegistry::new();
        registry.register(RegisteredTool {
            definition: ToolDefinition {
                name: "deploy_preview".to_string(),
                description: "pushes a preview deployment".to_string(),
                class: ToolClass::Execution,
                parameters: json!({"type": "object", "properties": {}}),
            },
            executor: Arc::new(|_args, _context| {
                Box::pin(async move {
                    Err(ToolError::execution(
                        "deployment service returned 401 unauthorized",
                    ))
                })
            }),
        });

        let error = registry
            .dispatch(
                &Action::new("deploy_preview", json!({})),
                fixture.context(),
                &SessionConfig::default(),
            )
            .await
            .expect_err("adapter failure should surface");
        assert_eq!(error.kind(), crate::FailureKind::Execution);
    }

    #[tokio::test]
    async fn write_file_escape_returns_permission_error() {
        let fixture = Fixture::new();
        let error = fixture
            .dispatch(
                WRITE_FILE_TOOL,
                json!({"path": "../../etc/passwd", "contents": "x"}),
            )
            .await
            .expect_err("escape should fail");
        assert!(matches!(error, ToolError::Permission(_)));
    }

    #[tokio::test]
    async fn read_file_returns_line_numbered_window() {
        let fixture = Fixture::new();
        fixture
            .sandbox
            .write_file("notes.txt", "one\ntwo\nthree\nfour")
            .await
            .expect("write should succeed");
        let output = fixture
            .dispatch(READ_FILE_TOOL, json!({"path": "notes.txt", "offset": 2, "limit": 2}))
            .await
            .expect("read should succeed");
        assert_eq!(output, "   2 | two\n   3 | three");
    }

    #[tokio::test]
    async fn edit_file_replaces_line_range() {
        let fixture = Fixture::new();
        fixture
            .sandbox
            .write_file("app.py", "a\nb\nc\nd\n")
            .await
            .expect("write should succeed");
        fixture
            .dispatch(
                EDIT_FILE_TOOL,
                json!({"path": "app.py", "line_range": "2:3", "new_text": "B\nC2\nC3"}),
            )
            .await
            .expect("edit should succeed");
        let contents = fixture
            .sandbox
            .read_file("app.py")
            .await
            .expect("read should succeed");
        assert_eq!(contents, "a\nB\nC2\nC3\nd\n");
    }

    #[tokio::test]
    async fn edit_file_rejects_out_of_range_lines() {
        let fixture = Fixture::new();
        fixture
            .sandbox
            .write_file("app.py", "a\nb\n")
            .await
            .expect("write should succeed");
        let error = fixture
            .dispatch(
                EDIT_FILE_TOOL,
                json!({"path": "app.py", "line_range": "3:9", "new_text": "x"}),
            )
            .await
            .expect_err("range past end should fail");
        assert!(matches!(error, ToolError::Validation(_)));
    }

    #[tokio::test]
    async fn list_dir_marks_directories_and_files() {
        let fixture = Fixture::new();
        fixture
            .sandbox
            .write_file("src/lib.rs", "")
            .await
            .expect("write should succeed");
        fixture
            .sandbox
            .write_file("README.md", "hi")
            .await
            .expect("write should succeed");
        let output = fixture
            .dispatch(LIST_DIR_TOOL, json!({}))
            .await
            .expect("list should succeed");
        assert_eq!(output, "[FILE] README.md\n[DIR]  src");
    }

    #[tokio::test]
    async fn ledger_tools_round_trip_through_dispatch() {
        let fixture = Fixture::new();
        let created = fixture
            .dispatch(
                CREATE_TASK_TOOL,
                json!({"description": "add auth", "priority": "high"}),
            )
            .await
            .expect("create should succeed");
        assert!(created.contains("\"id\": 1"));

        fixture
            .dispatch(UPDATE_TASK_TOOL, json!({"task_id": 1, "status": "in_progress"}))
            .await
            .expect("update should succeed");
        fixture
            .dispatch(COMPLETE_TASK_TOOL, json!({"task_id": 1}))
            .await
            .expect("complete should succeed");

        let listed = fixture
            .dispatch(LIST_TASKS_TOOL, json!({}))
            .await
            .expect("list should succeed");
        assert!(listed.contains("\"completed\": 1"));
        assert_eq!(
            fixture.ledger.get(1).map(|task| task.status),
            Some(TaskStatus::Completed)
        );
        assert_eq!(
            fixture.ledger.get(1).and_then(|task| task.owner),
            Some("s1".to_string())
        );
    }

    #[tokio::test]
    async fn update_task_rejects_unknown_status_before_touching_ledger() {
        let fixture = Fixture::new();
        let error = fixture
            .dispatch(UPDATE_TASK_TOOL, json!({"task_id": 1, "status": "done"}))
            .await
            .expect_err("bad status should fail");
        assert!(matches!(error, ToolError::Validation(_)));
        assert!(fixture.ledger.is_empty());
    }

    #[tokio::test]
    async fn update_task_unknown_id_is_not_found() {
        let fixture = Fixture::new();
        let error = fixture
            .dispatch(UPDATE_TASK_TOOL, json!({"task_id": 42, "status": "completed"}))
            .await
            .expect_err("unknown id should fail");
        assert!(matches!(error, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn delegate_without_delegator_is_permission_error() {
        let fixture = Fixture::new();
        let error = fixture
            .dispatch(
                DELEGATE_TOOL,
                json!({"assignments": [{"focus": "api", "instructions": "build it"}]}),
            )
            .await
            .expect_err("delegation should be unavailable");
        assert!(matches!(error, ToolError::Permission(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_command_applies_default_timeout_and_formats_output() {
        let fixture = Fixture::new();
        let output = fixture
            .dispatch(RUN_COMMAND_TOOL, json!({"program": "echo", "args": ["hi"]}))
            .await
            .expect("echo should succeed");
        assert!(output.starts_with("exit_code: 0"));
        assert!(output.contains("stdout:\nhi"));
    }

    #[test]
    fn normalize_clamps_command_timeout() {
        let config = SessionConfig::default();
        let normalized = normalize_tool_arguments_for_dispatch(
            RUN_COMMAND_TOOL,
            json!({"program": "ls", "timeout_ms": 10_000_000}),
            &config,
        );
        assert_eq!(normalized["timeout_ms"], json!(config.max_command_timeout_ms));

        let defaulted =
            normalize_tool_arguments_for_dispatch(RUN_COMMAND_TOOL, json!({"program": "ls"}), &config);
        assert_eq!(defaulted["timeout_ms"], json!(config.default_command_timeout_ms));
    }

    #[test]
    fn validator_checks_enum_and_array_items() {
        let schema = json!({
            "type": "object",
            "properties": {
                "status": { "type": "string", "enum": ["pending", "completed"] },
                "args": { "type": "array", "items": { "type": "string" } }
            }
        });
        assert!(validate_tool_arguments(&schema, &json!({"status": "pending"})).is_ok());
        assert!(validate_tool_arguments(&schema, &json!({"status": "nope"})).is_err());
        assert!(validate_tool_arguments(&schema, &json!({"args": ["a", 1]})).is_err());
        assert!(validate_tool_arguments(&schema, &json!([1, 2])).is_err());
    }
}
