use serde_json::json;
use std::sync::Arc;

use crate::ExecRequest;

use super::{
    RUN_COMMAND_TOOL, RegisteredTool, ToolClass, ToolDefinition, format_exec_result,
    optional_string_argument, optional_string_array_argument, required_string_argument,
    required_u64_argument,
};

pub(super) fn run_command_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: RUN_COMMAND_TOOL.to_string(),
            description: "Run an allowlisted program in the workspace. Arguments are passed \
                          verbatim, not through a shell, and may not name absolute paths or \
                          parent directories."
                .to_string(),
            class: ToolClass::Execution,
            parameters: json!({
                "type": "object",
                "required": ["program"],
                "properties": {
                    "program": { "type": "string" },
                    "args": { "type": "array", "items": { "type": "string" } },
                    "timeout_ms": { "type": "integer" },
                    "working_dir": { "type": "string" }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, context| {
            Box::pin(async move {
                let request = ExecRequest {
                    program: required_string_argument(&args, "program")?,
                    args: optional_string_array_argument(&args, "args")?,
                    timeout_ms: required_u64_argument(&args, "timeout_ms")?,
                    working_dir: optional_string_argument(&args, "working_dir")?,
                };
                let result = context.sandbox.exec_command(&request).await?;
                Ok(format_exec_result(&result))
            })
        }),
    }
}
