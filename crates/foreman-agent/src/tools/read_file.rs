use serde_json::json;
use std::sync::Arc;

use super::{
    READ_FILE_TOOL, RegisteredTool, ToolClass, ToolDefinition, format_line_numbered_content,
    optional_usize_argument, required_string_argument,
};

pub(super) fn read_file_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: READ_FILE_TOOL.to_string(),
            description: "Read a UTF-8 file inside the workspace. Returns line-numbered content; \
                          offset is 1-based."
                .to_string(),
            class: ToolClass::Pure,
            parameters: json!({
                "type": "object",
                "required": ["path"],
                "properties": {
                    "path": { "type": "string" },
                    "offset": { "type": "integer" },
                    "limit": { "type": "integer" }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, context| {
            Box::pin(async move {
                let path = required_string_argument(&args, "path")?;
                let offset = optional_usize_argument(&args, "offset")?.unwrap_or(1).max(1);
                let limit = optional_usize_argument(&args, "limit")?;

                let content = context.sandbox.read_file(&path).await?;
                let window: Vec<&str> = content
                    .lines()
                    .skip(offset - 1)
                    .take(limit.unwrap_or(usize::MAX))
                    .collect();
                if window.is_empty() {
                    return Ok(format!("{path}: no lines at offset {offset}"));
                }
                Ok(format_line_numbered_content(&window.join("\n"), offset))
            })
        }),
    }
}
