use serde_json::json;
use std::sync::Arc;

use super::{LIST_DIR_TOOL, RegisteredTool, ToolClass, ToolDefinition, optional_string_argument};

pub(super) fn list_dir_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: LIST_DIR_TOOL.to_string(),
            description: "List a workspace directory (defaults to the workspace root).".to_string(),
            class: ToolClass::Pure,
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, context| {
            Box::pin(async move {
                let path = optional_string_argument(&args, "path")?.unwrap_or_else(|| ".".to_string());
                let entries = context.sandbox.list_directory(&path).await?;
                if entries.is_empty() {
                    return Ok(format!("{path} is empty"));
                }
                Ok(entries
                    .iter()
                    .map(|entry| {
                        if entry.is_dir {
                            format!("[DIR]  {}", entry.name)
                        } else {
                            format!("[FILE] {}", entry.name)
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n"))
            })
        }),
    }
}
