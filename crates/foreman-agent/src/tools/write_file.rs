use serde_json::json;
use std::sync::Arc;

use super::{RegisteredTool, ToolClass, ToolDefinition, WRITE_FILE_TOOL, required_string_argument};

pub(super) fn write_file_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: WRITE_FILE_TOOL.to_string(),
            description: "Create or overwrite a file inside the workspace. Parent directories \
                          are created as needed."
                .to_string(),
            class: ToolClass::Mutating,
            parameters: json!({
                "type": "object",
                "required": ["path", "contents"],
                "properties": {
                    "path": { "type": "string" },
                    "contents": { "type": "string" }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, context| {
            Box::pin(async move {
                let path = required_string_argument(&args, "path")?;
                let contents = required_string_argument(&args, "contents")?;
                context.sandbox.write_file(&path, &contents).await?;
                Ok(format!("Wrote {} bytes to {path}", contents.len()))
            })
        }),
    }
}
