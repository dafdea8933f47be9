use serde_json::json;
use std::sync::Arc;

use super::{GLOB_TOOL, RegisteredTool, ToolClass, ToolDefinition, required_string_argument};

pub(super) fn glob_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: GLOB_TOOL.to_string(),
            description: "Find workspace files matching a glob pattern such as src/**/*.rs."
                .to_string(),
            class: ToolClass::Pure,
            parameters: json!({
                "type": "object",
                "required": ["pattern"],
                "properties": {
                    "pattern": { "type": "string" }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, context| {
            Box::pin(async move {
                let pattern = required_string_argument(&args, "pattern")?;
                let matches = context.sandbox.glob(&pattern).await?;
                if matches.is_empty() {
                    return Ok(format!("no files match '{pattern}'"));
                }
                Ok(matches.join("\n"))
            })
        }),
    }
}
