use serde_json::json;
use std::sync::Arc;

use crate::GrepOptions;

use super::{
    GREP_SEARCH_TOOL, RegisteredTool, ToolClass, ToolDefinition, optional_bool_argument,
    optional_string_argument, optional_usize_argument, required_string_argument,
};

pub(super) fn grep_search_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: GREP_SEARCH_TOOL.to_string(),
            description: "Search workspace files for a regex. Returns path:line:text matches."
                .to_string(),
            class: ToolClass::Pure,
            parameters: json!({
                "type": "object",
                "required": ["pattern"],
                "properties": {
                    "pattern": { "type": "string" },
                    "path": { "type": "string" },
                    "case_insensitive": { "type": "boolean" },
                    "max_results": { "type": "integer" }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, context| {
            Box::pin(async move {
                let pattern = required_string_argument(&args, "pattern")?;
                let defaults = GrepOptions::default();
                let options = GrepOptions {
                    path: optional_string_argument(&args, "path")?,
                    case_insensitive: optional_bool_argument(&args, "case_insensitive")?
                        .unwrap_or(defaults.case_insensitive),
                    max_results: optional_usize_argument(&args, "max_results")?
                        .unwrap_or(defaults.max_results),
                };
                context.sandbox.grep(&pattern, &options).await
            })
        }),
    }
}
