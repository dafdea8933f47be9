use serde_json::json;
use std::sync::Arc;

use crate::ToolError;

use super::{EDIT_FILE_TOOL, RegisteredTool, ToolClass, ToolDefinition, required_string_argument};

pub(super) fn edit_file_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: EDIT_FILE_TOOL.to_string(),
            description: "Replace an inclusive, 1-based line range (\"5\" or \"5:10\") of a file \
                          with new text. Empty new_text deletes the lines."
                .to_string(),
            class: ToolClass::Mutating,
            parameters: json!({
                "type": "object",
                "required": ["path", "line_range", "new_text"],
                "properties": {
                    "path": { "type": "string" },
                    "line_range": { "type": "string" },
                    "new_text": { "type": "string" }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, context| {
            Box::pin(async move {
                let path = required_string_argument(&args, "path")?;
                let (start, end) = parse_line_range(&required_string_argument(&args, "line_range")?)?;
                let new_text = required_string_argument(&args, "new_text")?;

                let content = context.sandbox.read_file(&path).await?;
                let updated = replace_lines(&content, start, end, &new_text)?;
                context.sandbox.write_file(&path, &updated).await?;
                Ok(format!("Replaced lines {start}-{end} in {path}"))
            })
        }),
    }
}

fn parse_line_range(raw: &str) -> Result<(usize, usize), ToolError> {
    let invalid = || ToolError::Validation(format!("invalid line_range '{raw}'"));
    let parse = |part: &str| part.trim().parse::<usize>().map_err(|_| invalid());

    let (start, end) = match raw.split_once(':') {
        Some((start, end)) => (parse(start)?, parse(end)?),
        None => {
            let line = parse(raw)?;
            (line, line)
        }
    };
    if start == 0 || end < start {
        return Err(invalid());
    }
    Ok((start, end))
}

fn replace_lines(content: &str, start: usize, end: usize, new_text: &str) -> Result<String, ToolError> {
    let mut lines: Vec<&str> = content.lines().collect();
    if end > lines.len() {
        return Err(ToolError::Validation(format!(
            "line range {start}-{end} is past the end of the file ({} lines)",
            lines.len()
        )));
    }
    lines.splice(start - 1..end, new_text.lines());

    let mut updated = lines.join("\n");
    if content.ends_with('\n') && !updated.is_empty() {
        updated.push('\n');
    }
    Ok(updated)
}
