use serde_json::json;
use std::sync::Arc;

use crate::{LedgerSummary, TaskPriority, TaskStatus, ToolError};

use super::{
    COMPLETE_TASK_TOOL, CREATE_TASK_TOOL, LIST_TASKS_TOOL, RegisteredTool, ToolClass,
    ToolDefinition, UPDATE_TASK_TOOL, optional_string_argument, required_string_argument,
    required_u64_argument,
};

fn render<T: serde::Serialize>(value: &T) -> Result<String, ToolError> {
    serde_json::to_string_pretty(value)
        .map_err(|error| ToolError::execution(format!("failed to render ledger state: {error}")))
}

pub(super) fn create_task_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: CREATE_TASK_TOOL.to_string(),
            description: "Add a work item to the shared task ledger.".to_string(),
            class: ToolClass::Mutating,
            parameters: json!({
                "type": "object",
                "required": ["description"],
                "properties": {
                    "description": { "type": "string" },
                    "priority": { "type": "string", "enum": ["low", "medium", "high"] }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, context| {
            Box::pin(async move {
                let description = required_string_argument(&args, "description")?;
                let priority = match optional_string_argument(&args, "priority")? {
                    Some(raw) => raw.parse::<TaskPriority>().map_err(ToolError::Validation)?,
                    None => TaskPriority::default(),
                };
                let task = context
                    .ledger
                    .create(&description, priority, Some(&context.session_id))?;
                render(&task)
            })
        }),
    }
}

pub(super) fn list_tasks_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: LIST_TASKS_TOOL.to_string(),
            description: "Show every task in the shared ledger with status counts.".to_string(),
            class: ToolClass::Pure,
            parameters: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|_args, context| {
            Box::pin(async move {
                let tasks = context.ledger.list();
                render(&json!({
                    "summary": LedgerSummary::of(&tasks),
                    "tasks": tasks,
                }))
            })
        }),
    }
}

pub(super) fn update_task_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: UPDATE_TASK_TOOL.to_string(),
            description: "Move a task forward: pending -> in_progress -> completed.".to_string(),
            class: ToolClass::Mutating,
            parameters: json!({
                "type": "object",
                "required": ["task_id", "status"],
                "properties": {
                    "task_id": { "type": "integer" },
                    "status": {
                        "type": "string",
                        "enum": ["pending", "in_progress", "completed"]
                    }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, context| {
            Box::pin(async move {
                let id = required_u64_argument(&args, "task_id")?;
                let status = required_string_argument(&args, "status")?
                    .parse::<TaskStatus>()
                    .map_err(ToolError::Validation)?;
                let task = context.ledger.update(id, status)?;
                render(&task)
            })
        }),
    }
}

pub(super) fn complete_task_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: COMPLETE_TASK_TOOL.to_string(),
            description: "Mark a task completed.".to_string(),
            class: ToolClass::Mutating,
            parameters: json!({
                "type": "object",
                "required": ["task_id"],
                "properties": {
                    "task_id": { "type": "integer" }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, context| {
            Box::pin(async move {
                let id = required_u64_argument(&args, "task_id")?;
                let task = context.ledger.update(id, TaskStatus::Completed)?;
                Ok(format!("Task {} completed: {}", task.id, task.description))
            })
        }),
    }
}
