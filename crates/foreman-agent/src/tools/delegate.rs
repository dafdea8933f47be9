use serde_json::json;
use std::sync::Arc;

use crate::{AgentError, DelegationRequest, SpecialistAssignment, ToolError};

use super::{DELEGATE_TOOL, RegisteredTool, ToolClass, ToolDefinition};

const SPECIALIST_WORKSPACE_DIR: &str = "specialists";

pub(super) fn delegate_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: DELEGATE_TOOL.to_string(),
            description: "Hand independent pieces of the goal to specialist sessions that run in parallel. Each assignment needs a focus and instructions; the reply integrates their results.".to_string(),
            class: ToolClass::Execution,
            parameters: json!({
                "type": "object",
                "required": ["assignments"],
                "properties": {
                    "assignments": {
                        "type": "array",
                        "items": { "type": "object" }
                    }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, context| {
            Box::pin(async move {
                let Some(delegator) = context.delegator.clone() else {
                    return Err(ToolError::Permission(
                        "delegation is not available in this session".to_string(),
                    ));
                };
                let raw = args.get("assignments").cloned().unwrap_or_default();
                let assignments: Vec<SpecialistAssignment> = serde_json::from_value(raw)
                    .map_err(|error| {
                        ToolError::Validation(format!("invalid specialist assignment: {error}"))
                    })?;
                if assignments.is_empty() {
                    return Err(ToolError::Validation(
                        "at least one assignment is required".to_string(),
                    ));
                }

                let request = DelegationRequest {
                    parent_session_id: context.session_id.clone(),
                    parent_step_budget: context.step_budget,
                    workspace_root: context.sandbox.root().join(SPECIALIST_WORKSPACE_DIR),
                    assignments,
                };
                let report = delegator.delegate(request).await.map_err(|error| match error {
                    AgentError::DepthExceeded { .. } => ToolError::Permission(error.to_string()),
                    AgentError::InvalidConfiguration(message) => ToolError::Validation(message),
                    other => ToolError::execution(other.to_string()),
                })?;

                serde_json::to_string_pretty(&report).map_err(|error| {
                    ToolError::execution(format!("failed to render integration report: {error}"))
                })
            })
        }),
    }
}
