use crate::{
    Action, Delegator, ExecutionEnvironment, SessionConfig, TaskLedger, ToolError,
    truncate_tool_output,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

use super::{normalize_tool_arguments_for_dispatch, validate_tool_arguments};

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send>>;
pub type ToolExecutor = Arc<dyn Fn(Value, ToolContext) -> ToolFuture + Send + Sync>;

/// Side-effect class of a tool; decides which confinement rules apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolClass {
    Pure,
    Mutating,
    Execution,
}

impl ToolClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pure => "pure",
            Self::Mutating => "mutating",
            Self::Execution => "execution",
        }
    }

    pub fn has_side_effects(&self) -> bool {
        !matches!(self, Self::Pure)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub class: ToolClass,
    pub parameters: Value,
}

/// Per-call handles a tool executor may use.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub step_budget: usize,
    pub sandbox: Arc<dyn ExecutionEnvironment>,
    pub ledger: Arc<TaskLedger>,
    pub delegator: Option<Arc<dyn Delegator>>,
}

#[derive(Clone)]
pub struct RegisteredTool {
    pub definition: ToolDefinition,
    pub executor: ToolExecutor,
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in tool.
    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::new();
        super::register_builtin_tools(&mut registry);
        registry
    }

    pub fn register(&mut self, tool: RegisteredTool) {
        self.tools.insert(tool.definition.name.clone(), tool);
    }

    pub fn unregister(&mut self, name: &str) -> Option<RegisteredTool> {
        self.tools.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn class_of(&self, name: &str) -> Option<ToolClass> {
        self.tools.get(name).map(|tool| tool.definition.class)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| tool.definition.clone())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Copy limited to the named capability set. Unknown names are ignored.
    pub fn restricted(&self, allowed: &BTreeSet<String>) -> Self {
        Self {
            tools: self
                .tools
                .iter()
                .filter(|(name, _)| allowed.contains(*name))
                .map(|(name, tool)| (name.clone(), tool.clone()))
                .collect(),
        }
    }

    /// Resolves, validates and runs one action.
    ///
    /// Lookup and argument validation both happen before the executor is
    /// invoked, so a rejected call has no side effects.
    pub async fn dispatch(
        &self,
        action: &Action,
        context: ToolContext,
        config: &SessionConfig,
    ) -> Result<String, ToolError> {
        let Some(tool) = self.tools.get(&action.name) else {
            return Err(ToolError::UnknownTool(action.name.clone()));
        };

        let arguments = normalize_tool_arguments_for_dispatch(
            &action.name,
            action.arguments_value(),
            config,
        );
        validate_tool_arguments(&tool.definition.parameters, &arguments)?;

        debug!(
            tool = %action.name,
            class = tool.definition.class.as_str(),
            session_id = %context.session_id,
            "dispatching tool"
        );
        let output = (tool.executor)(arguments, context).await?;
        Ok(truncate_tool_output(&output, &action.name, config))
    }
}
