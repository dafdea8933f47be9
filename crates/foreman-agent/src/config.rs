use crate::{AgentError, RetryBackoffConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Runtime configuration for one orchestrator session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_steps: usize,
    pub max_parse_errors: usize,
    pub context_window_steps: usize,
    pub quality_gating: bool,
    pub quality_threshold: u8,
    /// Run the periodic self-check every N steps. `0` disables it.
    pub reflection_interval: usize,
    pub planner_timeout_ms: u64,
    pub planner_max_attempts: u32,
    pub planner_backoff: RetryBackoffConfig,
    pub default_command_timeout_ms: u64,
    pub max_command_timeout_ms: u64,
    pub command_output_limit_bytes: usize,
    pub tool_output_limits: HashMap<String, usize>,
    pub allowed_tools: Option<BTreeSet<String>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_steps: 30,
            max_parse_errors: 3,
            context_window_steps: 6,
            quality_gating: true,
            quality_threshold: 80,
            reflection_interval: 8,
            planner_timeout_ms: 60_000,
            planner_max_attempts: 3,
            planner_backoff: RetryBackoffConfig::default(),
            default_command_timeout_ms: 30_000,
            max_command_timeout_ms: 600_000,
            command_output_limit_bytes: 100_000,
            tool_output_limits: default_tool_output_limits(),
            allowed_tools: None,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.max_steps == 0 {
            return Err(invalid("max_steps must be greater than zero"));
        }
        if self.max_parse_errors == 0 {
            return Err(invalid("max_parse_errors must be greater than zero"));
        }
        if self.quality_threshold > 100 {
            return Err(invalid("quality_threshold must be within 0..=100"));
        }
        if self.planner_timeout_ms == 0 {
            return Err(invalid("planner_timeout_ms must be greater than zero"));
        }
        if self.planner_max_attempts == 0 {
            return Err(invalid("planner_max_attempts must be at least 1"));
        }
        if self.default_command_timeout_ms == 0
            || self.default_command_timeout_ms > self.max_command_timeout_ms
        {
            return Err(invalid(
                "default_command_timeout_ms must be within 1..=max_command_timeout_ms",
            ));
        }
        Ok(())
    }
}

pub fn default_tool_output_limits() -> HashMap<String, usize> {
    HashMap::from([
        ("read_file".to_string(), 50_000),
        ("run_command".to_string(), 30_000),
        ("grep_search".to_string(), 20_000),
        ("glob".to_string(), 20_000),
        ("list_dir".to_string(), 20_000),
        ("edit_file".to_string(), 10_000),
        ("write_file".to_string(), 1_000),
        ("delegate".to_string(), 20_000),
    ])
}

/// One allowlisted command prefix.
///
/// `prefix` is matched token-wise against `program` followed by `args`, so
/// `git status` permits `git status --short` but not `git push`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedCommand {
    pub prefix: String,
    #[serde(default)]
    pub shell: bool,
}

impl AllowedCommand {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            shell: false,
        }
    }

    pub fn via_shell(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            shell: true,
        }
    }

    pub fn tokens(&self) -> Vec<&str> {
        self.prefix.split_whitespace().collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandPolicy {
    pub allowed: Vec<AllowedCommand>,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        let allowed = [
            "pytest",
            "ls",
            "echo",
            "cat",
            "grep",
            "pwd",
            "python3",
            "python",
            "pip",
            "which",
            "wc",
            "head",
            "tail",
            "find",
            "tree",
            "git status",
            "git diff",
            "git log",
            "npm",
            "node",
        ]
        .into_iter()
        .map(AllowedCommand::new)
        .collect();
        Self { allowed }
    }
}

impl CommandPolicy {
    pub fn empty() -> Self {
        Self {
            allowed: Vec::new(),
        }
    }

    pub fn allow(mut self, entry: AllowedCommand) -> Self {
        self.allowed.push(entry);
        self
    }

    /// Longest allowlisted prefix matching the invocation.
    pub fn find_match(&self, program: &str, args: &[String]) -> Option<&AllowedCommand> {
        let invocation: Vec<&str> = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect();
        self.allowed
            .iter()
            .filter(|entry| {
                let tokens = entry.tokens();
                !tokens.is_empty()
                    && tokens.len() <= invocation.len()
                    && tokens.iter().zip(&invocation).all(|(a, b)| a == b)
            })
            .max_by_key(|entry| entry.tokens().len())
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        for entry in &self.allowed {
            let Some(first) = entry.tokens().first().copied() else {
                return Err(invalid("allowlisted command prefix must not be empty"));
            };
            if first.contains('/') {
                return Err(invalid(format!(
                    "allowlisted command '{}' must name a program, not a path",
                    entry.prefix
                )));
            }
        }
        Ok(())
    }
}

/// Fan-out settings for the sub-agent coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub max_parallel: usize,
    pub specialist_step_budget: usize,
    pub specialist_timeout_ms: Option<u64>,
    pub deadline_ms: Option<u64>,
    pub max_depth: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            specialist_step_budget: 25,
            specialist_timeout_ms: None,
            deadline_ms: None,
            max_depth: 1,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.max_parallel == 0 {
            return Err(invalid("max_parallel must be greater than zero"));
        }
        if self.specialist_step_budget == 0 {
            return Err(invalid("specialist_step_budget must be greater than zero"));
        }
        if self.specialist_timeout_ms == Some(0) || self.deadline_ms == Some(0) {
            return Err(invalid("coordinator timeouts must be greater than zero"));
        }
        Ok(())
    }

    /// Step budget for a specialist spawned under a parent with `parent_budget`.
    /// A parent with fewer than two steps has nothing smaller to hand down.
    pub fn specialist_budget(
        &self,
        requested: Option<usize>,
        parent_budget: usize,
    ) -> Result<usize, AgentError> {
        if parent_budget < 2 {
            return Err(invalid(format!(
                "a parent step budget of {parent_budget} is too small to delegate"
            )));
        }
        let ceiling = (parent_budget - 1).min(self.specialist_step_budget.max(1));
        Ok(requested
            .unwrap_or(self.specialist_step_budget)
            .clamp(1, ceiling))
    }
}

fn invalid(message: impl Into<String>) -> AgentError {
    AgentError::InvalidConfiguration(message.into())
}
