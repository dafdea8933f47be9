use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use thiserror::Error;

/// Top-level error type for the foreman-agent crate.
///
/// These are faults returned to the *caller* of a session or coordinator.
/// Failures the planner can react to travel as [`ToolError`] observations
/// inside the transcript instead.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Planner(#[from] PlannerError),
    #[error("delegation depth {depth} exceeds the maximum of {max_depth}")]
    DepthExceeded { depth: usize, max_depth: usize },
    #[error("event emitter failed: {0}")]
    Emitter(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid session state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("session {0} already reached a terminal status")]
    AlreadyFinished(String),
}

/// Typed failure of a single tool dispatch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("command timed out after {timeout_ms} ms")]
    Timeout {
        timeout_ms: u64,
        stdout: String,
        stderr: String,
    },
    #[error("{message}")]
    Execution {
        message: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

impl ToolError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::UnknownTool(_) => FailureKind::UnknownTool,
            Self::Validation(_) => FailureKind::Validation,
            Self::Permission(_) => FailureKind::Permission,
            Self::NotFound(_) => FailureKind::NotFound,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Execution { .. } => FailureKind::Execution,
        }
    }

    /// Output captured from a process before it failed or was killed.
    pub fn captured_output(&self) -> Option<String> {
        let (stdout, stderr, exit_code) = match self {
            Self::Timeout { stdout, stderr, .. } => (stdout, stderr, None),
            Self::Execution {
                stdout,
                stderr,
                exit_code,
                ..
            } => (stdout, stderr, *exit_code),
            _ => return None,
        };
        if stdout.is_empty() && stderr.is_empty() && exit_code.is_none() {
            return None;
        }

        let mut rendered = String::new();
        if let Some(code) = exit_code {
            rendered.push_str(&format!("exit_code: {code}"));
        }
        if !stdout.is_empty() {
            if !rendered.is_empty() {
                rendered.push('\n');
            }
            rendered.push_str("stdout:\n");
            rendered.push_str(stdout);
        }
        if !stderr.is_empty() {
            if !rendered.is_empty() {
                rendered.push('\n');
            }
            rendered.push_str("stderr:\n");
            rendered.push_str(stderr);
        }
        Some(rendered)
    }
}

/// Malformed planner output.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("could not parse planner output: {reason}")]
pub struct ParseError {
    pub reason: String,
    pub raw: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlannerError {
    #[error("planner did not answer within {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    #[error("planner unavailable: {0}")]
    Unavailable(String),
    #[error("planner failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Classification recorded on every failed step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Parse,
    UnknownTool,
    Validation,
    Permission,
    Timeout,
    Execution,
    NotFound,
    QualityGateRejection,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "parse_error",
            Self::UnknownTool => "unknown_tool_error",
            Self::Validation => "validation_error",
            Self::Permission => "permission_error",
            Self::Timeout => "timeout_error",
            Self::Execution => "execution_error",
            Self::NotFound => "not_found_error",
            Self::QualityGateRejection => "quality_gate_rejection",
        }
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
