use crate::{PlannerError, Step, ToolDefinition};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Everything the planner may look at for one turn.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlannerRequest {
    pub session_id: String,
    pub goal: String,
    /// Index the next step will receive.
    pub step_index: usize,
    pub remaining_steps: usize,
    pub window: Vec<Step>,
    pub tools: Vec<ToolDefinition>,
    /// Text rendering of the fields above for text-only planners.
    pub prompt: String,
}

/// External reasoning component. Returns the raw reply; the session parses it.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &PlannerRequest) -> Result<String, PlannerError>;
}

pub fn render_prompt(
    goal: &str,
    window: &[Step],
    tools: &[ToolDefinition],
    remaining_steps: usize,
) -> String {
    let mut prompt = String::from(
        "You are an autonomous agent working inside a sandboxed workspace.\n\
         Reply with exactly one JSON object per turn:\n\
         {\"action\": \"<tool name>\", \"args\": {...}} to call a tool, or\n\
         {\"action\": \"DONE\", \"result\": \"<summary>\"} when the goal is met.\n\n",
    );
    prompt.push_str(&format!("GOAL:\n{goal}\n\nTOOLS:\n"));
    for tool in tools {
        prompt.push_str(&format!(
            "- {} ({}): {} parameters={}\n",
            tool.name,
            tool.class.as_str(),
            tool.description,
            tool.parameters
        ));
    }

    prompt.push_str(&format!("\nSTEPS REMAINING: {remaining_steps}\n"));
    if window.is_empty() {
        prompt.push_str("\nHISTORY: (none yet)\n");
    } else {
        prompt.push_str("\nRECENT HISTORY:\n");
        for step in window {
            prompt.push_str(&step.render());
            prompt.push('\n');
        }
    }
    prompt
}

/// Replays canned replies in order, then falls back to a fixed reply if set.
#[derive(Debug, Default)]
pub struct ScriptedPlanner {
    replies: Mutex<VecDeque<String>>,
    fallback: Option<String>,
    requests: Mutex<Vec<PlannerRequest>>,
}

impl ScriptedPlanner {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(reply.into());
        self
    }

    pub fn requests(&self) -> Vec<PlannerRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, request: &PlannerRequest) -> Result<String, PlannerError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        let next = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        next.or_else(|| self.fallback.clone())
            .ok_or_else(|| PlannerError::Unavailable("script exhausted".to_string()))
    }
}

/// Runs an external program per turn: the request goes to stdin as JSON and
/// the reply is read from stdout. No shell is involved.
#[derive(Clone, Debug)]
pub struct CommandPlanner {
    program: String,
    args: Vec<String>,
}

impl CommandPlanner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Planner for CommandPlanner {
    async fn plan(&self, request: &PlannerRequest) -> Result<String, PlannerError> {
        let payload = serde_json::to_vec(request)
            .map_err(|error| PlannerError::Unavailable(format!("encode request: {error}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| {
                PlannerError::Unavailable(format!("failed to start '{}': {error}", self.program))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A planner that ignores stdin may close it early.
            if let Err(error) = stdin.write_all(&payload).await {
                debug!(program = %self.program, %error, "planner closed stdin early");
            }
        }

        let output = child.wait_with_output().await.map_err(|error| {
            PlannerError::Unavailable(format!("failed to wait for '{}': {error}", self.program))
        })?;
        if !output.status.success() {
            return Err(PlannerError::Unavailable(format!(
                "'{}' exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
