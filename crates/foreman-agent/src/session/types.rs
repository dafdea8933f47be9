use crate::{CommandPolicy, QualityReport, SessionConfig, Transcript};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Init,
    Running,
    Done,
    Failed,
    MaxSteps,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::MaxSteps => "MAX_STEPS",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::MaxSteps)
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        match self {
            Self::Init => matches!(next, Self::Running | Self::Failed),
            Self::Running => next.is_terminal(),
            Self::Done | Self::Failed | Self::MaxSteps => false,
        }
    }
}

impl Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended `FAILED`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum FailureCause {
    PlannerDiverged { consecutive_parse_errors: usize },
    PlannerUnavailable { message: String },
    Cancelled { reason: String },
}

impl Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlannerDiverged {
                consecutive_parse_errors,
            } => write!(
                f,
                "planner diverged after {consecutive_parse_errors} consecutive unparseable replies"
            ),
            Self::PlannerUnavailable { message } => write!(f, "planner unavailable: {message}"),
            Self::Cancelled { reason } => write!(f, "cancelled: {reason}"),
        }
    }
}

/// Pass-by-value description of a session to start.
///
/// A session owns everything it is built from; specialists get their own
/// copy rather than a view into the parent.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSpec {
    pub goal: String,
    pub sandbox_root: PathBuf,
    pub config: SessionConfig,
    pub policy: CommandPolicy,
    pub parent_id: Option<String>,
    pub depth: usize,
}

impl SessionSpec {
    pub fn new(goal: impl Into<String>, sandbox_root: impl Into<PathBuf>) -> Self {
        Self {
            goal: goal.into(),
            sandbox_root: sandbox_root.into(),
            config: SessionConfig::default(),
            policy: CommandPolicy::default(),
            parent_id: None,
            depth: 0,
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_step_budget(mut self, max_steps: usize) -> Self {
        self.config.max_steps = max_steps;
        self
    }

    pub fn with_allowed_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.allowed_tools = Some(tools.into_iter().map(Into::into).collect::<BTreeSet<_>>());
        self
    }

    pub fn with_policy(mut self, policy: CommandPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>, depth: usize) -> Self {
        self.parent_id = Some(parent_id.into());
        self.depth = depth;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionOutcome {
    pub session_id: String,
    pub goal: String,
    pub status: SessionStatus,
    pub result: Option<String>,
    pub failure: Option<FailureCause>,
    pub steps: usize,
    pub quality: Option<QualityReport>,
    pub transcript: Transcript,
}

impl SessionOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == SessionStatus::Done
    }

    /// One-line description of how the session ended.
    pub fn summary(&self) -> String {
        match (self.status, &self.result, &self.failure) {
            (SessionStatus::Done, Some(result), _) => result.clone(),
            (SessionStatus::Failed, _, Some(cause)) => cause.to_string(),
            (SessionStatus::MaxSteps, _, _) => {
                format!("step budget of {} exhausted without completion", self.steps)
            }
            (status, _, _) => status.to_string(),
        }
    }
}
