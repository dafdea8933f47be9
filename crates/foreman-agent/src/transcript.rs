use crate::{Action, FailureKind, ToolClass, ToolError};
use serde::{Deserialize, Serialize};

/// What the session did on one turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepEntry {
    ToolCall { action: Action, class: Option<ToolClass> },
    Malformed { raw: String },
    Completion { result: String },
    QualityCheck,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepOutcome {
    Output {
        content: String,
    },
    Failure {
        kind: FailureKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    Observation {
        content: String,
    },
}

impl StepOutcome {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
            output: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Failure { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Text the planner sees for this outcome.
    pub fn render(&self) -> String {
        match self {
            Self::Output { content } | Self::Observation { content } => content.clone(),
            Self::Failure {
                kind,
                message,
                output,
            } => match output {
                Some(output) => format!("[{kind}] {message}\n{output}"),
                None => format!("[{kind}] {message}"),
            },
        }
    }
}

impl From<ToolError> for StepOutcome {
    fn from(error: ToolError) -> Self {
        Self::Failure {
            kind: error.kind(),
            message: error.to_string(),
            output: error.captured_output(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub entry: StepEntry,
    pub outcome: StepOutcome,
    pub timestamp: String,
}

impl Step {
    pub fn tool_class(&self) -> Option<ToolClass> {
        match &self.entry {
            StepEntry::ToolCall { class, .. } => *class,
            _ => None,
        }
    }

    pub fn render(&self) -> String {
        let header = match &self.entry {
            StepEntry::ToolCall { action, .. } => format!(
                "#{} {} {}",
                self.index,
                action.name,
                action.arguments_value()
            ),
            StepEntry::Malformed { .. } => format!("#{} (unparseable planner reply)", self.index),
            StepEntry::Completion { result } => format!("#{} DONE {}", self.index, result),
            StepEntry::QualityCheck => format!("#{} quality check", self.index),
        };
        format!("{header}\n{}", self.outcome.render())
    }
}

/// Append-only, totally ordered history of one session.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Transcript {
    steps: Vec<Step>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step and returns its 1-based index.
    pub fn append(&mut self, entry: StepEntry, outcome: StepOutcome) -> usize {
        let index = self.steps.len() + 1;
        self.steps.push(Step {
            index,
            entry,
            outcome,
            timestamp: crate::current_timestamp(),
        });
        index
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn last(&self) -> Option<&Step> {
        self.steps.last()
    }

    /// The trailing `size` steps, oldest first.
    pub fn window(&self, size: usize) -> &[Step] {
        &self.steps[self.steps.len().saturating_sub(size)..]
    }
}
