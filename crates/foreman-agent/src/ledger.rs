use crate::ToolError;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!(
                "invalid priority '{other}', expected one of low, medium, high"
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Completed => 2,
        }
    }

    /// Status only ever moves forward; repeating the current status is rejected.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            other => Err(format!(
                "invalid status '{other}', expected one of pending, in_progress, completed"
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub description: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub created_at: String,
    /// Session that created the task.
    pub owner: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("task {0} not found")]
    NotFound(u64),
    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: u64,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("task description must not be empty")]
    EmptyDescription,
}

impl From<LedgerError> for ToolError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::NotFound(_) => ToolError::NotFound(error.to_string()),
            LedgerError::InvalidTransition { .. } | LedgerError::EmptyDescription => {
                ToolError::Validation(error.to_string())
            }
        }
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    tasks: Vec<Task>,
    last_id: u64,
}

/// Shared work-item store. All mutations go through one lock so id
/// assignment and status transitions are atomic across concurrent sessions.
#[derive(Debug, Default)]
pub struct TaskLedger {
    state: Mutex<LedgerState>,
}

impl TaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(
        &self,
        description: &str,
        priority: TaskPriority,
        owner: Option<&str>,
    ) -> Result<Task, LedgerError> {
        let description = description.trim();
        if description.is_empty() {
            return Err(LedgerError::EmptyDescription);
        }

        let mut state = self.lock();
        state.last_id += 1;
        let task = Task {
            id: state.last_id,
            description: description.to_string(),
            priority,
            status: TaskStatus::Pending,
            created_at: crate::current_timestamp(),
            owner: owner.map(str::to_string),
        };
        state.tasks.push(task.clone());
        Ok(task)
    }

    /// Snapshot in creation order.
    pub fn list(&self) -> Vec<Task> {
        self.lock().tasks.clone()
    }

    pub fn get(&self, id: u64) -> Option<Task> {
        self.lock().tasks.iter().find(|task| task.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn update(&self, id: u64, status: TaskStatus) -> Result<Task, LedgerError> {
        let mut state = self.lock();
        let task = state
            .tasks
            .iter_mut()
            .find(|task| task.id == id)
            .ok_or(LedgerError::NotFound(id))?;
        if !task.status.can_transition_to(status) {
            return Err(LedgerError::InvalidTransition {
                id,
                from: task.status,
                to: status,
            });
        }
        task.status = status;
        Ok(task.clone())
    }

    pub fn owned_by(&self, owner: &str) -> Vec<Task> {
        self.lock()
            .tasks
            .iter()
            .filter(|task| task.owner.as_deref() == Some(owner))
            .cloned()
            .collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
}

impl LedgerSummary {
    pub fn of(tasks: &[Task]) -> Self {
        let count = |status| tasks.iter().filter(|task| task.status == status).count();
        Self {
            total: tasks.len(),
            pending: count(TaskStatus::Pending),
            in_progress: count(TaskStatus::InProgress),
            completed: count(TaskStatus::Completed),
        }
    }
}
