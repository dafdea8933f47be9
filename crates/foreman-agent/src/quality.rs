use crate::{
    FailureKind, SessionConfig, StepEntry, Task, TaskStatus, ToolClass, Transcript,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityReport {
    pub score: u8,
    pub issues: Vec<String>,
    pub pass: bool,
}

impl QualityReport {
    pub fn new(assessment: Assessment, threshold: u8) -> Self {
        let score = assessment.score.min(100);
        Self {
            score,
            issues: assessment.issues,
            pass: score >= threshold,
        }
    }

    pub fn render(&self) -> String {
        let mut rendered = format!("quality score {}/100", self.score);
        if self.issues.is_empty() {
            rendered.push_str(", no issues found");
        } else {
            for issue in &self.issues {
                rendered.push_str("\n- ");
                rendered.push_str(issue);
            }
        }
        rendered
    }
}

/// Raw scorer output before the threshold is applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assessment {
    pub score: u8,
    pub issues: Vec<String>,
}

pub struct QualityInput<'a> {
    pub goal: &'a str,
    pub transcript: &'a Transcript,
    /// Ledger tasks created by the session under review.
    pub tasks: &'a [Task],
    /// Present when a completion is being proposed.
    pub proposed_result: Option<&'a str>,
    pub window: usize,
}

pub trait QualityScorer: Send + Sync {
    fn assess(&self, input: &QualityInput<'_>) -> Assessment;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    fn deduction(&self) -> u32 {
        match self {
            Self::Critical => 25,
            Self::High => 10,
            Self::Medium => 5,
            Self::Low => 2,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// Deducts from 100 per finding, weighted by severity.
#[derive(Clone, Debug, Default)]
pub struct HeuristicScorer;

impl QualityScorer for HeuristicScorer {
    fn assess(&self, input: &QualityInput<'_>) -> Assessment {
        let mut findings: Vec<(Severity, String)> = Vec::new();
        let steps = input.transcript.steps();

        let succeeded = |wanted: &dyn Fn(Option<ToolClass>) -> bool| {
            steps.iter().any(|step| {
                matches!(step.entry, StepEntry::ToolCall { .. })
                    && !step.outcome.is_failure()
                    && wanted(step.tool_class())
            })
        };
        if !succeeded(&|_| true) {
            findings.push((
                Severity::Critical,
                "no tool call has succeeded yet; nothing was inspected or produced".to_string(),
            ));
        } else if !succeeded(&|class| class.is_some_and(|class| class.has_side_effects())) {
            findings.push((
                Severity::High,
                "no mutating or execution step has succeeded; no artifact was produced".to_string(),
            ));
        }

        let last_execution = steps
            .iter()
            .rev()
            .find(|step| step.tool_class() == Some(ToolClass::Execution));
        if let Some(step) = last_execution {
            if step.outcome.is_failure() {
                findings.push((
                    Severity::Critical,
                    format!("the most recent command (step {}) failed", step.index),
                ));
            }
        }

        for task in input.tasks.iter().filter(|task| task.status != TaskStatus::Completed) {
            findings.push((
                Severity::High,
                format!(
                    "task {} '{}' is still {}",
                    task.id, task.description, task.status
                ),
            ));
        }

        for step in input.transcript.window(input.window) {
            match step.outcome.failure_kind() {
                None | Some(FailureKind::QualityGateRejection) => {}
                Some(kind) => findings.push((
                    Severity::Medium,
                    format!("step {} ended with {kind}", step.index),
                )),
            }
        }

        if let Some(result) = input.proposed_result {
            let result = result.trim();
            if result.is_empty() || result == "Task completed." {
                findings.push((
                    Severity::Low,
                    "completion summary does not describe what was done".to_string(),
                ));
            }
        }

        findings.sort_by_key(|(severity, _)| *severity);
        let deducted: u32 = findings.iter().map(|(severity, _)| severity.deduction()).sum();
        Assessment {
            score: 100_u32.saturating_sub(deducted) as u8,
            issues: findings
                .into_iter()
                .map(|(severity, issue)| format!("[{}] {issue}", severity.label()))
                .collect(),
        }
    }
}

/// Returns the same assessment every time.
#[derive(Clone, Debug)]
pub struct FixedScorer {
    score: u8,
    issues: Vec<String>,
}

impl FixedScorer {
    pub fn new(score: u8, issues: Vec<String>) -> Self {
        Self { score, issues }
    }
}

impl QualityScorer for FixedScorer {
    fn assess(&self, _input: &QualityInput<'_>) -> Assessment {
        Assessment {
            score: self.score,
            issues: self.issues.clone(),
        }
    }
}

/// Applies a scorer at completion time and on the periodic self-check.
#[derive(Clone)]
pub struct QualityGate {
    scorer: Arc<dyn QualityScorer>,
    threshold: u8,
    interval: usize,
    enabled: bool,
}

impl QualityGate {
    pub fn new(scorer: Arc<dyn QualityScorer>, config: &SessionConfig) -> Self {
        Self {
            scorer,
            threshold: config.quality_threshold,
            interval: config.reflection_interval,
            enabled: config.quality_gating,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn evaluate(&self, input: &QualityInput<'_>) -> QualityReport {
        QualityReport::new(self.scorer.assess(input), self.threshold)
    }

    /// True when the last `interval` steps contain no self-check.
    pub fn reflection_due(&self, transcript: &Transcript) -> bool {
        if self.interval == 0 || transcript.len() < self.interval {
            return false;
        }
        !transcript
            .window(self.interval)
            .iter()
            .any(|step| matches!(step.entry, StepEntry::QualityCheck))
    }
}
