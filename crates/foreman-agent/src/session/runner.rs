use super::{FailureCause, Session, SessionOutcome, SessionStatus};
use crate::{
    Action, AgentError, EventKind, ExecutionEnvironment, FailureKind, PlannerError, PlannerReply,
    PlannerRequest, QualityInput, QualityReport, StepEntry, StepOutcome, delay_for_attempt_ms,
    parse_planner_output, render_prompt,
};
use std::time::Duration;
use tracing::{Instrument, debug, info, info_span, warn};

impl Session {
    /// Drives the loop until the session reaches a terminal status.
    ///
    /// Only lifecycle misuse (running a session twice) is returned as an
    /// error. Every other failure ends up either as a step in the transcript
    /// or as an explicit terminal status on the outcome.
    pub async fn run(&mut self) -> Result<SessionOutcome, AgentError> {
        let span = info_span!(
            "session",
            session_id = %self.id,
            depth = self.depth,
            parent_id = self.parent_id.as_deref().unwrap_or("")
        );
        self.run_loop().instrument(span).await
    }

    async fn run_loop(&mut self) -> Result<SessionOutcome, AgentError> {
        self.transition_to(SessionStatus::Running)?;
        info!(goal = %self.goal, max_steps = self.config.max_steps, "session started");
        self.emit(
            self.event(EventKind::SessionStart)
                .with("goal", self.goal.clone())
                .with("max_steps", self.config.max_steps),
        );

        loop {
            if let Some(reason) = self.abort.reason() {
                self.cancel(reason).await?;
                break;
            }
            if self.transcript.len() >= self.config.max_steps {
                info!(steps = self.transcript.len(), "step budget exhausted");
                self.transition_to(SessionStatus::MaxSteps)?;
                break;
            }
            if self.gate.reflection_due(&self.transcript) {
                self.reflect();
                continue;
            }

            let request = self.planner_request();
            self.emit(
                self.event(EventKind::PlannerRequest)
                    .with("step_index", request.step_index),
            );
            let reply = tokio::select! {
                biased;
                _ = self.abort.aborted() => continue,
                reply = self.call_planner(&request) => reply,
            };
            let raw = match reply {
                Ok(raw) => raw,
                Err(error) => {
                    warn!(%error, "planner unavailable, failing session");
                    self.fail(FailureCause::PlannerUnavailable {
                        message: error.to_string(),
                    })?;
                    break;
                }
            };

            match parse_planner_output(&raw) {
                Err(error) => {
                    self.parse_error_streak += 1;
                    warn!(streak = self.parse_error_streak, reason = %error.reason, "unparseable planner reply");
                    self.append(
                        StepEntry::Malformed { raw: error.raw.clone() },
                        StepOutcome::failure(FailureKind::Parse, error.to_string()),
                    );
                    if self.parse_error_streak >= self.config.max_parse_errors {
                        self.fail(FailureCause::PlannerDiverged {
                            consecutive_parse_errors: self.parse_error_streak,
                        })?;
                        break;
                    }
                }
                Ok(PlannerReply::Complete { result }) => {
                    self.parse_error_streak = 0;
                    if self.propose_completion(result)? {
                        break;
                    }
                }
                Ok(PlannerReply::Action(action)) => {
                    self.parse_error_streak = 0;
                    self.dispatch(action).await;
                }
            }
        }

        let outcome = self.outcome();
        info!(status = %outcome.status, steps = outcome.steps, "session finished");
        self.emit(
            self.event(EventKind::SessionEnd)
                .with("status", outcome.status.as_str())
                .with("steps", outcome.steps),
        );
        Ok(outcome)
    }

    fn planner_request(&self) -> PlannerRequest {
        let window = self
            .transcript
            .window(self.config.context_window_steps)
            .to_vec();
        let tools = self.registry.definitions();
        let remaining_steps = self.config.max_steps.saturating_sub(self.transcript.len());
        let prompt = render_prompt(&self.goal, &window, &tools, remaining_steps);
        PlannerRequest {
            session_id: self.id.clone(),
            goal: self.goal.clone(),
            step_index: self.transcript.len() + 1,
            remaining_steps,
            window,
            tools,
            prompt,
        }
    }

    /// One planner call bounded by a timeout, retried with backoff.
    async fn call_planner(&self, request: &PlannerRequest) -> Result<String, PlannerError> {
        let timeout = Duration::from_millis(self.config.planner_timeout_ms);
        let attempts = self.config.planner_max_attempts;
        let mut last_error = PlannerError::Unavailable("planner was never called".to_string());

        for attempt in 1..=attempts {
            match tokio::time::timeout(timeout, self.planner.plan(request)).await {
                Ok(Ok(raw)) => return Ok(raw),
                Ok(Err(error)) => last_error = error,
                Err(_) => {
                    last_error = PlannerError::Timeout {
                        timeout_ms: self.config.planner_timeout_ms,
                    }
                }
            }
            if attempt < attempts {
                let delay = delay_for_attempt_ms(
                    attempt,
                    &self.config.planner_backoff,
                    self.jitter_seed ^ request.step_index as u64,
                );
                debug!(attempt, delay_ms = delay, error = %last_error, "retrying planner");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }

        Err(PlannerError::Exhausted {
            attempts,
            last_error: last_error.to_string(),
        })
    }

    async fn dispatch(&mut self, action: Action) {
        let class = self.registry.class_of(&action.name);
        self.emit(
            self.event(EventKind::ToolCallStart)
                .with("tool", action.name.clone())
                .with("arguments", action.arguments_value()),
        );

        let context = self.tool_context();
        let result = tokio::select! {
            biased;
            _ = self.abort.aborted() => None,
            result = self.registry.dispatch(&action, context, &self.config) => Some(result),
        };
        // Aborted mid-call: the loop head records the cancellation.
        let Some(result) = result else {
            return;
        };

        let outcome = match result {
            Ok(content) => StepOutcome::Output { content },
            Err(error) => {
                debug!(tool = %action.name, %error, "tool call failed");
                StepOutcome::from(error)
            }
        };
        self.emit(
            self.event(EventKind::ToolCallEnd)
                .with("tool", action.name.clone())
                .with("success", !outcome.is_failure()),
        );
        self.append(StepEntry::ToolCall { action, class }, outcome);
    }

    /// Runs the gate on a completion proposal. Returns whether the session is done.
    pub(super) fn propose_completion(&mut self, result: String) -> Result<bool, AgentError> {
        if !self.gate.enabled() {
            self.append(
                StepEntry::Completion {
                    result: result.clone(),
                },
                StepOutcome::Output {
                    content: "completion accepted (quality gating disabled)".to_string(),
                },
            );
            self.finish(result)?;
            return Ok(true);
        }

        let report = self.assess(Some(&result));
        self.latest_report = Some(report.clone());
        self.emit(
            self.event(EventKind::QualityCheck)
                .with("score", report.score)
                .with("pass", report.pass),
        );

        if report.pass {
            self.append(
                StepEntry::Completion {
                    result: result.clone(),
                },
                StepOutcome::Output {
                    content: format!("completion accepted: {}", report.render()),
                },
            );
            self.emit(
                self.event(EventKind::CompletionAccepted)
                    .with("score", report.score),
            );
            self.finish(result)?;
            return Ok(true);
        }

        info!(score = report.score, threshold = self.gate.threshold(), "completion rejected");
        self.append(
            StepEntry::Completion { result },
            StepOutcome::Failure {
                kind: FailureKind::QualityGateRejection,
                message: format!(
                    "completion rejected: score {} is below the threshold of {}; keep working",
                    report.score,
                    self.gate.threshold()
                ),
                output: Some(report.render()),
            },
        );
        self.emit(
            self.event(EventKind::CompletionRejected)
                .with("score", report.score)
                .with("issues", report.issues.clone()),
        );
        Ok(false)
    }

    fn reflect(&mut self) {
        let report = self.assess(None);
        debug!(score = report.score, "periodic self-check");
        self.emit(
            self.event(EventKind::QualityCheck)
                .with("score", report.score)
                .with("periodic", true),
        );
        self.append(
            StepEntry::QualityCheck,
            StepOutcome::Observation {
                content: format!("Self-check: {}", report.render()),
            },
        );
        self.latest_report = Some(report);
    }

    fn assess(&self, proposed_result: Option<&str>) -> QualityReport {
        let tasks = self.ledger.owned_by(&self.id);
        self.gate.evaluate(&QualityInput {
            goal: &self.goal,
            transcript: &self.transcript,
            tasks: &tasks,
            proposed_result,
            window: self.config.context_window_steps,
        })
    }

    fn append(&mut self, entry: StepEntry, outcome: StepOutcome) {
        let failure = outcome.failure_kind();
        let index = self.transcript.append(entry, outcome);
        let mut event = self.event(EventKind::StepAppended).with("index", index);
        if let Some(kind) = failure {
            event = event.with("failure", kind.as_str());
        }
        self.emit(event);
    }

    fn finish(&mut self, result: String) -> Result<(), AgentError> {
        self.transition_to(SessionStatus::Done)?;
        self.result = Some(result);
        Ok(())
    }

    pub(super) fn fail(&mut self, cause: FailureCause) -> Result<(), AgentError> {
        self.transition_to(SessionStatus::Failed)?;
        self.emit(
            self.event(EventKind::Error)
                .with("cause", cause.to_string()),
        );
        self.failure = Some(cause);
        Ok(())
    }

    async fn cancel(&mut self, reason: String) -> Result<(), AgentError> {
        let killed = self.sandbox.terminate_all_commands().await;
        warn!(%reason, killed_process_groups = killed, "session cancelled");
        self.fail(FailureCause::Cancelled { reason })
    }
}
