mod runner;
mod types;


pub use types::*;

use crate::{
    AgentError, Delegator, EventEmitter, EventKind, ExecutionEnvironment, HeuristicScorer,
    LocalSandbox, NoopEventEmitter, Planner, QualityGate, QualityReport, QualityScorer,
    SessionConfig, SessionError, SessionEvent, TaskLedger, ToolContext, ToolRegistry, Transcript,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tracing::warn;

/// Shared collaborators a session is wired to.
#[derive(Clone)]
pub struct SessionServices {
    pub planner: Arc<dyn Planner>,
    pub registry: Arc<ToolRegistry>,
    pub ledger: Arc<TaskLedger>,
    pub scorer: Arc<dyn QualityScorer>,
    pub emitter: Arc<dyn EventEmitter>,
    pub delegator: Option<Arc<dyn Delegator>>,
}

impl SessionServices {
    pub fn new(planner: Arc<dyn Planner>, registry: Arc<ToolRegistry>, ledger: Arc<TaskLedger>) -> Self {
        Self {
            planner,
            registry,
            ledger,
            scorer: Arc::new(HeuristicScorer),
            emitter: Arc::new(NoopEventEmitter),
            delegator: None,
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn QualityScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn with_delegator(mut self, delegator: Arc<dyn Delegator>) -> Self {
        self.delegator = Some(delegator);
        self
    }
}

/// Cancels a running session from outside. Cloning shares the signal.
#[derive(Clone, Debug, Default)]
pub struct SessionAbortHandle {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
    reason: Arc<Mutex<Option<String>>>,
}

impl SessionAbortHandle {
    /// The first reason wins; later requests only re-notify.
    pub fn request_abort(&self, reason: impl Into<String>) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        if !self.is_requested() {
            return None;
        }
        let reason = self
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Some(reason.unwrap_or_else(|| "abort requested".to_string()))
    }

    /// Resolves once an abort has been requested.
    pub async fn aborted(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent request is not missed.
        notified.as_mut().enable();
        if self.is_requested() {
            return;
        }
        notified.await;
    }
}

/// One run of the orchestrator loop.
pub struct Session {
    id: String,
    goal: String,
    config: SessionConfig,
    status: SessionStatus,
    transcript: Transcript,
    parent_id: Option<String>,
    depth: usize,
    planner: Arc<dyn Planner>,
    registry: ToolRegistry,
    sandbox: Arc<LocalSandbox>,
    ledger: Arc<TaskLedger>,
    gate: QualityGate,
    emitter: Arc<dyn EventEmitter>,
    delegator: Option<Arc<dyn Delegator>>,
    abort: SessionAbortHandle,
    parse_error_streak: usize,
    latest_report: Option<QualityReport>,
    result: Option<String>,
    failure: Option<FailureCause>,
    jitter_seed: u64,
}

impl Session {
    pub fn new(spec: SessionSpec, services: SessionServices) -> Result<Self, AgentError> {
        let SessionSpec {
            goal,
            sandbox_root,
            config,
            policy,
            parent_id,
            depth,
        } = spec;
        config.validate()?;
        if goal.trim().is_empty() {
            return Err(AgentError::InvalidConfiguration(
                "session goal must not be empty".to_string(),
            ));
        }

        let sandbox = LocalSandbox::new(&sandbox_root, policy)?
            .with_output_limit(config.command_output_limit_bytes);
        let registry = match &config.allowed_tools {
            Some(allowed) => services.registry.restricted(allowed),
            None => services.registry.as_ref().clone(),
        };
        let id = uuid::Uuid::new_v4();

        Ok(Self {
            id: id.to_string(),
            goal,
            gate: QualityGate::new(services.scorer, &config),
            config,
            status: SessionStatus::Init,
            transcript: Transcript::new(),
            parent_id,
            depth,
            planner: services.planner,
            registry,
            sandbox: Arc::new(sandbox),
            ledger: services.ledger,
            emitter: services.emitter,
            delegator: services.delegator,
            abort: SessionAbortHandle::default(),
            parse_error_streak: 0,
            latest_report: None,
            result: None,
            failure: None,
            jitter_seed: id.as_u64_pair().0,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn sandbox(&self) -> &LocalSandbox {
        &self.sandbox
    }

    pub fn latest_quality_report(&self) -> Option<&QualityReport> {
        self.latest_report.as_ref()
    }

    pub fn abort_handle(&self) -> SessionAbortHandle {
        self.abort.clone()
    }

    pub fn outcome(&self) -> SessionOutcome {
        SessionOutcome {
            session_id: self.id.clone(),
            goal: self.goal.clone(),
            status: self.status,
            result: self.result.clone(),
            failure: self.failure.clone(),
            steps: self.transcript.len(),
            quality: self.latest_report.clone(),
            transcript: self.transcript.clone(),
        }
    }

    pub(crate) fn transition_to(&mut self, next: SessionStatus) -> Result<(), AgentError> {
        if !self.status.can_transition_to(next) {
            if self.status.is_terminal() {
                return Err(SessionError::AlreadyFinished(self.id.clone()).into());
            }
            return Err(SessionError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            }
            .into());
        }
        self.status = next;
        Ok(())
    }

    fn tool_context(&self) -> ToolContext {
        ToolContext {
            session_id: self.id.clone(),
            step_budget: self.config.max_steps,
            sandbox: self.sandbox.clone() as Arc<dyn ExecutionEnvironment>,
            ledger: self.ledger.clone(),
            delegator: self.delegator.clone(),
        }
    }

    // Event delivery is best-effort; a broken sink must not end the session.
    fn emit(&self, event: SessionEvent) {
        if let Err(error) = self.emitter.emit(event) {
            warn!(session_id = %self.id, %error, "dropping session event");
        }
    }

    fn event(&self, kind: EventKind) -> SessionEvent {
        SessionEvent::new(kind, self.id.clone())
    }
}
