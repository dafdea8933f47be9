use crate::{
    AgentError, CommandPolicy, CoordinatorConfig, EventEmitter, EventKind, ExecutionEnvironment,
    HeuristicScorer, LocalSandbox, NoopEventEmitter, Planner, QualityScorer, Session, SessionAbortHandle,
    SessionConfig, SessionEvent, SessionOutcome, SessionServices, SessionSpec, SessionStatus,
    TaskLedger, ToolRegistry,
};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{Instrument, info, info_span, warn};

/// One unit of a decomposed goal, produced outside this crate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialistAssignment {
    pub focus: String,
    pub instructions: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub step_budget: Option<usize>,
}

impl SpecialistAssignment {
    pub fn new(focus: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            focus: focus.into(),
            instructions: instructions.into(),
            context: None,
            step_budget: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_step_budget(mut self, steps: usize) -> Self {
        self.step_budget = Some(steps);
        self
    }

    fn goal(&self) -> String {
        let mut goal = format!(
            "You are the {} specialist.\n{}",
            self.focus.trim(),
            self.instructions.trim()
        );
        if let Some(context) = self.context.as_deref().filter(|text| !text.trim().is_empty()) {
            goal.push_str("\n\nContext:\n");
            goal.push_str(context.trim());
        }
        goal
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    Complete,
    Partial,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SpecialistRecord {
    pub index: usize,
    pub focus: String,
    pub session_id: Option<String>,
    pub status: SessionStatus,
    pub output: Option<String>,
    pub failure: Option<String>,
    pub steps: usize,
    pub workspace: PathBuf,
}

impl SpecialistRecord {
    fn from_outcome(index: usize, focus: &str, workspace: PathBuf, outcome: &SessionOutcome) -> Self {
        let succeeded = outcome.succeeded();
        Self {
            index,
            focus: focus.to_string(),
            session_id: Some(outcome.session_id.clone()),
            status: outcome.status,
            output: outcome.result.clone().filter(|_| succeeded),
            failure: (!succeeded).then(|| outcome.summary()),
            steps: outcome.steps,
            workspace,
        }
    }

    fn failed(index: usize, focus: &str, workspace: PathBuf, message: String) -> Self {
        Self {
            index,
            focus: focus.to_string(),
            session_id: None,
            status: SessionStatus::Failed,
            output: None,
            failure: Some(message),
            steps: 0,
            workspace,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == SessionStatus::Done
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IntegrationReport {
    pub status: IntegrationStatus,
    pub succeeded: Vec<SpecialistRecord>,
    pub failed: Vec<SpecialistRecord>,
    /// Combined output of the successful specialists only.
    pub integrated_output: String,
}

impl IntegrationReport {
    fn integrate(records: Vec<SpecialistRecord>) -> Self {
        let (succeeded, failed): (Vec<_>, Vec<_>) =
            records.into_iter().partition(SpecialistRecord::succeeded);
        let status = if failed.is_empty() {
            IntegrationStatus::Complete
        } else {
            IntegrationStatus::Partial
        };

        let mut integrated_output = succeeded
            .iter()
            .map(|record| {
                format!(
                    "## {}\n{}",
                    record.focus,
                    record.output.as_deref().unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        if !failed.is_empty() {
            let names: Vec<&str> = failed.iter().map(|record| record.focus.as_str()).collect();
            if !integrated_output.is_empty() {
                integrated_output.push_str("\n\n");
            }
            integrated_output.push_str(&format!("Not integrated (failed): {}", names.join(", ")));
        }

        Self {
            status,
            succeeded,
            failed,
            integrated_output,
        }
    }
}

/// Who is asking for a fan-out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DelegationRequest {
    pub parent_session_id: String,
    pub parent_step_budget: usize,
    pub workspace_root: PathBuf,
    pub assignments: Vec<SpecialistAssignment>,
}

/// Lets a running session act as a coordinator for its own specialists.
#[async_trait]
pub trait Delegator: Send + Sync {
    async fn delegate(&self, request: DelegationRequest) -> Result<IntegrationReport, AgentError>;
}

/// Runs specialist sessions with bounded parallelism and isolates their failures.
#[derive(Clone)]
pub struct Coordinator {
    planner: Arc<dyn Planner>,
    registry: Arc<ToolRegistry>,
    ledger: Arc<TaskLedger>,
    scorer: Arc<dyn QualityScorer>,
    emitter: Arc<dyn EventEmitter>,
    session_config: SessionConfig,
    policy: CommandPolicy,
    config: CoordinatorConfig,
    /// Depth of the sessions that call into this coordinator.
    depth: usize,
}

impl Coordinator {
    pub fn new(
        planner: Arc<dyn Planner>,
        registry: Arc<ToolRegistry>,
        ledger: Arc<TaskLedger>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            planner,
            registry,
            ledger,
            scorer: Arc::new(HeuristicScorer),
            emitter: Arc::new(NoopEventEmitter),
            session_config: SessionConfig::default(),
            policy: CommandPolicy::default(),
            config,
            depth: 0,
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

    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    pub fn with_policy(mut self, policy: CommandPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn ledger(&self) -> &Arc<TaskLedger> {
        &self.ledger
    }

    /// Top-level fan-out. Each specialist works in its own subdirectory of
    /// `workspace_root`.
    pub async fn run(
        &self,
        assignments: Vec<SpecialistAssignment>,
        workspace_root: &Path,
    ) -> Result<IntegrationReport, AgentError> {
        self.run_for(None, self.session_config.max_steps, assignments, workspace_root)
            .await
    }

    async fn run_for(
        &self,
        parent_id: Option<&str>,
        parent_budget: usize,
        assignments: Vec<SpecialistAssignment>,
        workspace_root: &Path,
    ) -> Result<IntegrationReport, AgentError> {
        self.config.validate()?;
        let depth = self.depth + 1;
        if depth > self.config.max_depth {
            return Err(AgentError::DepthExceeded {
                depth,
                max_depth: self.config.max_depth,
            });
        }
        if assignments.is_empty() {
            return Err(AgentError::InvalidConfiguration(
                "at least one specialist assignment is required".to_string(),
            ));
        }
        let budgets = assignments
            .iter()
            .map(|assignment| {
                self.config
                    .specialist_budget(assignment.step_budget, parent_budget)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let workspace = LocalSandbox::new(workspace_root, self.policy.clone())?;
        let event_source = parent_id.unwrap_or("coordinator").to_string();
        let span = info_span!("coordinator", depth, specialists = assignments.len());
        async move {
            info!(max_parallel = self.config.max_parallel, "starting specialists");
            let semaphore = Arc::new(Semaphore::new(self.config.max_parallel));
            let mut join_set = JoinSet::new();
            let mut records: Vec<Option<SpecialistRecord>> = vec![None; assignments.len()];
            let mut workspaces: Vec<PathBuf> = Vec::with_capacity(assignments.len());
            let mut aborts: Vec<SessionAbortHandle> = Vec::new();

            for (index, assignment) in assignments.iter().enumerate() {
                let dir_name = format!("{:02}-{}", index + 1, slug(&assignment.focus));
                let root = workspace.root().join(&dir_name);
                workspaces.push(root.clone());

                let session = workspace.child(&dir_name).and_then(|child| {
                    self.build_specialist(assignment, child.root(), parent_id, budgets[index], depth)
                });
                let session = match session {
                    Ok(session) => session,
                    Err(error) => {
                        warn!(focus = %assignment.focus, %error, "specialist could not start");
                        records[index] = Some(SpecialistRecord::failed(
                            index,
                            &assignment.focus,
                            root,
                            error.to_string(),
                        ));
                        continue;
                    }
                };
                aborts.push(session.abort_handle());
                self.emit(
                    SessionEvent::new(EventKind::SpecialistStart, event_source.clone())
                        .with("focus", assignment.focus.clone())
                        .with("specialist_session_id", session.id().to_string()),
                );
                join_set.spawn(run_specialist(
                    index,
                    session,
                    semaphore.clone(),
                    self.config.specialist_timeout_ms,
                ));
            }

            let deadline = self
                .config
                .deadline_ms
                .map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));
            let mut deadline_passed = false;
            loop {
                let joined = match deadline.filter(|_| !deadline_passed) {
                    Some(at) => tokio::select! {
                        joined = join_set.join_next() => joined,
                        _ = tokio::time::sleep_until(at) => {
                            warn!("coordinator deadline reached, cancelling remaining specialists");
                            deadline_passed = true;
                            for abort in &aborts {
                                abort.request_abort("coordinator deadline reached");
                            }
                            continue;
                        }
                    },
                    None => join_set.join_next().await,
                };
                let Some(joined) = joined else {
                    break;
                };

                let (index, result) = match joined {
                    Ok(finished) => finished,
                    Err(error) => {
                        warn!(%error, "specialist task ended abnormally");
                        continue;
                    }
                };
                let assignment = &assignments[index];
                let record = match result {
                    Ok(outcome) => SpecialistRecord::from_outcome(
                        index,
                        &assignment.focus,
                        workspaces[index].clone(),
                        &outcome,
                    ),
                    Err(message) => SpecialistRecord::failed(
                        index,
                        &assignment.focus,
                        workspaces[index].clone(),
                        message,
                    ),
                };
                info!(focus = %record.focus, status = %record.status, "specialist finished");
                self.emit(
                    SessionEvent::new(EventKind::SpecialistEnd, event_source.clone())
                        .with("focus", record.focus.clone())
                        .with("status", record.status.as_str()),
                );
                records[index] = Some(record);
            }

            let records: Vec<SpecialistRecord> = records
                .into_iter()
                .enumerate()
                .map(|(index, record)| {
                    record.unwrap_or_else(|| {
                        SpecialistRecord::failed(
                            index,
                            &assignments[index].focus,
                            workspaces[index].clone(),
                            "specialist task ended without reporting an outcome".to_string(),
                        )
                    })
                })
                .collect();
            let report = IntegrationReport::integrate(records);
            info!(
                status = ?report.status,
                succeeded = report.succeeded.len(),
                failed = report.failed.len(),
                "specialists integrated"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    fn build_specialist(
        &self,
        assignment: &SpecialistAssignment,
        root: &Path,
        parent_id: Option<&str>,
        budget: usize,
        depth: usize,
    ) -> Result<Session, AgentError> {
        let mut spec = SessionSpec::new(assignment.goal(), root)
            .with_config(self.session_config.clone())
            .with_step_budget(budget)
            .with_policy(self.policy.clone());
        spec.depth = depth;
        spec.parent_id = parent_id.map(str::to_string);

        let services = SessionServices::new(
            self.planner.clone(),
            self.registry.clone(),
            self.ledger.clone(),
        )
        .with_scorer(self.scorer.clone())
        .with_emitter(self.emitter.clone())
        .with_delegator(Arc::new(self.clone().with_depth(depth)));
        Session::new(spec, services)
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(error) = self.emitter.emit(event) {
            warn!(%error, "dropping coordinator event");
        }
    }
}

#[async_trait]
impl Delegator for Coordinator {
    async fn delegate(&self, request: DelegationRequest) -> Result<IntegrationReport, AgentError> {
        self.run_for(
            Some(&request.parent_session_id),
            request.parent_step_budget,
            request.assignments,
            &request.workspace_root,
        )
        .await
    }
}

type SpecialistResult = (usize, Result<SessionOutcome, String>);

async fn run_specialist(
    index: usize,
    mut session: Session,
    semaphore: Arc<Semaphore>,
    timeout_ms: Option<u64>,
) -> SpecialistResult {
    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return (index, Err("coordinator shut down".to_string())),
    };

    // Timer starts once the specialist actually holds a slot.
    let watchdog = timeout_ms.map(|ms| {
        let abort = session.abort_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            abort.request_abort(format!("specialist timed out after {ms} ms"));
        })
    });

    let result = AssertUnwindSafe(session.run()).catch_unwind().await;
    if let Some(watchdog) = watchdog {
        watchdog.abort();
    }

    let result = match result {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(error)) => Err(error.to_string()),
        Err(_) => Err("specialist panicked".to_string()),
    };
    (index, result)
}

fn slug(focus: &str) -> String {
    let slug: String = focus
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '-' })
        .collect();
    let slug = slug
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "specialist".to_string()
    } else {
        slug
    }
}
