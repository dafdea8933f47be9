mod support;

use foreman_agent::{
    AllowedCommand, BufferedEventEmitter, CommandPolicy, Coordinator, CoordinatorConfig,
    EventKind, ExecutionEnvironment, FixedScorer, IntegrationStatus, Session, SessionSpec,
    SessionStatus, SpecialistAssignment, TaskLedger, ToolRegistry,
};
use serde_json::json;
use std::sync::Arc;
use support::{RoutingPlanner, action, done, permissive_services};
use tempfile::tempdir;

fn coordinator(planner: RoutingPlanner, config: CoordinatorConfig) -> Coordinator {
    Coordinator::new(
        Arc::new(planner),
        Arc::new(ToolRegistry::with_builtin_tools()),
        Arc::new(TaskLedger::new()),
        config,
    )
    .with_scorer(Arc::new(FixedScorer::new(100, Vec::new())))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_timed_out_specialist_yields_partial_integration() {
    let dir = tempdir().expect("temp dir should be created");
    let planner = RoutingPlanner::default()
        .route(
            "api specialist",
            [
                action("write_file", json!({ "path": "routes.txt", "contents": "GET /todos\n" })),
                done("api routes written"),
            ],
        )
        .route(
            "db specialist",
            [
                action("write_file", json!({ "path": "schema.sql", "contents": "create table todos;\n" })),
                done("schema written"),
            ],
        )
        .stall("ui specialist");
    let emitter = Arc::new(BufferedEventEmitter::default());
    let config = CoordinatorConfig {
        specialist_timeout_ms: Some(300),
        ..CoordinatorConfig::default()
    };

    let report = coordinator(planner, config)
        .with_emitter(emitter.clone())
        .run(
            vec![
                SpecialistAssignment::new("api", "Write the routes."),
                SpecialistAssignment::new("db", "Write the schema."),
                SpecialistAssignment::new("ui", "Write the form."),
            ],
            dir.path(),
        )
        .await
        .expect("coordination should finish");

    assert_eq!(report.status, IntegrationStatus::Partial);
    assert_eq!(report.succeeded.len(), 2);
    assert_eq!(report.failed.len(), 1);
    let failed = &report.failed[0];
    assert_eq!(failed.focus, "ui");
    assert_eq!(failed.status, SessionStatus::Failed);
    assert!(
        failed
            .failure
            .as_deref()
            .is_some_and(|message| message.contains("timed out"))
    );
    assert!(report.integrated_output.contains("## api\napi routes written"));
    assert!(report.integrated_output.contains("## db\nschema written"));
    assert!(!report.integrated_output.contains("## ui"));

    assert!(dir.path().join("01-api/routes.txt").is_file());
    assert!(dir.path().join("02-db/schema.sql").is_file());

    let events = emitter.snapshot();
    let starts = events
        .iter()
        .filter(|event| event.kind == EventKind::SpecialistStart)
        .count();
    let ends = events
        .iter()
        .filter(|event| event.kind == EventKind::SpecialistEnd)
        .count();
    assert_eq!((starts, ends), (3, 3));
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_specialist_kills_its_running_command() {
    let dir = tempdir().expect("temp dir should be created");
    let planner = RoutingPlanner::default().route(
        "build specialist",
        [
            action(
                "run_command",
                json!({
                    "program": "sh",
                    "args": ["-c", "sleep 30 & echo $! > bg.pid; sleep 30"],
                    "timeout_ms": 60_000
                }),
            ),
            done("built"),
        ],
    );
    let config = CoordinatorConfig {
        specialist_timeout_ms: Some(500),
        ..CoordinatorConfig::default()
    };

    let started = std::time::Instant::now();
    let report = coordinator(planner, config)
        .with_policy(CommandPolicy::empty().allow(AllowedCommand::new("sh")))
        .run(
            vec![SpecialistAssignment::new("build", "Run the build.")],
            dir.path(),
        )
        .await
        .expect("coordination should finish");

    assert!(started.elapsed() < std::time::Duration::from_secs(20));
    assert_eq!(report.status, IntegrationStatus::Partial);
    assert!(
        report.failed[0]
            .failure
            .as_deref()
            .is_some_and(|message| message.contains("timed out"))
    );

    let pid = std::fs::read_to_string(dir.path().join("01-build/bg.pid"))
        .expect("background pid should be recorded");
    let stat_path = format!("/proc/{}/stat", pid.trim());
    let mut alive = true;
    for _ in 0..40 {
        alive = match std::fs::read_to_string(&stat_path) {
            // A zombie has already exited and is only waiting to be reaped.
            Ok(stat) => !stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
            Err(_) => false,
        };
        if !alive {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert!(!alive, "command started by the specialist outlived its cancellation");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn global_deadline_cancels_the_stragglers() {
    let dir = tempdir().expect("temp dir should be created");
    let planner = RoutingPlanner::default()
        .route("fast specialist", [done("fast work done")])
        .stall("slow specialist");
    let config = CoordinatorConfig {
        deadline_ms: Some(300),
        ..CoordinatorConfig::default()
    };

    let report = coordinator(planner, config)
        .run(
            vec![
                SpecialistAssignment::new("fast", "Be quick."),
                SpecialistAssignment::new("slow", "Take forever."),
            ],
            dir.path(),
        )
        .await
        .expect("coordination should finish");

    assert_eq!(report.status, IntegrationStatus::Partial);
    assert_eq!(report.succeeded[0].focus, "fast");
    assert!(
        report.failed[0]
            .failure
            .as_deref()
            .is_some_and(|message| message.contains("deadline"))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_delegates_through_the_tool_and_specialists_cannot_recurse() {
    let dir = tempdir().expect("temp dir should be created");
    let planner = RoutingPlanner::default()
        .route(
            "todo app",
            [
                action(
                    "delegate",
                    json!({
                        "assignments": [
                            { "focus": "api", "instructions": "Add routes.", "step_budget": 4 },
                            { "focus": "docs", "instructions": "Write the readme." }
                        ]
                    }),
                ),
                done("todo app assembled"),
            ],
        )
        .route(
            "api specialist",
            [
                action(
                    "delegate",
                    json!({ "assignments": [{ "focus": "nested", "instructions": "x" }] }),
                ),
                done("routes added"),
            ],
        )
        .route("docs specialist", [done("readme written")]);
    let planner = Arc::new(planner);
    let registry = Arc::new(ToolRegistry::with_builtin_tools());
    let ledger = Arc::new(TaskLedger::new());
    let emitter = Arc::new(BufferedEventEmitter::default());
    let coordinator = Coordinator::new(planner.clone(), registry, ledger, CoordinatorConfig::default())
        .with_scorer(Arc::new(FixedScorer::new(100, Vec::new())))
        .with_emitter(emitter.clone());

    let services = permissive_services(planner).with_delegator(Arc::new(coordinator));
    let mut session = Session::new(SessionSpec::new("build the todo app", dir.path()), services)
        .expect("session should initialize");
    let outcome = session.run().await.expect("run should succeed");

    assert_eq!(outcome.status, SessionStatus::Done);
    let delegate_step = &outcome.transcript.steps()[0];
    let foreman_agent::StepOutcome::Output { content } = &delegate_step.outcome else {
        panic!("delegation should succeed, got {:?}", delegate_step.outcome);
    };
    let report: serde_json::Value =
        serde_json::from_str(content).expect("report should be json");
    assert_eq!(report["status"], "complete");
    assert_eq!(report["succeeded"].as_array().map(Vec::len), Some(2));

    let workspace = session.sandbox().root().join("specialists");
    assert!(workspace.join("01-api").is_dir());
    assert!(workspace.join("02-docs").is_dir());

    // The api specialist tried to fan out again and was refused.
    let refused = emitter.snapshot().into_iter().any(|event| {
        event.kind == EventKind::StepAppended
            && event.data.get("failure").and_then(|value| value.as_str())
                == Some("permission_error")
    });
    assert!(refused, "nested delegation should be refused");
}
