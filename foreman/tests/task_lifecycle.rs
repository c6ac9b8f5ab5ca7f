//! End-to-end task lifecycle over the in-process bus.
//!
//! A scripted agent subscribes to its work subject and the test publishes
//! the agent's logs and status, awaiting every delivery before asserting.

use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use foreman::composer::{ComposeSettings, Composer};
use foreman::core::approval::ApprovalState;
use foreman::core::providers::BuiltinProviders;
use foreman::core::subjects;
use foreman::core::types::{PrRef, RunStatus, TaskState, WorkItem};
use foreman::io::bus::memory::MemoryBus;
use foreman::io::bus::{Bus, Message, Subscription, handler, settle};
use foreman::io::store::{RunRepository, TaskRepository};
use foreman::orchestrator::Orchestrator;
use foreman::test_support::{
    RecordingHost, RecordingVcs, approval_policy, composer_deps, new_task,
};

fn orchestrator(bus: &MemoryBus) -> Orchestrator {
    Orchestrator::new(
        Arc::new(bus.clone()),
        Arc::new(TaskRepository::new()),
        Arc::new(RunRepository::new()),
        "main",
    )
}

async fn scripted_agent(bus: &MemoryBus, agent: &str) -> (Subscription, Arc<Mutex<Vec<Value>>>) {
    let inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = inbox.clone();
    let sub = bus
        .subscribe(
            &subjects::agent_work(agent),
            handler(move |message: Message| {
                let sink = sink.clone();
                async move {
                    sink.lock().expect("lock").push(message.payload);
                    Ok(())
                }
            }),
        )
        .await
        .expect("subscribe agent");
    (sub, inbox)
}

async fn publish(bus: &MemoryBus, subject: &str, payload: Value) {
    let deliveries = bus.publish(subject, payload).await.expect("publish");
    settle(deliveries).await;
}

/// planned -> running (spawn) -> run running (first log) -> done (status).
#[tokio::test]
async fn task_runs_to_done_without_change_request() {
    let bus = MemoryBus::new();
    let orch = orchestrator(&bus);
    let (_agent, inbox) = scripted_agent(&bus, "codex").await;

    let task = orch.create_task(new_task("codex")).expect("create");
    assert_eq!(task.state, TaskState::Planned);

    let run_id = orch.start_task(&task.id).await.expect("start");
    let task = orch.tasks().require(&task.id).expect("task");
    assert_eq!(task.state, TaskState::Running);
    assert_eq!(task.run_id.as_deref(), Some(run_id.as_str()));
    assert_eq!(
        orch.runs().require(&run_id).expect("run").status,
        RunStatus::Queued
    );

    // The agent queue is ordered, so a null publish flushes the work item.
    publish(&bus, &subjects::agent_work("codex"), json!(null)).await;
    let work: WorkItem = {
        let inbox = inbox.lock().expect("lock");
        assert_eq!(inbox.len(), 2);
        serde_json::from_value(inbox[0].clone()).expect("work item")
    };
    assert_eq!(work.run_id, run_id);
    assert_eq!(work.task_id, task.id);
    assert_eq!(work.base, "main");
    assert!(work.prompt.starts_with(&task.title));

    publish(
        &bus,
        &subjects::run_logs(&run_id),
        json!({"level": "info", "message": "cloning"}),
    )
    .await;
    assert_eq!(
        orch.runs().require(&run_id).expect("run").status,
        RunStatus::Running
    );

    publish(&bus, &subjects::run_status(&run_id), json!({"state": "done"})).await;
    let task = orch.tasks().require(&task.id).expect("task");
    assert_eq!(task.state, TaskState::Done);
    assert!(task.pr.is_none());
    assert_eq!(
        orch.runs().require(&run_id).expect("run").status,
        RunStatus::Done
    );
}

#[tokio::test]
async fn canceled_run_moves_task_to_error() {
    let bus = MemoryBus::new();
    let orch = orchestrator(&bus);
    let task = orch.create_task(new_task("codex")).expect("create");
    let run_id = orch.start_task(&task.id).await.expect("start");

    publish(
        &bus,
        &subjects::run_status(&run_id),
        json!({"state": "canceled", "detail": "agent shut down"}),
    )
    .await;
    let task = orch.tasks().require(&task.id).expect("task");
    assert_eq!(task.state, TaskState::Error);
    assert!(task.error.as_deref().unwrap_or("").contains("agent shut down"));
}

#[tokio::test]
async fn racing_terminal_statuses_apply_once() {
    let bus = MemoryBus::new();
    let orch = orchestrator(&bus);
    let task = orch.create_task(new_task("codex")).expect("create");
    let run_id = orch.start_task(&task.id).await.expect("start");

    let subject = subjects::run_status(&run_id);
    let mut deliveries = bus
        .publish(&subject, json!({"state": "done"}))
        .await
        .expect("publish");
    deliveries.extend(
        bus.publish(&subject, json!({"state": "error"}))
            .await
            .expect("publish"),
    );
    settle(deliveries).await;

    let task = orch.tasks().require(&task.id).expect("task");
    assert_eq!(task.state, TaskState::Done);
    assert!(task.error.is_none());
}

/// A change request parks the task until `manual` and `checks` both agree.
#[tokio::test]
async fn all_of_policy_settles_after_manual_and_checks() {
    let bus = MemoryBus::new();
    let orch = orchestrator(&bus);
    let providers = BuiltinProviders::new();
    let registry = providers.registry();

    let mut new = new_task("codex");
    new.policy = approval_policy("allOf", &["manual", "checks"]);
    let task = orch.create_task(new).expect("create");
    let run_id = orch.start_task(&task.id).await.expect("start");
    orch.runs().update(&run_id, |run| {
        run.pr = Some(PrRef {
            branch: "agent/codex/fix-login".to_string(),
            number: Some(12),
            url: Some("https://github.com/acme/widgets/pull/12".to_string()),
        });
    });

    publish(&bus, &subjects::run_status(&run_id), json!({"state": "done"})).await;
    let parked = orch.tasks().require(&task.id).expect("task");
    assert_eq!(parked.state, TaskState::AwaitingApprovals);
    assert_eq!(parked.pr.as_ref().and_then(|pr| pr.number), Some(12));

    let eval = orch
        .refresh_approvals(&task.id, &registry, false)
        .expect("evaluate");
    assert_eq!(eval.state, ApprovalState::Pending);

    providers.manual.approve(&task.id, "alice");
    let eval = orch
        .refresh_approvals(&task.id, &registry, false)
        .expect("evaluate");
    assert_eq!(eval.state, ApprovalState::Pending);
    assert_eq!(eval.verdicts.len(), 2);

    providers.checks.record(&task.id, "success");
    let eval = orch
        .refresh_approvals(&task.id, &registry, false)
        .expect("evaluate");
    assert_eq!(eval.state, ApprovalState::Satisfied);
    assert_eq!(
        orch.tasks().require(&task.id).expect("task").state,
        TaskState::Done
    );
}

#[tokio::test]
async fn failing_check_errors_the_task() {
    let bus = MemoryBus::new();
    let orch = orchestrator(&bus);
    let providers = BuiltinProviders::new();

    let mut new = new_task("codex");
    new.policy = approval_policy("allOf", &["checks"]);
    let task = orch.create_task(new).expect("create");
    let run_id = orch.start_task(&task.id).await.expect("start");
    orch.runs().update(&run_id, |run| {
        run.pr = Some(PrRef {
            branch: "agent/codex/fix-login".to_string(),
            number: None,
            url: None,
        });
    });
    publish(&bus, &subjects::run_status(&run_id), json!({"state": "done"})).await;

    providers.checks.record(&task.id, "failure");
    let eval = orch
        .refresh_approvals(&task.id, &providers.registry(), false)
        .expect("evaluate");
    assert_eq!(eval.state, ApprovalState::Error);
    assert_eq!(
        orch.tasks().require(&task.id).expect("task").state,
        TaskState::Error
    );
}

/// The task watcher reads `run.pr` when the terminal status arrives, while the
/// composer records it only after pushing, so the task may settle as `done`.
#[tokio::test]
async fn composed_run_can_settle_before_its_change_request_is_recorded() {
    let bus = MemoryBus::new();
    let orch = orchestrator(&bus);
    let composer = Composer::new(
        composer_deps(
            Arc::new(bus.clone()),
            orch.runs().clone(),
            Arc::new(RecordingVcs::default()),
            Arc::new(RecordingHost::with_credentials()),
        ),
        ComposeSettings::new("https://github.com/acme/widgets.git"),
    )
    .expect("composer");

    let task = orch.create_task(new_task("codex")).expect("create");
    let run_id = orch.start_task(&task.id).await.expect("start");
    composer.attach(&run_id).await.expect("attach");

    publish(
        &bus,
        &subjects::run_patch(&run_id),
        json!({"files": [{"path": "a.txt", "content": "a"}]}),
    )
    .await;
    publish(&bus, &subjects::run_status(&run_id), json!({"state": "done"})).await;

    let run = orch.runs().require(&run_id).expect("run");
    assert_eq!(run.pr.and_then(|pr| pr.number), Some(1));
    let state = orch.tasks().require(&task.id).expect("task").state;
    assert!(
        matches!(state, TaskState::Done | TaskState::AwaitingApprovals),
        "unexpected {state:?}"
    );
}
