//! Task/run orchestration.
//!
//! Bridges task creation to run spawning, and watches per-run subjects to move
//! task state forward. Watchers are one-shot and keyed by run id: whoever
//! removes the watcher's slot owns the single terminal transition for that
//! run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::core::approval::{ApprovalPolicy, ApprovalState, Evaluation, ProviderRegistry, evaluate};
use crate::core::subjects;
use crate::core::transitions::{check_transition, next_task_state};
use crate::core::types::{NewTask, Run, RunStatus, StatusPayload, Task, TaskState, WorkItem};
use crate::io::bus::{Bus, Message, Subscription, handler};
use crate::io::store::{RunRepository, TaskRepository};

/// One-shot subscriptions keyed by run id.
///
/// A slot is reserved before subscribing so that a message delivered before
/// the subscription handle is stored can still claim it.
#[derive(Clone, Default)]
struct WatcherSlots {
    slots: Arc<Mutex<HashMap<String, Option<Subscription>>>>,
}

impl WatcherSlots {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Option<Subscription>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false if a watcher for `key` is already installed.
    fn reserve(&self, key: &str) -> bool {
        let mut slots = self.lock();
        if slots.contains_key(key) {
            return false;
        }
        slots.insert(key.to_string(), None);
        true
    }

    /// Store the handle. If the slot was already claimed the handle is dropped.
    fn fill(&self, key: &str, subscription: Subscription) {
        let leftover = {
            let mut slots = self.lock();
            match slots.get_mut(key) {
                Some(slot) => {
                    *slot = Some(subscription);
                    None
                }
                None => Some(subscription),
            }
        };
        drop(leftover);
    }

    /// Remove the slot. `Some` means the caller won it; dropping the returned
    /// value unsubscribes.
    fn claim(&self, key: &str) -> Option<Option<Subscription>> {
        self.lock().remove(key)
    }

    #[cfg(test)]
    fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }
}

/// Drives tasks through their lifecycle from run events.
#[derive(Clone)]
pub struct Orchestrator {
    bus: Arc<dyn Bus>,
    tasks: Arc<TaskRepository>,
    runs: Arc<RunRepository>,
    base_branch: String,
    status_watchers: WatcherSlots,
    activity_watchers: WatcherSlots,
}

impl Orchestrator {
    pub fn new(
        bus: Arc<dyn Bus>,
        tasks: Arc<TaskRepository>,
        runs: Arc<RunRepository>,
        base_branch: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            tasks,
            runs,
            base_branch: base_branch.into(),
            status_watchers: WatcherSlots::default(),
            activity_watchers: WatcherSlots::default(),
        }
    }

    pub fn tasks(&self) -> &Arc<TaskRepository> {
        &self.tasks
    }

    pub fn runs(&self) -> &Arc<RunRepository> {
        &self.runs
    }

    /// Validate and store a new task in the `planned` state.
    #[instrument(skip_all, fields(title = %new.title))]
    pub fn create_task(&self, new: NewTask) -> Result<Task> {
        if new.agents.is_empty() {
            return Err(anyhow!("task must name at least one agent"));
        }
        if new.target_repo.trim().is_empty() {
            return Err(anyhow!("task must name a target repository"));
        }
        ApprovalPolicy::from_task_policy(&new.policy).context("invalid task policy")?;

        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4().to_string(),
            title: new.title,
            goal: new.goal,
            target_repo: new.target_repo,
            agents: new.agents,
            policy: new.policy,
            state: TaskState::Planned,
            created_at: now,
            updated_at: now,
            run_id: None,
            pr: None,
            error: None,
        };
        let task = self.tasks.create(task)?;
        info!(task_id = %task.id, "task created");
        Ok(task)
    }

    /// Spawn a run for `task_id` on `agent_id`, or return the existing run id.
    ///
    /// The work item is published and the Run stored before the task gains
    /// its run reference.
    #[instrument(skip_all, fields(task_id = %task_id, agent_id = %agent_id))]
    pub async fn spawn_run_for_task(&self, task_id: &str, agent_id: &str) -> Result<String> {
        let task = self.tasks.require(task_id)?;
        if let Some(run_id) = task.run_id {
            debug!(run_id = %run_id, "task already has a run");
            return Ok(run_id);
        }

        let run_id = Uuid::new_v4().to_string();
        let work = WorkItem {
            run_id: run_id.clone(),
            task_id: task.id.clone(),
            repo: task.target_repo.clone(),
            base: self.base_branch.clone(),
            prompt: work_prompt(&task),
        };
        let payload = serde_json::to_value(&work).context("encode work item")?;
        self.bus
            .publish(&subjects::agent_work(agent_id), payload)
            .await
            .context("publish work item")?;

        let now = Utc::now();
        self.runs.create(Run {
            id: run_id.clone(),
            agent_id: agent_id.to_string(),
            repo: work.repo,
            base: work.base,
            prompt: work.prompt,
            status: RunStatus::Queued,
            created_at: now,
            updated_at: now,
            pr: None,
            compose_error: None,
        })?;

        self.tasks.require_update(task_id, |task| {
            task.run_id = Some(run_id.clone());
            if task.state == TaskState::Planned {
                task.state = TaskState::Running;
            }
        })?;
        info!(run_id = %run_id, "run spawned");
        Ok(run_id)
    }

    /// Install the one-shot status watcher for `run_id`. Idempotent per run id.
    #[instrument(skip_all, fields(run_id = %run_id, task_id = %task_id))]
    pub async fn watch_run_for_task(&self, run_id: &str, task_id: &str) -> Result<()> {
        if !self.status_watchers.reserve(run_id) {
            debug!("status watcher already installed");
            return Ok(());
        }
        let this = self.clone();
        let (run, task) = (run_id.to_string(), task_id.to_string());
        let subscribed = self
            .bus
            .subscribe(
                &subjects::run_status(run_id),
                handler(move |message: Message| {
                    let this = this.clone();
                    let (run, task) = (run.clone(), task.clone());
                    async move { this.on_status(&run, &task, message) }
                }),
            )
            .await;
        match subscribed {
            Ok(subscription) => {
                self.status_watchers.fill(run_id, subscription);
                Ok(())
            }
            Err(err) => {
                drop(self.status_watchers.claim(run_id));
                Err(err).context("subscribe to run status")
            }
        }
    }

    /// Move a queued/dispatched run to `running` on its first log line.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub async fn track_run_activity(&self, run_id: &str) -> Result<()> {
        if !self.activity_watchers.reserve(run_id) {
            return Ok(());
        }
        let this = self.clone();
        let run = run_id.to_string();
        let subscribed = self
            .bus
            .subscribe(
                &subjects::run_logs(run_id),
                handler(move |_message: Message| {
                    let this = this.clone();
                    let run = run.clone();
                    async move {
                        this.on_first_log(&run);
                        Ok(())
                    }
                }),
            )
            .await;
        match subscribed {
            Ok(subscription) => {
                self.activity_watchers.fill(run_id, subscription);
                Ok(())
            }
            Err(err) => {
                drop(self.activity_watchers.claim(run_id));
                Err(err).context("subscribe to run logs")
            }
        }
    }

    /// Spawn a run for the task's first agent and watch it.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub async fn start_task(&self, task_id: &str) -> Result<String> {
        let task = self.tasks.require(task_id)?;
        let agent_id = task
            .agents
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("task '{task_id}' has no agents"))?;
        let run_id = self.spawn_run_for_task(task_id, &agent_id).await?;
        self.watch_run_for_task(&run_id, task_id).await?;
        self.track_run_activity(&run_id).await?;
        Ok(run_id)
    }

    /// Cancel an active task and its run.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub async fn cancel_task(&self, task_id: &str) -> Result<Task> {
        let task = self.tasks.require(task_id)?;
        check_transition(task.state, TaskState::Canceled).map_err(|msg| anyhow!(msg))?;

        if let Some(run_id) = &task.run_id {
            drop(self.status_watchers.claim(run_id));
            drop(self.activity_watchers.claim(run_id));
            self.bus
                .publish(&subjects::run_control(run_id), json!({"action": "cancel"}))
                .await
                .context("publish cancel control")?;
            self.runs.update(run_id, |run| {
                if !run.status.is_terminal() {
                    run.status = RunStatus::Canceled;
                }
            });
        }
        let task = self.tasks.require_update(task_id, |task| {
            task.state = TaskState::Canceled;
        })?;
        info!("task canceled");
        Ok(task)
    }

    /// Evaluate the task's approval policy and settle a task awaiting approvals.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub fn refresh_approvals(
        &self,
        task_id: &str,
        registry: &ProviderRegistry,
        strict: bool,
    ) -> Result<Evaluation> {
        let task = self.tasks.require(task_id)?;
        let evaluation = match ApprovalPolicy::from_task_policy(&task.policy)
            .context("invalid task policy")?
        {
            Some(policy) => evaluate(&policy, registry, task_id, strict),
            None => Evaluation {
                state: ApprovalState::Satisfied,
                verdicts: Vec::new(),
            },
        };

        if task.state == TaskState::AwaitingApprovals {
            let next = match evaluation.state {
                ApprovalState::Satisfied => Some(TaskState::Done),
                ApprovalState::Error => Some(TaskState::Error),
                ApprovalState::Pending => None,
            };
            if let Some(next) = next {
                self.tasks.update(task_id, |task| {
                    task.state = next;
                    if next == TaskState::Error {
                        task.error = Some("approval policy failed".to_string());
                    }
                });
                info!(state = next.as_str(), "approvals settled");
            }
        }
        Ok(evaluation)
    }

    #[cfg(test)]
    fn is_watching(&self, run_id: &str) -> bool {
        self.status_watchers.contains(run_id)
    }

    fn on_status(&self, run_id: &str, task_id: &str, message: Message) -> Result<()> {
        let status: StatusPayload =
            serde_json::from_value(message.payload).context("decode status payload")?;
        let Some(run) = self.runs.update(run_id, |run| run.status = status.state) else {
            warn!(run_id, "status for unknown run");
            return Ok(());
        };
        if !status.state.is_terminal() {
            debug!(run_id, status = status.state.as_str(), "run progressed");
            return Ok(());
        }

        let Some(claim) = self.status_watchers.claim(run_id) else {
            debug!(run_id, "terminal status already applied");
            return Ok(());
        };
        let task = self.tasks.require(task_id)?;
        if let Some(next) = next_task_state(task.state, status.state, run.pr.is_some()) {
            self.tasks.update(task_id, |task| {
                task.state = next;
                match next {
                    TaskState::AwaitingApprovals => task.pr = run.pr.clone(),
                    TaskState::Error => task.error = Some(run_error(&run, &status)),
                    _ => {}
                }
            });
            info!(run_id, task_id, state = next.as_str(), "task transitioned");
        }
        drop(self.activity_watchers.claim(run_id));
        drop(claim);
        Ok(())
    }

    fn on_first_log(&self, run_id: &str) {
        let Some(claim) = self.activity_watchers.claim(run_id) else {
            return;
        };
        self.runs.update(run_id, |run| {
            if matches!(run.status, RunStatus::Queued | RunStatus::Dispatched) {
                run.status = RunStatus::Running;
            }
        });
        debug!(run_id, "run active");
        drop(claim);
    }
}

fn work_prompt(task: &Task) -> String {
    match (task.title.trim(), task.goal.trim()) {
        ("", goal) => goal.to_string(),
        (title, "") => title.to_string(),
        (title, goal) => format!("{title}\n\n{goal}"),
    }
}

fn run_error(run: &Run, status: &StatusPayload) -> String {
    match &status.detail {
        Some(detail) => format!("run {} ended {}: {detail}", run.id, status.state.as_str()),
        None => format!("run {} ended {}", run.id, status.state.as_str()),
    }
}
