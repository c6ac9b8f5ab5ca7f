//! Shared deterministic types for foreman core logic.
//!
//! These types define the stable contracts between the orchestrator, the
//! composer and the external agents. Serialized names follow the bus wire
//! format (camelCase fields, lowercase / kebab-case states).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Planned,
    Running,
    AwaitingApprovals,
    Done,
    Error,
    Canceled,
}

impl TaskState {
    /// True while the task can still make progress.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskState::Planned | TaskState::Running | TaskState::AwaitingApprovals
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Planned => "planned",
            TaskState::Running => "running",
            TaskState::AwaitingApprovals => "awaiting-approvals",
            TaskState::Done => "done",
            TaskState::Error => "error",
            TaskState::Canceled => "canceled",
        }
    }
}

/// Status of a single run as reported by its agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Dispatched,
    Running,
    Done,
    Error,
    Canceled,
}

impl RunStatus {
    /// Terminal statuses end the run; no further status is expected.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Error | RunStatus::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Dispatched => "dispatched",
            RunStatus::Running => "running",
            RunStatus::Done => "done",
            RunStatus::Error => "error",
            RunStatus::Canceled => "canceled",
        }
    }
}

/// Payload published on `runs.<id>.status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub state: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

/// Reference to the branch (and optional change request) composed for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrRef {
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A unit of intent with its own approval policy and lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub goal: String,
    pub target_repo: String,
    pub agents: Vec<String>,
    /// Opaque policy map; the approval policy lives under `"approvals"`.
    #[serde(default)]
    pub policy: Map<String, Value>,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Non-owning reference into the run repository.
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub pr: Option<PrRef>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Caller-supplied fields for a new task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub title: String,
    pub goal: String,
    pub target_repo: String,
    pub agents: Vec<String>,
    #[serde(default)]
    pub policy: Map<String, Value>,
}

/// One dispatch of work to a single agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub agent_id: String,
    pub repo: String,
    pub base: String,
    pub prompt: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub pr: Option<PrRef>,
    #[serde(default)]
    pub compose_error: Option<String>,
}

/// Work item published to `agents.<id>.work`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub run_id: String,
    pub task_id: String,
    pub repo: String,
    pub base: String,
    pub prompt: String,
}

/// Log line published on `runs.<id>.logs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: String,
    pub message: String,
}

impl LogLine {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: "info".to_string(),
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: "error".to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    #[test]
    fn task_state_uses_kebab_case_on_the_wire() {
        let raw = serde_json::to_value(TaskState::AwaitingApprovals).expect("serialize");
        assert_eq!(raw, json!("awaiting-approvals"));
        assert_eq!(TaskState::AwaitingApprovals.as_str(), "awaiting-approvals");
    }

    #[test]
    fn status_payload_accepts_optional_detail() {
        let payload: StatusPayload =
            serde_json::from_value(json!({"state": "done"})).expect("parse");
        assert_eq!(payload.state, RunStatus::Done);
        assert!(payload.detail.is_none());

        let payload: StatusPayload =
            serde_json::from_value(json!({"state": "error", "detail": {"code": 2}}))
                .expect("parse");
        assert_eq!(payload.detail, Some(json!({"code": 2})));
    }

    #[test]
    fn unknown_run_status_is_rejected() {
        assert!(serde_json::from_value::<StatusPayload>(json!({"state": "paused"})).is_err());
    }

    #[test]
    fn run_statuses_collect_into_ordered_sets() {
        let set: BTreeSet<RunStatus> = [RunStatus::Error, RunStatus::Done, RunStatus::Done]
            .into_iter()
            .collect();
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![RunStatus::Done, RunStatus::Error]);
        assert!(RunStatus::Queued < RunStatus::Canceled);
    }
}
