//! Task state transitions driven by run status.
//!
//! Task state only moves forward: `planned → running → awaiting-approvals →
//! done`. `error` and `canceled` are reachable from any active state and are
//! absorbing, as is `done`.

use crate::core::types::{RunStatus, TaskState};

/// Compute the task state implied by a run status, following the transition table.
///
/// Returns `None` when the status does not move the task (non-terminal run
/// status, or a task that is not `running`).
pub fn next_task_state(
    current: TaskState,
    run_status: RunStatus,
    run_has_pr: bool,
) -> Option<TaskState> {
    if current != TaskState::Running {
        return None;
    }
    match run_status {
        RunStatus::Done if run_has_pr => Some(TaskState::AwaitingApprovals),
        RunStatus::Done => Some(TaskState::Done),
        RunStatus::Error | RunStatus::Canceled => Some(TaskState::Error),
        RunStatus::Queued | RunStatus::Dispatched | RunStatus::Running => None,
    }
}

/// True if `from → to` respects forward-only movement.
pub fn can_transition(from: TaskState, to: TaskState) -> bool {
    if !from.is_active() {
        return false;
    }
    match to {
        TaskState::Error | TaskState::Canceled => true,
        _ => rank(to) > rank(from),
    }
}

/// Validate a transition, returning a readable error when it moves backwards.
pub fn check_transition(from: TaskState, to: TaskState) -> Result<(), String> {
    if can_transition(from, to) {
        return Ok(());
    }
    Err(format!(
        "illegal task transition {} -> {}",
        from.as_str(),
        to.as_str()
    ))
}

fn rank(state: TaskState) -> u8 {
    match state {
        TaskState::Planned => 0,
        TaskState::Running => 1,
        TaskState::AwaitingApprovals => 2,
        TaskState::Done => 3,
        // Absorbing states sit past every forward state.
        TaskState::Error | TaskState::Canceled => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_without_pr_completes_task() {
        assert_eq!(
            next_task_state(TaskState::Running, RunStatus::Done, false),
            Some(TaskState::Done)
        );
    }

    #[test]
    fn done_with_pr_awaits_approvals() {
        assert_eq!(
            next_task_state(TaskState::Running, RunStatus::Done, true),
            Some(TaskState::AwaitingApprovals)
        );
    }

    #[test]
    fn error_and_canceled_runs_fail_the_task() {
        for status in [RunStatus::Error, RunStatus::Canceled] {
            assert_eq!(
                next_task_state(TaskState::Running, status, false),
                Some(TaskState::Error)
            );
        }
    }

    #[test]
    fn non_terminal_statuses_do_not_move_the_task() {
        for status in [RunStatus::Queued, RunStatus::Dispatched, RunStatus::Running] {
            assert_eq!(next_task_state(TaskState::Running, status, true), None);
        }
    }

    #[test]
    fn only_running_tasks_react_to_run_status() {
        assert_eq!(next_task_state(TaskState::Planned, RunStatus::Done, false), None);
        assert_eq!(next_task_state(TaskState::Done, RunStatus::Error, false), None);
    }

    #[test]
    fn transitions_are_forward_only() {
        assert!(can_transition(TaskState::Planned, TaskState::Running));
        assert!(can_transition(TaskState::Running, TaskState::AwaitingApprovals));
        assert!(can_transition(TaskState::AwaitingApprovals, TaskState::Done));
        assert!(!can_transition(TaskState::Running, TaskState::Planned));
        assert!(!can_transition(TaskState::AwaitingApprovals, TaskState::Running));
    }

    #[test]
    fn error_is_reachable_from_active_states_and_absorbing() {
        for from in [
            TaskState::Planned,
            TaskState::Running,
            TaskState::AwaitingApprovals,
        ] {
            assert!(can_transition(from, TaskState::Error));
        }
        assert!(!can_transition(TaskState::Error, TaskState::Done));
        assert!(!can_transition(TaskState::Done, TaskState::Error));
        assert!(check_transition(TaskState::Error, TaskState::Running).is_err());
    }
}
