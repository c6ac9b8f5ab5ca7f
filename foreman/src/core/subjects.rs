//! Bus subject names and pattern matching.
//!
//! Subjects are dot-delimited tokens. Patterns may use `*` to match exactly
//! one token and a trailing `>` to match one or more remaining tokens.

pub fn run_logs(run_id: &str) -> String {
    format!("runs.{run_id}.logs")
}

pub fn run_patch(run_id: &str) -> String {
    format!("runs.{run_id}.patch")
}

pub fn run_status(run_id: &str) -> String {
    format!("runs.{run_id}.status")
}

pub fn run_control(run_id: &str) -> String {
    format!("runs.{run_id}.control")
}

pub fn agent_work(agent_id: &str) -> String {
    format!("agents.{agent_id}.work")
}

pub fn agent_heartbeat(agent_id: &str) -> String {
    format!("agents.{agent_id}.heartbeat")
}

/// Wildcard pattern covering every agent heartbeat.
pub const ALL_HEARTBEATS: &str = "agents.*.heartbeat";

/// Request/reply subject for creating a task.
pub const TASKS_CREATE: &str = "tasks.create";

/// Request/reply subject for fetching a task.
pub const TASKS_GET: &str = "tasks.get";

/// Prefix for generated reply subjects.
pub const INBOX_PREFIX: &str = "_INBOX";

/// Extract the id token from `agents.<id>.<kind>` or `runs.<id>.<kind>`.
pub fn entity_id(subject: &str) -> Option<&str> {
    let mut tokens = subject.split('.');
    let _kind = tokens.next()?;
    let id = tokens.next()?;
    if id.is_empty() { None } else { Some(id) }
}

/// True if `subject` matches `pattern`.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(token)) if !token.is_empty() => {}
            (Some(expected), Some(token)) if expected == token => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_run_and_agent_subjects() {
        assert_eq!(run_logs("r1"), "runs.r1.logs");
        assert_eq!(run_patch("r1"), "runs.r1.patch");
        assert_eq!(run_status("r1"), "runs.r1.status");
        assert_eq!(run_control("r1"), "runs.r1.control");
        assert_eq!(agent_work("a1"), "agents.a1.work");
        assert_eq!(agent_heartbeat("a1"), "agents.a1.heartbeat");
    }

    #[test]
    fn exact_subjects_match_only_themselves() {
        assert!(matches("runs.r1.status", "runs.r1.status"));
        assert!(!matches("runs.r1.status", "runs.r2.status"));
        assert!(!matches("runs.r1", "runs.r1.status"));
    }

    #[test]
    fn star_matches_a_single_token() {
        assert!(matches("agents.*.heartbeat", "agents.codex.heartbeat"));
        assert!(!matches("agents.*.heartbeat", "agents.a.b.heartbeat"));
        assert!(!matches("agents.*.heartbeat", "agents..heartbeat"));
    }

    #[test]
    fn tail_wildcard_needs_at_least_one_token() {
        assert!(matches("runs.>", "runs.r1.logs"));
        assert!(matches("runs.>", "runs.r1"));
        assert!(!matches("runs.>", "runs"));
        assert!(!matches("runs.>.logs", "runs.r1.logs"));
    }

    #[test]
    fn entity_id_reads_second_token() {
        assert_eq!(entity_id("agents.codex.heartbeat"), Some("codex"));
        assert_eq!(entity_id("runs"), None);
    }
}
