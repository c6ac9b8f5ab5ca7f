//! Built-in approval providers.
//!
//! Each provider owns the state it consults. State is seeded by callers (route
//! handlers, webhooks, tests) and read at evaluation time.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, anyhow};
use serde_json::Value;

use crate::core::approval::{ApprovalProvider, ApprovalRule, ProviderRegistry, Verdict};

/// Satisfied once enough approvers have been recorded for the task.
///
/// Rule fields: `min` (default 1) and an optional `approvers` allow-list.
#[derive(Debug, Default)]
pub struct ManualApprovals {
    approvals: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl ManualApprovals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `approver` approved `task_id`.
    pub fn approve(&self, task_id: &str, approver: &str) {
        let mut approvals = self.approvals.lock().unwrap_or_else(PoisonError::into_inner);
        approvals
            .entry(task_id.to_string())
            .or_default()
            .insert(approver.to_string());
    }

    pub fn revoke(&self, task_id: &str, approver: &str) {
        let mut approvals = self.approvals.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(set) = approvals.get_mut(task_id) {
            set.remove(approver);
        }
    }

    fn approvers_for(&self, task_id: &str) -> BTreeSet<String> {
        let approvals = self.approvals.lock().unwrap_or_else(PoisonError::into_inner);
        approvals.get(task_id).cloned().unwrap_or_default()
    }
}

impl ApprovalProvider for ManualApprovals {
    fn verdict(&self, rule: &ApprovalRule, task_id: &str) -> Result<Verdict> {
        let min = match rule.fields.get("min") {
            None => 1,
            Some(value) => value
                .as_u64()
                .filter(|n| *n > 0)
                .ok_or_else(|| anyhow!("manual: `min` must be a positive integer"))?,
        };
        let allowed = match rule.fields.get("approvers") {
            None => None,
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .map(|item| {
                        item.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| anyhow!("manual: `approvers` must be strings"))
                    })
                    .collect::<Result<BTreeSet<String>>>()?,
            ),
            Some(_) => return Err(anyhow!("manual: `approvers` must be an array")),
        };

        let seeded = self.approvers_for(task_id);
        let count = match &allowed {
            Some(allowed) => seeded.intersection(allowed).count(),
            None => seeded.len(),
        };
        if count as u64 >= min {
            Ok(Verdict::Satisfied)
        } else {
            Ok(Verdict::Pending)
        }
    }
}

/// Mirrors the state of external checks (CI) for a task.
#[derive(Debug, Default)]
pub struct CheckStatus {
    states: Mutex<HashMap<String, String>>,
}

impl CheckStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest check state (`success`, `failure`, `error`, `pending`).
    pub fn record(&self, task_id: &str, state: &str) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.insert(task_id.to_string(), state.to_string());
    }
}

impl ApprovalProvider for CheckStatus {
    fn verdict(&self, _rule: &ApprovalRule, task_id: &str) -> Result<Verdict> {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(match states.get(task_id).map(String::as_str) {
            Some("success") => Verdict::Satisfied,
            Some("failure") | Some("error") => Verdict::Fail,
            _ => Verdict::Pending,
        })
    }
}

/// Handles to the built-in providers, for seeding their state.
#[derive(Clone, Default)]
pub struct BuiltinProviders {
    pub manual: Arc<ManualApprovals>,
    pub checks: Arc<CheckStatus>,
}

impl BuiltinProviders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry containing `manual` and `checks`.
    pub fn registry(&self) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register("manual", self.manual.clone());
        registry.register("checks", self.checks.clone());
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn manual_is_pending_until_min_approvers() {
        let manual = ManualApprovals::new();
        let rule = ApprovalRule::new("manual").with_field("min", json!(2));
        assert_eq!(manual.verdict(&rule, "t").expect("verdict"), Verdict::Pending);
        manual.approve("t", "alice");
        assert_eq!(manual.verdict(&rule, "t").expect("verdict"), Verdict::Pending);
        manual.approve("t", "bob");
        assert_eq!(manual.verdict(&rule, "t").expect("verdict"), Verdict::Satisfied);
    }

    #[test]
    fn manual_counts_only_allowed_approvers() {
        let manual = ManualApprovals::new();
        let rule = ApprovalRule::new("manual").with_field("approvers", json!(["lead"]));
        manual.approve("t", "intern");
        assert_eq!(manual.verdict(&rule, "t").expect("verdict"), Verdict::Pending);
        manual.approve("t", "lead");
        assert_eq!(manual.verdict(&rule, "t").expect("verdict"), Verdict::Satisfied);
        manual.revoke("t", "lead");
        assert_eq!(manual.verdict(&rule, "t").expect("verdict"), Verdict::Pending);
    }

    #[test]
    fn manual_rejects_malformed_fields() {
        let manual = ManualApprovals::new();
        let rule = ApprovalRule::new("manual").with_field("min", json!("two"));
        assert!(manual.verdict(&rule, "t").is_err());
    }

    #[test]
    fn checks_map_states_to_verdicts() {
        let checks = CheckStatus::new();
        let rule = ApprovalRule::new("checks");
        assert_eq!(checks.verdict(&rule, "t").expect("verdict"), Verdict::Pending);
        checks.record("t", "failure");
        assert_eq!(checks.verdict(&rule, "t").expect("verdict"), Verdict::Fail);
        checks.record("t", "success");
        assert_eq!(checks.verdict(&rule, "t").expect("verdict"), Verdict::Satisfied);
    }

    #[test]
    fn registry_exposes_builtins() {
        let builtins = BuiltinProviders::new();
        let registry = builtins.registry();
        assert_eq!(registry.names(), vec!["checks", "manual"]);
    }
}
