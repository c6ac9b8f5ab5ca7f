//! Approval policy evaluation.
//!
//! A policy is an ordered list of rules, each resolved to a [`Verdict`] by a
//! named provider. Aggregation is total: a missing provider yields
//! `unsupported`, a failing (or panicking) provider yields `fail`, and every
//! rule is evaluated even when the outcome is already decided.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, LazyLock};

use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

const POLICY_SCHEMA: &str = include_str!("../../schemas/approval_policy.schema.json");

/// The embedded schema, compiled on first use.
static POLICY_VALIDATOR: LazyLock<Result<jsonschema::Validator, String>> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(POLICY_SCHEMA).map_err(|err| format!("embedded schema: {err}"))?;
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| format!("compile schema: {err}"))
});

/// Key under which a task's policy map stores its approval policy.
pub const TASK_POLICY_KEY: &str = "approvals";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalMode {
    #[serde(rename = "allOf")]
    AllOf,
    #[serde(rename = "anyOf")]
    AnyOf,
}

/// A single rule. Fields other than `provider` are passed opaquely to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub provider: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ApprovalRule {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    pub mode: ApprovalMode,
    pub rules: Vec<ApprovalRule>,
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("approval policy failed validation:\n- {}", .0.join("\n- "))]
    Schema(Vec<String>),

    #[error("approval policy could not be parsed: {0}")]
    Parse(String),
}

impl ApprovalPolicy {
    /// Validate `value` against the policy schema and parse it.
    pub fn from_value(value: &Value) -> Result<Self, PolicyError> {
        let compiled = POLICY_VALIDATOR
            .as_ref()
            .map_err(|err| PolicyError::Parse(err.clone()))?;
        let messages: Vec<String> = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            return Err(PolicyError::Schema(messages));
        }
        serde_json::from_value(value.clone()).map_err(|err| PolicyError::Parse(err.to_string()))
    }

    /// Read the approval policy out of a task policy map, if one is present.
    pub fn from_task_policy(policy: &Map<String, Value>) -> Result<Option<Self>, PolicyError> {
        policy.get(TASK_POLICY_KEY).map(Self::from_value).transpose()
    }
}

/// Verdict returned by a provider for one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Satisfied,
    Pending,
    Fail,
    Unsupported,
}

/// Aggregate approval state for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalState {
    Satisfied,
    Pending,
    Error,
}

/// A pluggable verdict source for one policy rule.
///
/// Providers own whatever state they need; the evaluator only passes the rule
/// and the task id.
pub trait ApprovalProvider: Send + Sync {
    fn verdict(&self, rule: &ApprovalRule, task_id: &str) -> anyhow::Result<Verdict>;
}

/// Lookup table of providers built at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn ApprovalProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn ApprovalProvider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ApprovalProvider>> {
        self.providers.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}

/// Verdict recorded for one rule, in policy order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleVerdict {
    pub provider: String,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    pub state: ApprovalState,
    pub verdicts: Vec<RuleVerdict>,
}

/// Evaluate every rule of `policy` for `task_id` and aggregate the verdicts.
pub fn evaluate(
    policy: &ApprovalPolicy,
    registry: &ProviderRegistry,
    task_id: &str,
    strict: bool,
) -> Evaluation {
    let verdicts: Vec<RuleVerdict> = policy
        .rules
        .iter()
        .map(|rule| RuleVerdict {
            provider: rule.provider.clone(),
            verdict: resolve(rule, registry, task_id),
        })
        .collect();
    let raw: Vec<Verdict> = verdicts.iter().map(|v| v.verdict).collect();
    let state = aggregate(policy.mode, &raw, strict);
    debug!(task_id, state = ?state, rules = raw.len(), "approval evaluated");
    Evaluation { state, verdicts }
}

fn resolve(rule: &ApprovalRule, registry: &ProviderRegistry, task_id: &str) -> Verdict {
    let Some(provider) = registry.get(&rule.provider) else {
        return Verdict::Unsupported;
    };
    match catch_unwind(AssertUnwindSafe(|| provider.verdict(rule, task_id))) {
        Ok(Ok(verdict)) => verdict,
        Ok(Err(err)) => {
            warn!(provider = %rule.provider, task_id, err = %err, "approval provider failed");
            Verdict::Fail
        }
        Err(_) => {
            warn!(provider = %rule.provider, task_id, "approval provider panicked");
            Verdict::Fail
        }
    }
}

/// Combine verdicts according to `mode` and strictness.
pub fn aggregate(mode: ApprovalMode, verdicts: &[Verdict], strict: bool) -> ApprovalState {
    let any = |target: Verdict| verdicts.contains(&target);
    match mode {
        ApprovalMode::AllOf => {
            if any(Verdict::Fail) || (strict && any(Verdict::Unsupported)) {
                ApprovalState::Error
            } else if verdicts.iter().all(|v| *v == Verdict::Satisfied) {
                ApprovalState::Satisfied
            } else {
                ApprovalState::Pending
            }
        }
        ApprovalMode::AnyOf => {
            if any(Verdict::Satisfied) {
                ApprovalState::Satisfied
            } else if strict
                && verdicts
                    .iter()
                    .all(|v| matches!(v, Verdict::Fail | Verdict::Unsupported))
            {
                ApprovalState::Error
            } else {
                ApprovalState::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;

    const ALL: [Verdict; 4] = [
        Verdict::Satisfied,
        Verdict::Pending,
        Verdict::Fail,
        Verdict::Unsupported,
    ];

    fn vectors(max_len: usize) -> Vec<Vec<Verdict>> {
        let mut out: Vec<Vec<Verdict>> = vec![Vec::new()];
        let mut frontier = out.clone();
        for _ in 0..max_len {
            let mut next = Vec::new();
            for prefix in &frontier {
                for verdict in ALL {
                    let mut v = prefix.clone();
                    v.push(verdict);
                    next.push(v);
                }
            }
            out.extend(next.iter().cloned());
            frontier = next;
        }
        out.retain(|v| !v.is_empty());
        out
    }

    struct Fixed(Verdict);
    impl ApprovalProvider for Fixed {
        fn verdict(&self, _rule: &ApprovalRule, _task_id: &str) -> anyhow::Result<Verdict> {
            Ok(self.0)
        }
    }

    struct Failing;
    impl ApprovalProvider for Failing {
        fn verdict(&self, _rule: &ApprovalRule, _task_id: &str) -> anyhow::Result<Verdict> {
            Err(anyhow!("provider offline"))
        }
    }

    struct Panicking;
    impl ApprovalProvider for Panicking {
        fn verdict(&self, _rule: &ApprovalRule, _task_id: &str) -> anyhow::Result<Verdict> {
            panic!("provider bug")
        }
    }

    #[test]
    fn all_of_matches_its_definition_for_every_vector() {
        for strict in [false, true] {
            for v in vectors(3) {
                let has = |x| v.contains(&x);
                let expected = if has(Verdict::Fail) || (strict && has(Verdict::Unsupported)) {
                    ApprovalState::Error
                } else if v.iter().all(|x| *x == Verdict::Satisfied) {
                    ApprovalState::Satisfied
                } else {
                    ApprovalState::Pending
                };
                assert_eq!(aggregate(ApprovalMode::AllOf, &v, strict), expected, "{v:?}");
            }
        }
    }

    #[test]
    fn any_of_matches_its_definition_for_every_vector() {
        for strict in [false, true] {
            for v in vectors(3) {
                let expected = if v.contains(&Verdict::Satisfied) {
                    ApprovalState::Satisfied
                } else if strict
                    && v.iter()
                        .all(|x| matches!(x, Verdict::Fail | Verdict::Unsupported))
                {
                    ApprovalState::Error
                } else {
                    ApprovalState::Pending
                };
                assert_eq!(aggregate(ApprovalMode::AnyOf, &v, strict), expected, "{v:?}");
            }
        }
    }

    #[test]
    fn non_strict_unsupported_never_yields_satisfied() {
        let v = [Verdict::Unsupported, Verdict::Unsupported];
        assert_eq!(
            aggregate(ApprovalMode::AllOf, &v, false),
            ApprovalState::Pending
        );
        assert_eq!(
            aggregate(ApprovalMode::AnyOf, &v, false),
            ApprovalState::Pending
        );
    }

    #[test]
    fn missing_provider_is_unsupported_and_failures_are_contained() {
        let mut registry = ProviderRegistry::new();
        registry.register("ok", Arc::new(Fixed(Verdict::Satisfied)));
        registry.register("broken", Arc::new(Failing));
        registry.register("buggy", Arc::new(Panicking));
        let policy = ApprovalPolicy {
            mode: ApprovalMode::AnyOf,
            rules: vec![
                ApprovalRule::new("missing"),
                ApprovalRule::new("broken"),
                ApprovalRule::new("buggy"),
                ApprovalRule::new("ok"),
            ],
        };

        let evaluation = evaluate(&policy, &registry, "task-1", true);

        let verdicts: Vec<Verdict> = evaluation.verdicts.iter().map(|v| v.verdict).collect();
        assert_eq!(
            verdicts,
            vec![
                Verdict::Unsupported,
                Verdict::Fail,
                Verdict::Fail,
                Verdict::Satisfied
            ]
        );
        assert_eq!(evaluation.state, ApprovalState::Satisfied);
    }

    #[test]
    fn policy_parses_with_opaque_rule_fields() {
        let policy = ApprovalPolicy::from_value(&json!({
            "mode": "allOf",
            "rules": [{"provider": "manual", "min": 2}, {"provider": "checks"}]
        }))
        .expect("valid policy");
        assert_eq!(policy.mode, ApprovalMode::AllOf);
        assert_eq!(policy.rules[0].fields.get("min"), Some(&json!(2)));
        assert!(policy.rules[1].fields.is_empty());
    }

    #[test]
    fn policy_validation_rejects_bad_shapes() {
        let bad_name = json!({"mode": "allOf", "rules": [{"provider": "no spaces"}]});
        let too_long = json!({"mode": "allOf", "rules": [{"provider": "x".repeat(65)}]});
        let no_rules = json!({"mode": "anyOf", "rules": []});
        let too_many = json!({"mode": "anyOf", "rules": vec![json!({"provider": "a"}); 17]});
        let bad_mode = json!({"mode": "oneOf", "rules": [{"provider": "a"}]});
        for value in [bad_name, too_long, no_rules, too_many, bad_mode] {
            let err = ApprovalPolicy::from_value(&value).expect_err("invalid");
            assert!(matches!(err, PolicyError::Schema(_)), "{value}");
        }
    }

    #[test]
    fn embedded_schema_is_compiled_once_and_shared() {
        let first = POLICY_VALIDATOR.as_ref().expect("schema compiles");
        for _ in 0..3 {
            ApprovalPolicy::from_value(&json!({"mode": "anyOf", "rules": [{"provider": "a"}]}))
                .expect("valid policy");
        }
        let second = POLICY_VALIDATOR.as_ref().expect("schema compiles");
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn task_policy_without_approvals_has_no_policy() {
        let mut map = Map::new();
        map.insert("labels".to_string(), json!(["bot"]));
        assert!(ApprovalPolicy::from_task_policy(&map).expect("ok").is_none());
    }
}
