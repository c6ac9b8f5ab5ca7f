//! Branch-name derivation and collision candidates.

use std::sync::LazyLock;

use regex::Regex;

/// Maximum length of a derived branch name (before any collision suffix).
pub const MAX_BRANCH_LEN: usize = 64;

const SLUG_LEN: usize = 40;

static INVALID_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9._/-]+").expect("valid branch regex"));
static DASH_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-{2,}").expect("valid regex"));

/// Derive the branch name for a run: `<prefix>/<agent>/<slug of first prompt line>`.
///
/// Falls back to `<prefix>/run-<run id>` when the prompt yields no usable slug.
pub fn branch_name(prefix: &str, agent_id: &str, prompt: &str, run_id: &str) -> String {
    let first_line = prompt.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let slug = truncate(&sanitize_component(first_line), SLUG_LEN);
    let prefix = sanitize_branch(prefix);
    let agent = sanitize_component(agent_id);

    let candidate = if slug.is_empty() {
        String::new()
    } else if agent.is_empty() {
        format!("{prefix}/{slug}")
    } else {
        format!("{prefix}/{agent}/{slug}")
    };
    let candidate = sanitize_branch(&candidate);
    if candidate.is_empty() || candidate == prefix {
        return sanitize_branch(&format!("{prefix}/run-{}", sanitize_component(run_id)));
    }
    candidate
}

/// Sanitize a full (possibly `/`-separated) branch name.
pub fn sanitize_branch(raw: &str) -> String {
    let segments: Vec<String> = raw
        .split('/')
        .map(sanitize_component)
        .filter(|s| !s.is_empty())
        .collect();
    let mut joined = segments.join("/");
    if joined.len() > MAX_BRANCH_LEN {
        joined = truncate(&joined, MAX_BRANCH_LEN);
    }
    joined
}

fn sanitize_component(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase().replace('/', "-");
    let replaced = INVALID_CHARS.replace_all(&lowered, "-");
    let collapsed = DASH_RUNS.replace_all(&replaced, "-");
    let mut out = collapsed.into_owned();
    while out.contains("..") {
        out = out.replace("..", ".");
    }
    while out.ends_with(".lock") {
        out.truncate(out.len() - ".lock".len());
    }
    out.trim_matches(|c| c == '-' || c == '.' || c == '/')
        .to_string()
}

fn truncate(raw: &str, max: usize) -> String {
    let cut: String = raw.chars().take(max).collect();
    cut.trim_end_matches(|c| c == '-' || c == '.' || c == '/')
        .to_string()
}

/// Candidate names in the order they are tried: `name`, `name-2`, ..., `name-<max>`.
pub fn collision_candidates(name: &str, max_attempts: usize) -> impl Iterator<Item = String> + '_ {
    (1..=max_attempts).map(move |n| {
        if n == 1 {
            name.to_string()
        } else {
            format!("{name}-{n}")
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_name_from_agent_and_prompt() {
        let name = branch_name("agent", "Codex", "Fix the Login bug!\nmore detail", "r1");
        assert_eq!(name, "agent/codex/fix-the-login-bug");
    }

    #[test]
    fn falls_back_to_run_id_for_empty_prompt() {
        assert_eq!(branch_name("agent", "codex", "  \n", "abc123"), "agent/run-abc123");
        assert_eq!(branch_name("agent", "codex", "!!!", "abc123"), "agent/run-abc123");
    }

    #[test]
    fn strips_git_hostile_sequences() {
        assert_eq!(sanitize_branch("/feature/../x.lock/"), "feature/x");
        assert_eq!(sanitize_branch("a b\tc"), "a-b-c");
        assert_eq!(sanitize_branch("-lead.trail-"), "lead.trail");
    }

    #[test]
    fn caps_length() {
        let long = "word ".repeat(40);
        let name = branch_name("agent", "codex", &long, "r1");
        assert!(name.len() <= MAX_BRANCH_LEN, "{name}");
        assert!(!name.ends_with('-'));
    }

    #[test]
    fn candidates_follow_suffix_order() {
        let names: Vec<String> = collision_candidates("agent/x", 3).collect();
        assert_eq!(names, vec!["agent/x", "agent/x-2", "agent/x-3"]);
        assert_eq!(collision_candidates("agent/x", 0).count(), 0);
    }
}
