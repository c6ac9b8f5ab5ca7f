//! Deterministic patch planning.
//!
//! A [`Patch`] is normalized into a canonical operation list, every path is
//! sanitized against the workspace root, and the resulting [`PatchPlan`] has a
//! fixed order that does not depend on input order:
//!
//! - deletes: deepest path first (segment count descending, then lexicographic)
//! - renames: deepest source first (same key on `from`, then `to`)
//! - writes: lexicographic by path
//!
//! Planning performs no I/O. Filesystem execution lives in `io::patch`.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Line-ending policy for written content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Eol {
    Lf,
    Crlf,
    #[default]
    None,
}

impl Eol {
    /// Normalize `content` according to this policy.
    pub fn apply(self, content: &str) -> Cow<'_, str> {
        match self {
            Eol::None => Cow::Borrowed(content),
            Eol::Lf => {
                if content.contains("\r\n") {
                    Cow::Owned(content.replace("\r\n", "\n"))
                } else {
                    Cow::Borrowed(content)
                }
            }
            Eol::Crlf => Cow::Owned(content.replace("\r\n", "\n").replace('\n', "\r\n")),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "lf" => Some(Eol::Lf),
            "crlf" => Some(Eol::Crlf),
            "none" => Some(Eol::None),
            _ => None,
        }
    }
}

/// Flat-form file write (`{files:[{path, content, eol?}]}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWrite {
    pub path: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eol: Option<Eol>,
}

/// One operation of the canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PatchOp {
    Write {
        path: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        eol: Option<Eol>,
    },
    Delete {
        path: String,
    },
    Rename {
        from: String,
        to: String,
    },
}

/// A structured description of filesystem mutations.
///
/// The flat `files` list is shorthand for a list of write operations; both
/// shapes are normalized through [`Patch::to_ops`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPatch", into = "RawPatch")]
pub enum Patch {
    Files(Vec<FileWrite>),
    Ops(Vec<PatchOp>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    files: Option<Vec<FileWrite>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ops: Option<Vec<PatchOp>>,
}

impl TryFrom<RawPatch> for Patch {
    type Error = String;

    fn try_from(raw: RawPatch) -> Result<Self, Self::Error> {
        match (raw.files, raw.ops) {
            (Some(files), None) => Ok(Patch::Files(files)),
            (None, Some(ops)) => Ok(Patch::Ops(ops)),
            (Some(_), Some(_)) => Err("patch must not contain both `files` and `ops`".to_string()),
            (None, None) => Err("patch must contain `files` or `ops`".to_string()),
        }
    }
}

impl From<Patch> for RawPatch {
    fn from(patch: Patch) -> Self {
        match patch {
            Patch::Files(files) => RawPatch {
                files: Some(files),
                ops: None,
            },
            Patch::Ops(ops) => RawPatch {
                files: None,
                ops: Some(ops),
            },
        }
    }
}

impl Patch {
    /// Canonical operation list for this patch.
    pub fn to_ops(&self) -> Vec<PatchOp> {
        match self {
            Patch::Files(files) => files
                .iter()
                .map(|file| PatchOp::Write {
                    path: file.path.clone(),
                    content: file.content.clone(),
                    eol: file.eol,
                })
                .collect(),
            Patch::Ops(ops) => ops.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Patch::Files(files) => files.is_empty(),
            Patch::Ops(ops) => ops.is_empty(),
        }
    }
}

/// Errors raised while planning or applying a patch.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("unsafe path '{path}': {reason}")]
    UnsafePath { path: String, reason: &'static str },

    #[error("duplicate target '{path}' in patch")]
    DuplicateTarget { path: String },

    #[error("rename source '{path}' does not exist")]
    MissingSource { path: String },

    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Options shared by planning and application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOptions {
    /// Workspace root every path is resolved against.
    pub root: PathBuf,
    /// Default EOL policy; a per-operation `eol` takes precedence.
    pub eol: Eol,
    /// When false, conflicting writes/renames are skipped and recorded.
    pub overwrite: bool,
    /// Write through a temporary sibling file and rename into place.
    pub atomic: bool,
    /// Compute the plan and simulated results without touching the filesystem.
    pub dry_run: bool,
}

impl PatchOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            eol: Eol::None,
            overwrite: true,
            atomic: false,
            dry_run: false,
        }
    }
}

/// A sanitized write ready for execution (content already EOL-normalized).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedWrite {
    pub path: String,
    pub content: String,
    pub eol: Eol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedRename {
    pub from: String,
    pub to: String,
}

/// Concrete, ordered execution plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PatchPlan {
    pub deletes: Vec<String>,
    pub renames: Vec<PlannedRename>,
    pub writes: Vec<PlannedWrite>,
}

impl PatchPlan {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.renames.is_empty() && self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deletes.len() + self.renames.len() + self.writes.len()
    }
}

/// Build the deterministic plan for `patch`.
///
/// Aborts on the first unsafe path. Duplicate write/rename targets and
/// duplicate rename sources are rejected because their outcome would depend on
/// input order.
pub fn plan_patch(patch: &Patch, opts: &PatchOptions) -> Result<PatchPlan, PatchError> {
    let mut plan = PatchPlan::default();
    let mut targets = BTreeSet::new();
    let mut sources = BTreeSet::new();

    for op in patch.to_ops() {
        match op {
            PatchOp::Write { path, content, eol } => {
                let path = sanitize_path(&opts.root, &path)?;
                if !targets.insert(path.clone()) {
                    return Err(PatchError::DuplicateTarget { path });
                }
                let eol = eol.unwrap_or(opts.eol);
                let content = eol.apply(&content).into_owned();
                plan.writes.push(PlannedWrite { path, content, eol });
            }
            PatchOp::Delete { path } => {
                let path = sanitize_path(&opts.root, &path)?;
                plan.deletes.push(path);
            }
            PatchOp::Rename { from, to } => {
                let from = sanitize_path(&opts.root, &from)?;
                let to = sanitize_path(&opts.root, &to)?;
                if !sources.insert(from.clone()) {
                    return Err(PatchError::DuplicateTarget { path: from });
                }
                if !targets.insert(to.clone()) {
                    return Err(PatchError::DuplicateTarget { path: to });
                }
                plan.renames.push(PlannedRename { from, to });
            }
        }
    }

    plan.deletes.sort_by(|a, b| deepest_first(a, b));
    plan.deletes.dedup();
    plan.renames
        .sort_by(|a, b| deepest_first(&a.from, &b.from).then_with(|| a.to.cmp(&b.to)));
    plan.writes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(plan)
}

/// Validate a relative patch path and return its normalized `/`-joined form.
pub fn sanitize_path(root: &Path, raw: &str) -> Result<String, PatchError> {
    let unsafe_path = |reason| PatchError::UnsafePath {
        path: raw.to_string(),
        reason,
    };

    if raw.is_empty() {
        return Err(unsafe_path("empty path"));
    }
    if raw.contains('\0') {
        return Err(unsafe_path("contains NUL byte"));
    }
    let normalized = raw.replace('\\', "/");
    if normalized.starts_with('/') || has_drive_prefix(&normalized) || Path::new(raw).is_absolute()
    {
        return Err(unsafe_path("absolute path"));
    }

    let mut segments = Vec::new();
    for segment in normalized.split('/') {
        match segment {
            "" => return Err(unsafe_path("empty segment")),
            "." | ".." => return Err(unsafe_path("illegal segment")),
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    let resolved = root.join(&joined);
    let escapes = !resolved.starts_with(root)
        || resolved
            .components()
            .skip(root.components().count())
            .any(|component| !matches!(component, Component::Normal(_)));
    if escapes {
        return Err(unsafe_path("resolves outside workspace root"));
    }
    Ok(joined)
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn segment_count(path: &str) -> usize {
    path.split('/').count()
}

fn deepest_first(a: &str, b: &str) -> std::cmp::Ordering {
    segment_count(b)
        .cmp(&segment_count(a))
        .then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opts() -> PatchOptions {
        PatchOptions::new("/workspace")
    }

    fn write(path: &str, content: &str) -> PatchOp {
        PatchOp::Write {
            path: path.to_string(),
            content: content.to_string(),
            eol: None,
        }
    }

    fn delete(path: &str) -> PatchOp {
        PatchOp::Delete {
            path: path.to_string(),
        }
    }

    fn rename(from: &str, to: &str) -> PatchOp {
        PatchOp::Rename {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    fn permutations(items: &[PatchOp]) -> Vec<Vec<PatchOp>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn flat_files_normalize_to_write_ops() {
        let patch: Patch = serde_json::from_value(json!({
            "files": [{"path": "a.txt", "content": "x", "eol": "lf"}]
        }))
        .expect("parse");
        assert_eq!(
            patch.to_ops(),
            vec![PatchOp::Write {
                path: "a.txt".to_string(),
                content: "x".to_string(),
                eol: Some(Eol::Lf),
            }]
        );
    }

    #[test]
    fn files_and_ops_are_mutually_exclusive() {
        let both = json!({"files": [], "ops": []});
        assert!(serde_json::from_value::<Patch>(both).is_err());
        assert!(serde_json::from_value::<Patch>(json!({})).is_err());
    }

    #[test]
    fn ops_parse_by_kind() {
        let patch: Patch = serde_json::from_value(json!({
            "ops": [
                {"kind": "write", "path": "a", "content": "1"},
                {"kind": "delete", "path": "b"},
                {"kind": "rename", "from": "c", "to": "d"}
            ]
        }))
        .expect("parse");
        assert_eq!(
            patch.to_ops(),
            vec![write("a", "1"), delete("b"), rename("c", "d")]
        );
    }

    #[test]
    fn sanitize_rejects_unsafe_paths() {
        let root = Path::new("/workspace");
        for raw in [
            "", "/etc/passwd", "\\share", "C:/x", "a//b", "a/./b", "../x", "a/../../x", "a/",
        ] {
            let err = sanitize_path(root, raw).expect_err(raw);
            assert!(matches!(err, PatchError::UnsafePath { .. }), "{raw}");
        }
    }

    #[test]
    fn sanitize_normalizes_backslashes() {
        let root = Path::new("/workspace");
        assert_eq!(sanitize_path(root, "src\\lib.rs").expect("safe"), "src/lib.rs");
    }

    #[test]
    fn planning_aborts_on_first_unsafe_path() {
        let patch = Patch::Ops(vec![write("ok.txt", "1"), delete("../escape")]);
        let err = plan_patch(&patch, &opts()).expect_err("unsafe");
        assert!(err.to_string().contains("../escape"));
    }

    #[test]
    fn plan_orders_each_phase() {
        let patch = Patch::Ops(vec![
            write("b.txt", "b"),
            delete("dir"),
            rename("x/y", "z"),
            delete("dir/sub/file"),
            write("a.txt", "a"),
            delete("dir/sub"),
            rename("x/y/z/w", "q"),
            delete("alpha/beta"),
        ]);
        let plan = plan_patch(&patch, &opts()).expect("plan");
        assert_eq!(
            plan.deletes,
            vec!["dir/sub/file", "alpha/beta", "dir/sub", "dir"]
        );
        let renames: Vec<&str> = plan.renames.iter().map(|r| r.from.as_str()).collect();
        assert_eq!(renames, vec!["x/y/z/w", "x/y"]);
        let writes: Vec<&str> = plan.writes.iter().map(|w| w.path.as_str()).collect();
        assert_eq!(writes, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn plan_is_permutation_invariant() {
        let ops = vec![
            write("src/main.rs", "fn main() {}\n"),
            delete("old/nested/file.txt"),
            rename("docs/a.md", "docs/b.md"),
            write("README.md", "hi\n"),
        ];
        let expected = plan_patch(&Patch::Ops(ops.clone()), &opts()).expect("plan");
        for permutation in permutations(&ops) {
            let plan = plan_patch(&Patch::Ops(permutation), &opts()).expect("plan");
            assert_eq!(plan, expected);
        }
    }

    #[test]
    fn duplicate_targets_are_rejected() {
        let patch = Patch::Ops(vec![write("a", "1"), rename("b", "a")]);
        assert!(matches!(
            plan_patch(&patch, &opts()),
            Err(PatchError::DuplicateTarget { .. })
        ));
    }

    #[test]
    fn per_operation_eol_overrides_default() {
        let patch = Patch::Ops(vec![
            PatchOp::Write {
                path: "crlf.txt".to_string(),
                content: "a\r\nb\n".to_string(),
                eol: Some(Eol::Crlf),
            },
            write("lf.txt", "a\r\nb\r\n"),
        ]);
        let mut options = opts();
        options.eol = Eol::Lf;
        let plan = plan_patch(&patch, &options).expect("plan");
        assert_eq!(plan.writes[0].content, "a\r\nb\r\n");
        assert_eq!(plan.writes[1].content, "a\nb\n");
    }

    #[test]
    fn eol_policies_normalize_content() {
        assert_eq!(Eol::Lf.apply("a\r\nb\n"), "a\nb\n");
        assert_eq!(Eol::Crlf.apply("a\r\nb\n"), "a\r\nb\r\n");
        assert_eq!(Eol::None.apply("a\r\nb\n"), "a\r\nb\n");
    }
}
