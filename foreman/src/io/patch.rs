//! Filesystem execution of a [`PatchPlan`].
//!
//! Operations run in three phases: deletes, then renames, then writes. Every
//! path is validated, on paper and on disk, before the first mutation, so a
//! rejected patch leaves the workspace untouched.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::core::patch::{Patch, PatchError, PatchOptions, PatchPlan, PlannedRename, plan_patch};

/// An operation that was not applied, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedOp {
    pub op: &'static str,
    pub path: String,
    pub reason: &'static str,
}

/// Result of applying (or simulating) a patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub plan: PatchPlan,
    pub deleted: Vec<String>,
    pub renamed: Vec<PlannedRename>,
    pub written: Vec<String>,
    pub skipped: Vec<SkippedOp>,
    pub dry_run: bool,
}

impl ApplyReport {
    fn new(plan: PatchPlan, dry_run: bool) -> Self {
        Self {
            plan,
            deleted: Vec::new(),
            renamed: Vec::new(),
            written: Vec::new(),
            skipped: Vec::new(),
            dry_run,
        }
    }

    /// Paths touched by the patch, deduplicated and sorted.
    pub fn changed_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .deleted
            .iter()
            .cloned()
            .chain(
                self.renamed
                    .iter()
                    .flat_map(|r| [r.from.clone(), r.to.clone()]),
            )
            .chain(self.written.iter().cloned())
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }
}

/// Existence view of the workspace. In dry-run mode mutations are recorded in
/// an overlay instead of the filesystem.
struct Workspace<'a> {
    root: &'a Path,
    dry_run: bool,
    overlay: HashMap<String, bool>,
}

impl<'a> Workspace<'a> {
    fn new(root: &'a Path, dry_run: bool) -> Self {
        Self {
            root,
            dry_run,
            overlay: HashMap::new(),
        }
    }

    fn abs(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    async fn exists(&self, rel: &str) -> Result<bool, PatchError> {
        if self.dry_run {
            if let Some(known) = self.overlay_lookup(rel) {
                return Ok(known);
            }
        }
        match tokio::fs::symlink_metadata(self.abs(rel)).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(io_error("inspect", rel, source)),
        }
    }

    /// Overlay state for `rel`, or for the nearest ancestor that was removed.
    fn overlay_lookup(&self, rel: &str) -> Option<bool> {
        if let Some(known) = self.overlay.get(rel) {
            return Some(*known);
        }
        let mut ancestor = rel;
        while let Some((parent, _)) = ancestor.rsplit_once('/') {
            if self.overlay.get(parent) == Some(&false) {
                return Some(false);
            }
            ancestor = parent;
        }
        None
    }

    fn mark(&mut self, rel: &str, present: bool) {
        self.overlay.insert(rel.to_string(), present);
    }
}

fn io_error(action: &'static str, path: &str, source: std::io::Error) -> PatchError {
    PatchError::Io {
        action,
        path: path.to_string(),
        source,
    }
}

/// Plan `patch` and execute it against `opts.root`.
#[instrument(skip_all, fields(root = %opts.root.display(), dry_run = opts.dry_run))]
pub async fn apply_patch(patch: &Patch, opts: &PatchOptions) -> Result<ApplyReport, PatchError> {
    let plan = plan_patch(patch, opts)?;
    execute_plan(plan, opts).await
}

/// Execute an already validated plan.
///
/// Every path is checked against the filesystem and the plan is simulated
/// before the first mutation, so a patch that would traverse a symlink or
/// rename a missing source fails with the workspace untouched.
pub async fn execute_plan(plan: PatchPlan, opts: &PatchOptions) -> Result<ApplyReport, PatchError> {
    confine_plan(&plan, &opts.root).await?;
    if !opts.dry_run {
        run_phases(&plan, opts, true).await?;
    }
    let report = run_phases(&plan, opts, opts.dry_run).await?;
    debug!(
        deleted = report.deleted.len(),
        renamed = report.renamed.len(),
        written = report.written.len(),
        skipped = report.skipped.len(),
        "patch applied"
    );
    Ok(report)
}

async fn run_phases(
    plan: &PatchPlan,
    opts: &PatchOptions,
    dry_run: bool,
) -> Result<ApplyReport, PatchError> {
    let mut ws = Workspace::new(&opts.root, dry_run);
    let mut report = ApplyReport::new(plan.clone(), dry_run);

    for path in &plan.deletes {
        if !ws.exists(path).await? {
            report.skipped.push(SkippedOp {
                op: "delete",
                path: path.clone(),
                reason: "missing",
            });
            continue;
        }
        if !dry_run {
            remove_any(&ws.abs(path), path).await?;
        }
        ws.mark(path, false);
        report.deleted.push(path.clone());
    }

    for rename in &plan.renames {
        if !ws.exists(&rename.from).await? {
            return Err(PatchError::MissingSource {
                path: rename.from.clone(),
            });
        }
        if ws.exists(&rename.to).await? {
            if !opts.overwrite {
                report.skipped.push(SkippedOp {
                    op: "rename",
                    path: rename.to.clone(),
                    reason: "target exists",
                });
                continue;
            }
            if !dry_run {
                remove_any(&ws.abs(&rename.to), &rename.to).await?;
            }
        }
        if !dry_run {
            let to = ws.abs(&rename.to);
            ensure_parent(&to, &rename.to).await?;
            tokio::fs::rename(ws.abs(&rename.from), &to)
                .await
                .map_err(|source| io_error("rename", &rename.from, source))?;
        }
        ws.mark(&rename.from, false);
        ws.mark(&rename.to, true);
        report.renamed.push(rename.clone());
    }

    for write in &plan.writes {
        if !opts.overwrite && ws.exists(&write.path).await? {
            report.skipped.push(SkippedOp {
                op: "write",
                path: write.path.clone(),
                reason: "target exists",
            });
            continue;
        }
        if !dry_run {
            let target = ws.abs(&write.path);
            ensure_parent(&target, &write.path).await?;
            if opts.atomic {
                write_atomic(&target, &write.path, write.content.as_bytes()).await?;
            } else {
                tokio::fs::write(&target, write.content.as_bytes())
                    .await
                    .map_err(|source| io_error("write", &write.path, source))?;
            }
        }
        ws.mark(&write.path, true);
        report.written.push(write.path.clone());
    }

    Ok(report)
}

/// Whether the last component of a path may itself be a symlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leaf {
    /// Deleting a symlink removes the link, not its target.
    MayBeLink,
    MustNotBeLink,
}

async fn confine_plan(plan: &PatchPlan, root: &Path) -> Result<(), PatchError> {
    let canonical_root = match tokio::fs::canonicalize(root).await {
        Ok(path) => path,
        // Nothing exists under a missing root yet.
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(source) => return Err(io_error("resolve", ".", source)),
    };
    for path in &plan.deletes {
        confine(root, &canonical_root, path, Leaf::MayBeLink).await?;
    }
    for rename in &plan.renames {
        confine(root, &canonical_root, &rename.from, Leaf::MustNotBeLink).await?;
        confine(root, &canonical_root, &rename.to, Leaf::MustNotBeLink).await?;
    }
    for write in &plan.writes {
        confine(root, &canonical_root, &write.path, Leaf::MustNotBeLink).await?;
    }
    Ok(())
}

/// Reject `rel` if an existing component below `root` is a symlink, or if its
/// deepest existing ancestor resolves outside `canonical_root`.
async fn confine(
    root: &Path,
    canonical_root: &Path,
    rel: &str,
    leaf: Leaf,
) -> Result<(), PatchError> {
    let segments: Vec<&str> = rel.split('/').collect();
    let mut current = root.to_path_buf();
    let mut deepest = root.to_path_buf();
    for (index, segment) in segments.iter().enumerate() {
        current.push(segment);
        let meta = match tokio::fs::symlink_metadata(&current).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => break,
            Err(source) => return Err(io_error("inspect", rel, source)),
        };
        if meta.file_type().is_symlink() {
            let is_leaf = index + 1 == segments.len();
            if is_leaf && leaf == Leaf::MayBeLink {
                break;
            }
            return Err(PatchError::UnsafePath {
                path: rel.to_string(),
                reason: "traverses a symlink",
            });
        }
        deepest.clone_from(&current);
    }

    let resolved = tokio::fs::canonicalize(&deepest)
        .await
        .map_err(|source| io_error("resolve", rel, source))?;
    if !resolved.starts_with(canonical_root) {
        return Err(PatchError::UnsafePath {
            path: rel.to_string(),
            reason: "resolves outside workspace root",
        });
    }
    Ok(())
}

async fn remove_any(abs: &Path, rel: &str) -> Result<(), PatchError> {
    let meta = tokio::fs::symlink_metadata(abs)
        .await
        .map_err(|source| io_error("inspect", rel, source))?;
    let result = if meta.is_dir() {
        tokio::fs::remove_dir_all(abs).await
    } else {
        tokio::fs::remove_file(abs).await
    };
    result.map_err(|source| io_error("delete", rel, source))
}

async fn ensure_parent(abs: &Path, rel: &str) -> Result<(), PatchError> {
    if let Some(parent) = abs.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| io_error("create parent of", rel, source))?;
    }
    Ok(())
}

/// Write through a temporary sibling, replace the target, then sync the
/// directory. Sync failures are tolerated.
async fn write_atomic(target: &Path, rel: &str, bytes: &[u8]) -> Result<(), PatchError> {
    let parent = target.parent().unwrap_or(Path::new("."));
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{name}.{}.tmp", Uuid::new_v4().simple()));

    let written = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        if let Err(err) = file.sync_all().await {
            debug!(path = %tmp.display(), error = %err, "file sync failed");
        }
        Ok::<(), std::io::Error>(())
    }
    .await;
    if let Err(source) = written {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_error("write", rel, source));
    }

    if tokio::fs::symlink_metadata(target).await.is_ok() {
        if let Err(err) = remove_any(target, rel).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err);
        }
    }
    if let Err(source) = tokio::fs::rename(&tmp, target).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_error("replace", rel, source));
    }

    match tokio::fs::File::open(parent).await {
        Ok(dir) => {
            if let Err(err) = dir.sync_all().await {
                debug!(dir = %parent.display(), error = %err, "directory sync failed");
            }
        }
        Err(err) => debug!(dir = %parent.display(), error = %err, "directory open failed"),
    }
    Ok(())
}
