//! Composition of run patches into pushed branches and change requests.
//!
//! The composer subscribes to `runs.<id>.patch` and `runs.<id>.status` for
//! every attached run. On a status in the configured allow-set it builds a
//! fresh workspace, applies the latest patch for the run, commits, pushes a
//! collision-free branch and optionally opens a change request.
//!
//! A run is composed at most once: the composed guard is set before the
//! attempt starts and rolled back if the attempt fails, so a later status
//! signal can retry.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::branch::{branch_name, collision_candidates};
use crate::core::patch::{Eol, Patch, PatchOptions};
use crate::core::remote::parse_hosted_remote;
use crate::core::subjects;
use crate::core::types::{LogLine, PrRef, Run, RunStatus, StatusPayload};
use crate::io::bus::{Bus, Message, Subscription, handler};
use crate::io::config::{ComposeConfig, HostConfig};
use crate::io::git::{CommitAuthor, Vcs};
use crate::io::host::{HostApi, PullRequestRequest};
use crate::io::patch::{ApplyReport, apply_patch};
use crate::io::store::RunRepository;

/// Name of the remote configured in composer workspaces.
pub const REMOTE_NAME: &str = "origin";

const COMMIT_TEMPLATE: &str = include_str!("templates/commit.txt");
const PULL_REQUEST_TEMPLATE: &str = include_str!("templates/pull_request.md");
const TITLE_LEN: usize = 72;

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("no free branch name for '{name}' after {attempts} attempts")]
    BranchCollisionLimit { name: String, attempts: usize },

    #[error("compose remote_url is not configured")]
    MissingRemote,

    #[error("patch produced no changes to commit")]
    NoChanges,
}

/// Composer settings, resolved from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeSettings {
    pub on_status: BTreeSet<RunStatus>,
    pub remote_url: String,
    pub base_branch: String,
    pub dry_run: bool,
    pub branch_prefix: String,
    pub max_branch_attempts: usize,
    pub eol: Eol,
    pub author: Option<CommitAuthor>,
    pub draft: bool,
}

impl ComposeSettings {
    pub fn new(remote_url: impl Into<String>) -> Self {
        Self::from_config(
            &ComposeConfig {
                remote_url: remote_url.into(),
                ..ComposeConfig::default()
            },
            &HostConfig::default(),
        )
    }

    pub fn from_config(compose: &ComposeConfig, host: &HostConfig) -> Self {
        Self {
            on_status: compose.on_status.iter().copied().collect(),
            remote_url: compose.remote_url.trim().to_string(),
            base_branch: compose.base_branch.clone(),
            dry_run: compose.dry_run,
            branch_prefix: compose.branch_prefix.clone(),
            max_branch_attempts: compose.max_branch_attempts,
            eol: compose.eol,
            author: compose.author(),
            draft: host.draft,
        }
    }
}

/// Per-composer memory of observed patches and composed runs.
///
/// Entries are never evicted; they live as long as the composer.
#[derive(Debug, Default)]
pub struct ComposeState {
    patches: HashMap<String, Patch>,
    composed: HashSet<String>,
}

impl ComposeState {
    /// Record the latest patch for a run (last write wins).
    pub fn record_patch(&mut self, run_id: &str, patch: Patch) {
        self.patches.insert(run_id.to_string(), patch);
    }

    pub fn latest_patch(&self, run_id: &str) -> Option<&Patch> {
        self.patches.get(run_id)
    }

    pub fn is_composed(&self, run_id: &str) -> bool {
        self.composed.contains(run_id)
    }

    /// Take the guard for `run_id` and return the patch to compose, or `None`
    /// when the run was already composed or has no patch yet.
    fn begin(&mut self, run_id: &str) -> Option<Patch> {
        if self.composed.contains(run_id) {
            return None;
        }
        let patch = self.patches.get(run_id)?.clone();
        self.composed.insert(run_id.to_string());
        Some(patch)
    }

    fn rollback(&mut self, run_id: &str) {
        self.composed.remove(run_id);
    }
}

/// Collaborators injected into a [`Composer`].
pub struct ComposerDeps {
    pub bus: Arc<dyn Bus>,
    pub runs: Arc<RunRepository>,
    pub vcs: Arc<dyn Vcs>,
    pub host: Arc<dyn HostApi>,
    pub state: ComposeState,
}

struct Templates {
    env: Environment<'static>,
}

impl Templates {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("commit.txt", COMMIT_TEMPLATE)
            .context("commit template")?;
        env.add_template("pull_request.md", PULL_REQUEST_TEMPLATE)
            .context("pull request template")?;
        Ok(Self { env })
    }

    fn commit_message(&self, run: &Run) -> Result<String> {
        let rendered = self.env.get_template("commit.txt")?.render(context! {
            title => change_title(run),
            run_id => &run.id,
            agent_id => &run.agent_id,
        })?;
        Ok(rendered)
    }

    fn pull_request_body(&self, run: &Run, report: &ApplyReport) -> Result<String> {
        let rendered = self.env.get_template("pull_request.md")?.render(context! {
            run_id => &run.id,
            agent_id => &run.agent_id,
            prompt => (!run.prompt.trim().is_empty()).then(|| run.prompt.trim()),
            changed => report.changed_paths(),
            skipped => &report.skipped,
        })?;
        Ok(rendered)
    }
}

struct Inner {
    bus: Arc<dyn Bus>,
    runs: Arc<RunRepository>,
    vcs: Arc<dyn Vcs>,
    host: Arc<dyn HostApi>,
    settings: ComposeSettings,
    templates: Templates,
    state: Mutex<ComposeState>,
    attached: Mutex<HashMap<String, Vec<Subscription>>>,
}

/// Turns run patches into branches. Cheap to clone.
#[derive(Clone)]
pub struct Composer {
    inner: Arc<Inner>,
}

impl Composer {
    pub fn new(deps: ComposerDeps, settings: ComposeSettings) -> Result<Self> {
        if settings.remote_url.is_empty() {
            return Err(ComposeError::MissingRemote.into());
        }
        Ok(Self {
            inner: Arc::new(Inner {
                bus: deps.bus,
                runs: deps.runs,
                vcs: deps.vcs,
                host: deps.host,
                settings,
                templates: Templates::new()?,
                state: Mutex::new(deps.state),
                attached: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn settings(&self) -> &ComposeSettings {
        &self.inner.settings
    }

    fn state(&self) -> MutexGuard<'_, ComposeState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_composed(&self, run_id: &str) -> bool {
        self.state().is_composed(run_id)
    }

    pub fn has_patch(&self, run_id: &str) -> bool {
        self.state().latest_patch(run_id).is_some()
    }

    /// Subscribe to the run's patch and status subjects. Idempotent.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub async fn attach(&self, run_id: &str) -> Result<()> {
        if self.is_attached(run_id) {
            return Ok(());
        }
        let patch_sub = {
            let this = self.clone();
            let run = run_id.to_string();
            self.inner
                .bus
                .subscribe(
                    &subjects::run_patch(run_id),
                    handler(move |message: Message| {
                        let this = this.clone();
                        let run = run.clone();
                        async move { this.on_patch(&run, message) }
                    }),
                )
                .await
                .context("subscribe to run patches")?
        };
        let status_sub = {
            let this = self.clone();
            let run = run_id.to_string();
            self.inner
                .bus
                .subscribe(
                    &subjects::run_status(run_id),
                    handler(move |message: Message| {
                        let this = this.clone();
                        let run = run.clone();
                        async move { this.on_status(&run, message).await }
                    }),
                )
                .await
                .context("subscribe to run status")?
        };

        let duplicate = {
            let mut attached = self
                .inner
                .attached
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if attached.contains_key(run_id) {
                Some(vec![patch_sub, status_sub])
            } else {
                attached.insert(run_id.to_string(), vec![patch_sub, status_sub]);
                None
            }
        };
        drop(duplicate);
        debug!("composer attached");
        Ok(())
    }

    /// Drop the run's subscriptions. Observed state is kept.
    pub fn detach(&self, run_id: &str) {
        let removed = self
            .inner
            .attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id);
        drop(removed);
    }

    pub fn is_attached(&self, run_id: &str) -> bool {
        self.inner
            .attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(run_id)
    }

    fn on_patch(&self, run_id: &str, message: Message) -> Result<()> {
        let patch: Patch =
            serde_json::from_value(message.payload).context("decode patch payload")?;
        self.state().record_patch(run_id, patch);
        debug!(run_id, "patch recorded");
        Ok(())
    }

    async fn on_status(&self, run_id: &str, message: Message) -> Result<()> {
        let status: StatusPayload =
            serde_json::from_value(message.payload).context("decode status payload")?;
        if !self.inner.settings.on_status.contains(&status.state) {
            return Ok(());
        }
        let Some(patch) = self.state().begin(run_id) else {
            debug!(run_id, "nothing to compose");
            return Ok(());
        };
        self.compose_guarded(run_id, &patch).await;
        Ok(())
    }

    async fn compose_guarded(&self, run_id: &str, patch: &Patch) {
        match self.compose(run_id, patch).await {
            Ok(pr) => {
                let message = match &pr.url {
                    Some(url) => format!("composed branch {} ({url})", pr.branch),
                    None => format!("composed branch {}", pr.branch),
                };
                info!(run_id, branch = %pr.branch, "run composed");
                self.inner.runs.update(run_id, |run| {
                    run.pr = Some(pr);
                    run.compose_error = None;
                });
                self.log(run_id, LogLine::info(message)).await;
            }
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(run_id, error = %reason, "compose failed");
                self.inner.runs.update(run_id, |run| {
                    run.compose_error = Some(reason.clone());
                });
                self.state().rollback(run_id);
                self.log(run_id, LogLine::error(format!("compose failed: {reason}")))
                    .await;
            }
        }
    }

    #[instrument(skip_all, fields(run_id = %run_id))]
    async fn compose(&self, run_id: &str, patch: &Patch) -> Result<PrRef> {
        let settings = &self.inner.settings;
        let vcs = self.inner.vcs.as_ref();
        let run = self.inner.runs.require(run_id)?;
        let base = if run.base.trim().is_empty() {
            settings.base_branch.clone()
        } else {
            run.base.clone()
        };

        let workspace = tempfile::Builder::new()
            .prefix("foreman-compose-")
            .tempdir()
            .context("create compose workspace")?;
        let dir = workspace.path();

        vcs.init(dir).await?;
        vcs.add_remote(dir, REMOTE_NAME, &settings.remote_url)
            .await?;
        let checkout = vcs.checkout_base(dir, REMOTE_NAME, &base).await?;
        debug!(base = %base, checkout = ?checkout, "base ready");

        let wanted = branch_name(&settings.branch_prefix, &run.agent_id, &run.prompt, &run.id);
        let branch =
            resolve_branch_name(vcs, dir, REMOTE_NAME, &wanted, settings.max_branch_attempts)
                .await?;
        vcs.create_branch(dir, &branch).await?;

        let mut opts = PatchOptions::new(dir);
        opts.atomic = true;
        opts.eol = settings.eol;
        let report = apply_patch(patch, &opts).await.context("apply patch")?;

        let message = self.inner.templates.commit_message(&run)?;
        if !vcs.commit(dir, &message, settings.author.as_ref()).await? {
            return Err(ComposeError::NoChanges.into());
        }

        if settings.dry_run {
            info!(branch = %branch, "dry run: skipping push and change request");
            return Ok(PrRef {
                branch,
                number: None,
                url: None,
            });
        }

        vcs.push(dir, REMOTE_NAME, &branch).await?;
        let mut pr = PrRef {
            branch,
            number: None,
            url: None,
        };
        self.open_change_request(&run, &base, &report, &mut pr)
            .await?;
        Ok(pr)
    }

    async fn open_change_request(
        &self,
        run: &Run,
        base: &str,
        report: &ApplyReport,
        pr: &mut PrRef,
    ) -> Result<()> {
        let Some(hosted) = parse_hosted_remote(&self.inner.settings.remote_url) else {
            warn!(run_id = %run.id, "remote is not a hosted repository; skipping change request");
            return Ok(());
        };
        if !self.inner.host.has_credentials() {
            warn!(run_id = %run.id, "no host credentials; skipping change request");
            return Ok(());
        }
        let request = PullRequestRequest {
            owner: hosted.owner,
            repo: hosted.repo,
            title: change_title(run),
            head: pr.branch.clone(),
            base: base.to_string(),
            body: self.inner.templates.pull_request_body(run, report)?,
            draft: self.inner.settings.draft,
        };
        let created = self
            .inner
            .host
            .create_pull_request(&request)
            .await
            .context("create change request")?;
        pr.number = Some(created.number);
        pr.url = Some(created.url);
        Ok(())
    }

    async fn log(&self, run_id: &str, line: LogLine) {
        let payload = match serde_json::to_value(&line) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(run_id, error = %err, "encode log line");
                return;
            }
        };
        if let Err(err) = self
            .inner
            .bus
            .publish(&subjects::run_logs(run_id), payload)
            .await
        {
            warn!(run_id, error = %err, "publish log line");
        }
    }
}

/// Try `name`, `name-2`, ... on `remote` and return the first free name.
pub async fn resolve_branch_name(
    vcs: &dyn Vcs,
    dir: &Path,
    remote: &str,
    name: &str,
    max_attempts: usize,
) -> Result<String> {
    for candidate in collision_candidates(name, max_attempts) {
        if !vcs.remote_branch_exists(dir, remote, &candidate).await? {
            return Ok(candidate);
        }
        debug!(candidate = %candidate, "branch exists; trying next");
    }
    Err(ComposeError::BranchCollisionLimit {
        name: name.to_string(),
        attempts: max_attempts,
    }
    .into())
}

fn change_title(run: &Run) -> String {
    let first = run
        .prompt
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty());
    match first {
        Some(line) if line.chars().count() > TITLE_LEN => {
            let cut: String = line.chars().take(TITLE_LEN - 3).collect();
            format!("{}...", cut.trim_end())
        }
        Some(line) => line.to_string(),
        None => format!("Apply changes from run {}", run.id),
    }
}
