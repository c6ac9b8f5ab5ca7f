//! Test-only fakes and builders.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value, json};

use crate::composer::{ComposeState, ComposerDeps};
use crate::core::types::{NewTask, Run, RunStatus};
use crate::io::bus::Bus;
use crate::io::git::{BaseCheckout, CommitAuthor, Vcs};
use crate::io::host::{HostApi, PullRequest, PullRequestRequest};
use crate::io::store::RunRepository;

/// Calls observed by [`RecordingVcs`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VcsLog {
    pub remote_branches: BTreeSet<String>,
    pub created_branches: Vec<String>,
    pub commits: Vec<String>,
    pub authors: Vec<Option<CommitAuthor>>,
    pub pushes: Vec<String>,
}

/// In-memory [`Vcs`]: a remote branch set plus a record of every call.
#[derive(Debug, Default)]
pub struct RecordingVcs {
    log: Mutex<VcsLog>,
    failing_pushes: Mutex<usize>,
}

impl RecordingVcs {
    pub fn with_remote_branches<I, S>(branches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let vcs = Self::default();
        vcs.lock()
            .remote_branches
            .extend(branches.into_iter().map(Into::into));
        vcs
    }

    /// Make the next `count` pushes fail.
    pub fn fail_next_pushes(&self, count: usize) {
        *self
            .failing_pushes
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = count;
    }

    pub fn log(&self) -> VcsLog {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VcsLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Vcs for RecordingVcs {
    async fn init(&self, _dir: &Path) -> Result<()> {
        Ok(())
    }

    async fn add_remote(&self, _dir: &Path, _name: &str, _url: &str) -> Result<()> {
        Ok(())
    }

    async fn checkout_base(&self, _dir: &Path, _remote: &str, base: &str) -> Result<BaseCheckout> {
        if self.lock().remote_branches.contains(base) {
            Ok(BaseCheckout::Fetched)
        } else {
            Ok(BaseCheckout::Created)
        }
    }

    async fn create_branch(&self, _dir: &Path, branch: &str) -> Result<()> {
        self.lock().created_branches.push(branch.to_string());
        Ok(())
    }

    async fn commit(
        &self,
        _dir: &Path,
        message: &str,
        author: Option<&CommitAuthor>,
    ) -> Result<bool> {
        let mut log = self.lock();
        log.commits.push(message.to_string());
        log.authors.push(author.cloned());
        Ok(true)
    }

    async fn push(&self, _dir: &Path, _remote: &str, branch: &str) -> Result<()> {
        {
            let mut failing = self
                .failing_pushes
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *failing > 0 {
                *failing -= 1;
                return Err(anyhow!("push rejected: {branch}"));
            }
        }
        let mut log = self.lock();
        log.pushes.push(branch.to_string());
        log.remote_branches.insert(branch.to_string());
        Ok(())
    }

    async fn remote_branch_exists(&self, _dir: &Path, _remote: &str, branch: &str) -> Result<bool> {
        Ok(self.lock().remote_branches.contains(branch))
    }
}

/// [`HostApi`] that records requests and hands out sequential numbers.
#[derive(Debug, Default)]
pub struct RecordingHost {
    credentials: bool,
    requests: Mutex<Vec<PullRequestRequest>>,
}

impl RecordingHost {
    pub fn with_credentials() -> Self {
        Self {
            credentials: true,
            ..Self::default()
        }
    }

    pub fn without_credentials() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<PullRequestRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl HostApi for RecordingHost {
    fn has_credentials(&self) -> bool {
        self.credentials
    }

    async fn create_pull_request(&self, request: &PullRequestRequest) -> Result<PullRequest> {
        let mut requests = self
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        requests.push(request.clone());
        let number = requests.len() as u64;
        Ok(PullRequest {
            number,
            url: format!(
                "https://github.com/{}/{}/pull/{number}",
                request.owner, request.repo
            ),
        })
    }
}

/// A task for `agent` with deterministic text and no policy.
pub fn new_task(agent: &str) -> NewTask {
    NewTask {
        title: "Fix login".to_string(),
        goal: "Make the login form accept email addresses".to_string(),
        target_repo: "acme/widgets".to_string(),
        agents: vec![agent.to_string()],
        policy: Map::new(),
    }
}

/// Task policy map holding an approval policy over the given providers.
pub fn approval_policy(mode: &str, providers: &[&str]) -> Map<String, Value> {
    let rules: Vec<Value> = providers
        .iter()
        .map(|provider| json!({"provider": provider}))
        .collect();
    let mut policy = Map::new();
    policy.insert(
        "approvals".to_string(),
        json!({"mode": mode, "rules": rules}),
    );
    policy
}

/// A queued run with deterministic fields.
pub fn sample_run(id: &str, agent: &str) -> Run {
    let now = Utc::now();
    Run {
        id: id.to_string(),
        agent_id: agent.to_string(),
        repo: "acme/widgets".to_string(),
        base: "main".to_string(),
        prompt: "Fix login\n\nMake the login form accept email addresses".to_string(),
        status: RunStatus::Queued,
        created_at: now,
        updated_at: now,
        pr: None,
        compose_error: None,
    }
}

pub fn composer_deps(
    bus: Arc<dyn Bus>,
    runs: Arc<RunRepository>,
    vcs: Arc<dyn Vcs>,
    host: Arc<dyn HostApi>,
) -> ComposerDeps {
    ComposerDeps {
        bus,
        runs,
        vcs,
        host,
        state: ComposeState::default(),
    }
}
