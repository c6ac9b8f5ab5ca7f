//! Version-control adapter used by the composer.
//!
//! [`Vcs`] is the seam the composer talks to; [`GitCli`] implements it by
//! shelling out to `git` in a scratch workspace.

use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Commit author override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

impl CommitAuthor {
    fn as_arg(&self) -> String {
        format!("{} <{}>", self.name, self.email)
    }
}

/// How the base branch was prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseCheckout {
    /// The base branch was fetched from the remote.
    Fetched,
    /// The remote has no such branch; it was created locally.
    Created,
}

#[async_trait]
pub trait Vcs: Send + Sync {
    async fn init(&self, dir: &Path) -> Result<()>;

    async fn add_remote(&self, dir: &Path, name: &str, url: &str) -> Result<()>;

    /// Fetch `base` from `remote` and check it out, or create it when absent.
    async fn checkout_base(&self, dir: &Path, remote: &str, base: &str) -> Result<BaseCheckout>;

    /// Create `branch` at the current HEAD and switch to it.
    async fn create_branch(&self, dir: &Path, branch: &str) -> Result<()>;

    /// Stage everything and commit. Returns `false` when there was nothing to commit.
    async fn commit(&self, dir: &Path, message: &str, author: Option<&CommitAuthor>)
    -> Result<bool>;

    async fn push(&self, dir: &Path, remote: &str, branch: &str) -> Result<()>;

    async fn remote_branch_exists(&self, dir: &Path, remote: &str, branch: &str) -> Result<bool>;
}

/// Identity recorded as committer in scratch workspaces.
const COMMITTER_NAME: &str = "foreman";
const COMMITTER_EMAIL: &str = "foreman@local.invalid";

/// [`Vcs`] backed by the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
    timeout: Duration,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
        }
    }
}

impl GitCli {
    async fn run(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("git {} timed out after {:?}", args.join(" "), self.timeout))?
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        Ok(output)
    }

    async fn run_checked(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        let output = self.run(dir, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    async fn has_head(&self, dir: &Path) -> Result<bool> {
        let output = self
            .run(dir, &["rev-parse", "--verify", "--quiet", "HEAD"])
            .await?;
        Ok(output.status.success())
    }

    async fn has_staged_changes(&self, dir: &Path) -> Result<bool> {
        let output = self
            .run_checked(dir, &["diff", "--cached", "--name-only"])
            .await?;
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }
}

#[async_trait]
impl Vcs for GitCli {
    #[instrument(skip_all, fields(dir = %dir.display()))]
    async fn init(&self, dir: &Path) -> Result<()> {
        self.run_checked(dir, &["init", "-q"]).await?;
        self.run_checked(dir, &["config", "user.name", COMMITTER_NAME])
            .await?;
        self.run_checked(dir, &["config", "user.email", COMMITTER_EMAIL])
            .await?;
        Ok(())
    }

    async fn add_remote(&self, dir: &Path, name: &str, url: &str) -> Result<()> {
        self.run_checked(dir, &["remote", "add", name, url]).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(remote = %remote, base = %base))]
    async fn checkout_base(&self, dir: &Path, remote: &str, base: &str) -> Result<BaseCheckout> {
        if self.remote_branch_exists(dir, remote, base).await? {
            self.run_checked(dir, &["fetch", "-q", "--depth", "1", remote, base])
                .await?;
            self.run_checked(dir, &["checkout", "-q", "-B", base, "FETCH_HEAD"])
                .await?;
            debug!(base, "checked out fetched base");
            return Ok(BaseCheckout::Fetched);
        }
        let head_ref = format!("refs/heads/{base}");
        self.run_checked(dir, &["symbolic-ref", "HEAD", &head_ref])
            .await?;
        debug!(base, "remote has no base branch; starting empty");
        Ok(BaseCheckout::Created)
    }

    #[instrument(skip_all, fields(branch = %branch))]
    async fn create_branch(&self, dir: &Path, branch: &str) -> Result<()> {
        if self.has_head(dir).await? {
            self.run_checked(dir, &["checkout", "-q", "-b", branch])
                .await?;
        } else {
            let head_ref = format!("refs/heads/{branch}");
            self.run_checked(dir, &["symbolic-ref", "HEAD", &head_ref])
                .await?;
        }
        Ok(())
    }

    #[instrument(skip_all)]
    async fn commit(
        &self,
        dir: &Path,
        message: &str,
        author: Option<&CommitAuthor>,
    ) -> Result<bool> {
        self.run_checked(dir, &["add", "-A"]).await?;
        if !self.has_staged_changes(dir).await? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        let author_arg = author.map(CommitAuthor::as_arg);
        let mut args = vec!["commit", "-q", "-m", message];
        if let Some(author_arg) = &author_arg {
            args.push("--author");
            args.push(author_arg);
        }
        self.run_checked(dir, &args).await?;
        Ok(true)
    }

    #[instrument(skip_all, fields(remote = %remote, branch = %branch))]
    async fn push(&self, dir: &Path, remote: &str, branch: &str) -> Result<()> {
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        self.run_checked(dir, &["push", "-q", remote, &refspec])
            .await?;
        Ok(())
    }

    async fn remote_branch_exists(&self, dir: &Path, remote: &str, branch: &str) -> Result<bool> {
        let full_ref = format!("refs/heads/{branch}");
        let output = self
            .run(dir, &["ls-remote", "--exit-code", remote, &full_ref])
            .await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(2) => Ok(false),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(anyhow!(
                    "git ls-remote {remote} {branch} failed: {}",
                    stderr.trim()
                ))
            }
        }
    }
}
