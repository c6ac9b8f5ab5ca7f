//! Foreman configuration stored in `foreman.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::patch::Eol;
use crate::core::types::RunStatus;
use crate::io::git::CommitAuthor;

/// Foreman configuration (TOML).
///
/// Missing sections and fields fall back to their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForemanConfig {
    pub bus: BusConfig,
    pub compose: ComposeConfig,
    pub host: HostConfig,
    pub approvals: ApprovalConfig,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    #[default]
    Memory,
    Nats,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BusConfig {
    pub backend: BusBackend,
    pub nats_url: String,
    /// Timeout for bus request/reply calls.
    pub request_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::Memory,
            nats_url: "nats://127.0.0.1:4222".to_string(),
            request_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ComposeConfig {
    /// Run statuses that trigger composition.
    pub on_status: Vec<RunStatus>,
    /// Remote the composed branch is pushed to. Empty disables the composer.
    pub remote_url: String,
    pub base_branch: String,
    pub dry_run: bool,
    pub branch_prefix: String,
    pub max_branch_attempts: usize,
    pub eol: Eol,
    pub author_name: String,
    pub author_email: String,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            on_status: vec![RunStatus::Done],
            remote_url: String::new(),
            base_branch: "main".to_string(),
            dry_run: false,
            branch_prefix: "agent".to_string(),
            max_branch_attempts: 20,
            eol: Eol::None,
            author_name: String::new(),
            author_email: String::new(),
        }
    }
}

impl ComposeConfig {
    /// Commit author override, if both name and email are set.
    pub fn author(&self) -> Option<CommitAuthor> {
        let name = self.author_name.trim();
        let email = self.author_email.trim();
        if name.is_empty() || email.is_empty() {
            return None;
        }
        Some(CommitAuthor {
            name: name.to_string(),
            email: email.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HostConfig {
    pub api_base: String,
    /// Environment variable holding the API token.
    pub token_env: String,
    /// Open change requests as drafts.
    pub draft: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
            draft: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Treat rules with no registered provider as failures.
    pub strict: bool,
}

impl ForemanConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bus.request_timeout_ms == 0 {
            return Err(anyhow!("bus.request_timeout_ms must be > 0"));
        }
        if self.bus.backend == BusBackend::Nats && self.bus.nats_url.trim().is_empty() {
            return Err(anyhow!("bus.nats_url must be set for the nats backend"));
        }
        if self.compose.on_status.is_empty() {
            return Err(anyhow!("compose.on_status must list at least one status"));
        }
        if self.compose.max_branch_attempts == 0 {
            return Err(anyhow!("compose.max_branch_attempts must be > 0"));
        }
        if self.compose.base_branch.trim().is_empty() {
            return Err(anyhow!("compose.base_branch must be non-empty"));
        }
        let has_name = !self.compose.author_name.trim().is_empty();
        let has_email = !self.compose.author_email.trim().is_empty();
        if has_name != has_email {
            return Err(anyhow!(
                "compose.author_name and compose.author_email must be set together"
            ));
        }
        if self.host.api_base.trim().is_empty() {
            return Err(anyhow!("host.api_base must be non-empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ForemanConfig::default()`.
pub fn load_config(path: &Path) -> Result<ForemanConfig> {
    if !path.exists() {
        let cfg = ForemanConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ForemanConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ForemanConfig::default());
    }

    #[test]
    fn full_file_overrides_every_section() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("foreman.toml");
        fs::write(
            &path,
            r#"
[bus]
backend = "nats"
nats_url = "nats://bus:4222"

[compose]
on_status = ["done", "error"]
remote_url = "https://github.com/acme/widgets.git"
eol = "lf"

[host]
draft = true

[approvals]
strict = true
"#,
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.bus.backend, BusBackend::Nats);
        assert_eq!(cfg.bus.nats_url, "nats://bus:4222");
        assert_eq!(cfg.compose.on_status, vec![RunStatus::Done, RunStatus::Error]);
        assert_eq!(cfg.compose.eol, Eol::Lf);
        assert!(cfg.host.draft && cfg.approvals.strict);
        assert_eq!(cfg.bus.request_timeout_ms, 5_000);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("foreman.toml");
        fs::write(
            &path,
            "[compose]\nremote_url = \"git@github.com:acme/widgets.git\"\ndry_run = true\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert!(cfg.compose.dry_run);
        assert_eq!(cfg.compose.base_branch, "main");
        assert_eq!(cfg.compose.max_branch_attempts, 20);
        assert_eq!(cfg.host.token_env, "GITHUB_TOKEN");
    }

    #[test]
    fn unknown_status_fails_to_parse() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("foreman.toml");
        fs::write(&path, "[compose]\non_status = [\"finished\"]\n").expect("write");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn validate_rejects_inconsistent_values() {
        let mut cfg = ForemanConfig::default();
        cfg.compose.on_status.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = ForemanConfig::default();
        cfg.compose.max_branch_attempts = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ForemanConfig::default();
        cfg.compose.author_name = "Bot".to_string();
        assert!(cfg.validate().is_err());
        cfg.compose.author_email = "bot@example.com".to_string();
        cfg.validate().expect("valid");
        assert_eq!(
            cfg.compose.author().map(|a| a.name),
            Some("Bot".to_string())
        );
    }
}
