//! Code-hosting API client (change requests).

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Parameters of a change request to open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullRequestRequest {
    #[serde(skip)]
    pub owner: String,
    #[serde(skip)]
    pub repo: String,
    pub title: String,
    pub head: String,
    pub base: String,
    pub body: String,
    pub draft: bool,
}

/// An opened change request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
}

#[async_trait]
pub trait HostApi: Send + Sync {
    /// Whether API credentials are configured. Without them no change request
    /// is attempted.
    fn has_credentials(&self) -> bool;

    async fn create_pull_request(&self, request: &PullRequestRequest) -> Result<PullRequest>;
}

#[derive(Debug, Deserialize)]
struct CreatedPull {
    number: u64,
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

/// GitHub REST client.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new(api_base: &str, token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("foreman/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    /// Build a client whose token is read from the environment variable `token_env`.
    pub fn from_env(api_base: &str, token_env: &str) -> Result<Self> {
        Self::new(api_base, std::env::var(token_env).ok())
    }
}

#[async_trait]
impl HostApi for GitHubClient {
    fn has_credentials(&self) -> bool {
        self.token.is_some()
    }

    #[instrument(skip_all, fields(owner = %request.owner, repo = %request.repo, head = %request.head))]
    async fn create_pull_request(&self, request: &PullRequestRequest) -> Result<PullRequest> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| anyhow!("no API token configured"))?;
        let url = format!(
            "{}/repos/{}/{}/pulls",
            self.api_base, request.owner, request.repo
        );
        debug!(%url, "creating pull request");

        let response = self
            .http
            .post(&url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .bearer_auth(token)
            .json(request)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&text)
                .map(|body| body.message)
                .unwrap_or_else(|_| format!("HTTP {status}"));
            return Err(anyhow!(
                "create pull request on {}/{} failed ({status}): {message}",
                request.owner,
                request.repo
            ));
        }

        let created: CreatedPull = response
            .json()
            .await
            .context("decode pull request response")?;
        debug!(number = created.number, "pull request created");
        Ok(PullRequest {
            number: created.number,
            url: created.html_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_token_means_no_credentials() {
        let client = GitHubClient::new("https://api.github.com/", Some("  ".to_string()))
            .expect("client");
        assert!(!client.has_credentials());
        assert_eq!(client.api_base, "https://api.github.com");

        let client =
            GitHubClient::new("https://api.github.com", Some("t".to_string())).expect("client");
        assert!(client.has_credentials());
    }

    #[test]
    fn request_body_omits_routing_fields() {
        let request = PullRequestRequest {
            owner: "acme".to_string(),
            repo: "widgets".to_string(),
            title: "t".to_string(),
            head: "agent/x".to_string(),
            base: "main".to_string(),
            body: "b".to_string(),
            draft: true,
        };
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({"title": "t", "head": "agent/x", "base": "main", "body": "b", "draft": true})
        );
    }
}
