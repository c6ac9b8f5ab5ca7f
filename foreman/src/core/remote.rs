//! Recognition of hosted repository remotes.

use std::sync::LazyLock;

use regex::Regex;

/// Owner/name pair of a repository on the hosting service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedRepo {
    pub owner: String,
    pub repo: String,
}

static HOSTED_REMOTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:https://(?:[^@/]+@)?github\.com/|git@github\.com:|ssh://git@github\.com/)([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+?)(?:\.git)?/?$",
    )
    .expect("valid remote regex")
});

/// Parse `remote_url` as a hosted repository, or `None` for any other remote.
pub fn parse_hosted_remote(remote_url: &str) -> Option<HostedRepo> {
    let caps = HOSTED_REMOTE.captures(remote_url.trim())?;
    Some(HostedRepo {
        owner: caps[1].to_string(),
        repo: caps[2].to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosted(owner: &str, repo: &str) -> Option<HostedRepo> {
        Some(HostedRepo {
            owner: owner.to_string(),
            repo: repo.to_string(),
        })
    }

    #[test]
    fn recognizes_https_and_ssh_forms() {
        assert_eq!(
            parse_hosted_remote("https://github.com/acme/widgets.git"),
            hosted("acme", "widgets")
        );
        assert_eq!(
            parse_hosted_remote("https://x-access-token:t@github.com/acme/widgets"),
            hosted("acme", "widgets")
        );
        assert_eq!(
            parse_hosted_remote("git@github.com:acme/widgets.git"),
            hosted("acme", "widgets")
        );
        assert_eq!(
            parse_hosted_remote("ssh://git@github.com/acme/my.repo"),
            hosted("acme", "my.repo")
        );
    }

    #[test]
    fn rejects_other_remotes() {
        assert_eq!(parse_hosted_remote("/tmp/bare.git"), None);
        assert_eq!(parse_hosted_remote("file:///tmp/bare.git"), None);
        assert_eq!(parse_hosted_remote("https://gitlab.com/acme/widgets"), None);
        assert_eq!(parse_hosted_remote("https://github.com/acme"), None);
    }
}
