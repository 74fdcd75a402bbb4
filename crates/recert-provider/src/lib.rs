//! Git hosting backends behind one gateway interface.
//!
//! Each backend materializes a commit its own way:
//! - [`github`]: blobs, a tree based on the parent tree, a commit, then a
//!   non-forced ref update. The branch only moves in the last step.
//! - [`azure`]: a single push carrying the expected branch tip; the server
//!   rejects it when the tip has moved.
//! - [`gitlab`]: one commit call with an ordered list of file actions.
//!
//! None of the adapters retry. "Already exists" answers to branch creation
//! count as success.

pub mod azure;
pub mod github;
pub mod gitlab;
mod http;

use std::sync::Arc;

use async_trait::async_trait;
use recert_core::{FileChange, PrRequest, ProviderKind, RecertError, RemotePr, RepositoryConfig};

pub use azure::AzureDevOps;
pub use github::GitHub;
pub use gitlab::GitLab;

/// Remote operations needed to turn a review unit into a pull request.
///
/// Implementations must be safe to call concurrently for different branches.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Backend name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Whether `branch` exists on the remote.
    async fn branch_exists(&self, branch: &str) -> Result<bool, RecertError>;

    /// Create `branch` from the tip of `base`. An existing branch is left as is.
    async fn ensure_branch(&self, branch: &str, base: &str) -> Result<(), RecertError>;

    /// Commit `changes` on top of `branch` and return the new commit id.
    async fn create_commit(
        &self,
        branch: &str,
        message: &str,
        changes: &[FileChange],
    ) -> Result<String, RecertError>;

    /// The open pull request from `head` into `base`, if any.
    async fn find_pull_request(&self, head: &str, base: &str)
        -> Result<Option<RemotePr>, RecertError>;

    /// Whether an open pull request from `head` into `base` exists.
    async fn pull_request_exists(&self, head: &str, base: &str) -> Result<bool, RecertError> {
        Ok(self.find_pull_request(head, base).await?.is_some())
    }

    /// Open a pull request for `request`, or return the one already open.
    async fn ensure_pull_request(&self, request: &PrRequest) -> Result<RemotePr, RecertError>;

    /// Assign users to the pull request.
    async fn assign(&self, pr: &RemotePr, assignees: &[String]) -> Result<(), RecertError>;

    /// Ask users to review the pull request.
    async fn request_reviewers(&self, pr: &RemotePr, reviewers: &[String])
        -> Result<(), RecertError>;

    /// Attach labels to the pull request.
    async fn add_labels(&self, pr: &RemotePr, labels: &[String]) -> Result<(), RecertError>;

    /// Post a comment on the pull request.
    async fn add_comment(&self, pr: &RemotePr, body: &str) -> Result<(), RecertError>;
}

/// Build the gateway for `config.provider`.
///
/// The access token is read from the environment variable named by
/// `config.token_env`.
///
/// # Errors
///
/// Returns [`RecertError::Config`] if the token is missing or the repository
/// URL does not fit the provider.
///
/// # Examples
///
/// ```no_run
/// use recert_core::{ProviderKind, RepositoryConfig};
///
/// let config = RepositoryConfig {
///     url: "https://github.com/acme/infra".into(),
///     provider: ProviderKind::Github,
///     token_env: "GITHUB_TOKEN".into(),
///     api_base: None,
/// };
/// let gateway = recert_provider::connect(&config).unwrap();
/// assert_eq!(gateway.name(), "github");
/// ```
pub fn connect(config: &RepositoryConfig) -> Result<Arc<dyn ProviderGateway>, RecertError> {
    let token = std::env::var(&config.token_env).map_err(|_| {
        RecertError::Config(format!(
            "{} not set. Export an access token for the {} provider",
            config.token_env, config.provider
        ))
    })?;
    if token.trim().is_empty() {
        return Err(RecertError::Config(format!("{} is empty", config.token_env)));
    }

    let gateway: Arc<dyn ProviderGateway> = match config.provider {
        ProviderKind::Github => Arc::new(GitHub::new(&config.url, config.api_base.as_deref(), &token)?),
        ProviderKind::Azure => Arc::new(AzureDevOps::new(&config.url, config.api_base.as_deref(), &token)?),
        ProviderKind::Gitlab => Arc::new(GitLab::new(&config.url, config.api_base.as_deref(), &token)?),
    };
    tracing::debug!(provider = gateway.name(), url = %config.url, "connected provider");
    Ok(gateway)
}

/// Split `https://host/a/b/c(.git)` or `git@host:a/b/c.git` into host and path segments.
pub(crate) fn split_repo_url(url: &str) -> Option<(String, Vec<String>)> {
    let url = url.trim().trim_end_matches('/');
    let url = url.strip_suffix(".git").unwrap_or(url);

    let (host, path) = if let Some(rest) = url.strip_prefix("git@") {
        rest.split_once(':')?
    } else {
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))?;
        rest.split_once('/')?
    };
    // Drop userinfo such as `org@dev.azure.com`.
    let host = host.rsplit('@').next().unwrap_or(host);

    let segments: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if host.is_empty() || segments.is_empty() {
        return None;
    }
    Some((host.to_string(), segments))
}
