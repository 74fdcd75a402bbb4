//! GitHub adapter built on the git data API.
//!
//! A commit is assembled from blobs, a tree on top of the parent tree, and a
//! commit object; the branch ref is moved last with `force = false`, so a
//! failure anywhere before that leaves the branch untouched.

use async_trait::async_trait;
use recert_core::{ChangeAction, FileChange, PrRequest, RecertError, RemotePr};
use serde_json::{json, Value};

use crate::http::{str_field, time_field};
use crate::{split_repo_url, ProviderGateway};

const NAME: &str = "github";

/// GitHub (and GitHub Enterprise) gateway.
pub struct GitHub {
    octocrab: octocrab::Octocrab,
    owner: String,
    repo: String,
}

impl GitHub {
    /// Create a client for the repository at `url`.
    ///
    /// `api_base` overrides the API endpoint; otherwise `github.com` uses the
    /// public API and any other host is treated as GitHub Enterprise.
    ///
    /// # Errors
    ///
    /// Returns [`RecertError::Config`] if the URL is not `https://host/owner/repo`,
    /// or [`RecertError::Provider`] if the client cannot be built.
    pub fn new(url: &str, api_base: Option<&str>, token: &str) -> Result<Self, RecertError> {
        let (owner, repo, base) = parse_repo_url(url)?;
        let base = api_base.map_or(base, str::to_string);

        let octocrab = octocrab::Octocrab::builder()
            .personal_token(token.to_string())
            .base_uri(base.as_str())
            .map_err(|e| RecertError::Config(format!("invalid GitHub API base '{base}': {e}")))?
            .build()
            .map_err(|e| RecertError::provider(NAME, format!("failed to create client: {e}")))?;

        Ok(Self {
            octocrab,
            owner,
            repo,
        })
    }

    fn route(&self, tail: &str) -> String {
        format!("/repos/{}/{}/{tail}", self.owner, self.repo)
    }

    async fn get(&self, tail: &str) -> Result<Value, octocrab::Error> {
        self.octocrab.get(self.route(tail), None::<&()>).await
    }

    async fn post(&self, tail: &str, body: &Value) -> Result<Value, octocrab::Error> {
        self.octocrab.post(self.route(tail), Some(body)).await
    }

    async fn ref_sha(&self, branch: &str) -> Result<String, RecertError> {
        let reference = self
            .get(&format!("git/ref/heads/{branch}"))
            .await
            .map_err(|e| api_error(&format!("failed to read ref for '{branch}'"), e))?;
        Ok(str_field(NAME, &reference["object"], "sha")?.to_string())
    }
}

/// Parse `https://host/owner/repo` into owner, repo, and default API base.
///
/// # Examples
///
/// ```
/// use recert_provider::github::parse_repo_url;
///
/// let (owner, repo, api) = parse_repo_url("https://github.com/acme/infra.git").unwrap();
/// assert_eq!((owner.as_str(), repo.as_str()), ("acme", "infra"));
/// assert_eq!(api, "https://api.github.com");
///
/// let (_, _, api) = parse_repo_url("https://git.acme.io/ops/infra").unwrap();
/// assert_eq!(api, "https://git.acme.io/api/v3");
/// ```
pub fn parse_repo_url(url: &str) -> Result<(String, String, String), RecertError> {
    let invalid = || RecertError::Config(format!("invalid GitHub repository URL '{url}'"));
    let (host, segments) = split_repo_url(url).ok_or_else(invalid)?;
    let [owner, repo] = segments.as_slice() else {
        return Err(invalid());
    };
    let api = if host == "github.com" {
        "https://api.github.com".to_string()
    } else {
        format!("https://{host}/api/v3")
    };
    Ok((owner.clone(), repo.clone(), api))
}

fn status_of(err: &octocrab::Error) -> Option<u16> {
    match err {
        octocrab::Error::GitHub { source, .. } => Some(source.status_code.as_u16()),
        _ => None,
    }
}

fn api_error(context: &str, err: octocrab::Error) -> RecertError {
    let detail = match &err {
        octocrab::Error::GitHub { source, .. } => {
            format!("{} ({})", source.message, source.status_code)
        }
        other => other.to_string(),
    };
    RecertError::provider(NAME, format!("{context}: {detail}"))
}

/// Tree entries for `changes`, pairing each non-delete change with its blob sha.
///
/// Deletions are expressed as entries with a null sha.
pub(crate) fn tree_entries(changes: &[FileChange], blob_shas: &[Option<String>]) -> Vec<Value> {
    changes
        .iter()
        .zip(blob_shas)
        .map(|(change, sha)| {
            json!({
                "path": change.path,
                "mode": "100644",
                "type": "blob",
                "sha": sha,
            })
        })
        .collect()
}

/// Split reviewers into users and `org/team` slugs.
pub(crate) fn reviewer_payload(reviewers: &[String]) -> Value {
    let (teams, users): (Vec<&String>, Vec<&String>) =
        reviewers.iter().partition(|r| r.contains('/'));
    let teams: Vec<&str> = teams
        .iter()
        .filter_map(|t| t.rsplit('/').next())
        .collect();
    json!({ "reviewers": users, "team_reviewers": teams })
}

fn remote_pr(value: &Value) -> Result<RemotePr, RecertError> {
    let number = value["number"]
        .as_u64()
        .ok_or_else(|| RecertError::provider(NAME, "pull request response is missing 'number'"))?;
    Ok(RemotePr {
        id: number.to_string(),
        url: value["html_url"].as_str().unwrap_or_default().to_string(),
        number,
        state: value["state"].as_str().unwrap_or("open").to_string(),
        created_at: time_field(value, "created_at"),
    })
}

#[async_trait]
impl ProviderGateway for GitHub {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool, RecertError> {
        match self.get(&format!("git/ref/heads/{branch}")).await {
            Ok(_) => Ok(true),
            Err(e) if status_of(&e) == Some(404) => Ok(false),
            Err(e) => Err(api_error(&format!("failed to check branch '{branch}'"), e)),
        }
    }

    async fn ensure_branch(&self, branch: &str, base: &str) -> Result<(), RecertError> {
        let sha = self.ref_sha(base).await?;
        let body = json!({ "ref": format!("refs/heads/{branch}"), "sha": sha });
        match self.post("git/refs", &body).await {
            Ok(_) => {
                tracing::debug!(branch, base, sha = %sha, "created branch");
                Ok(())
            }
            Err(e) if status_of(&e) == Some(422) => {
                tracing::debug!(branch, "branch already exists");
                Ok(())
            }
            Err(e) => Err(api_error(&format!("failed to create branch '{branch}'"), e)),
        }
    }

    async fn create_commit(
        &self,
        branch: &str,
        message: &str,
        changes: &[FileChange],
    ) -> Result<String, RecertError> {
        if changes.is_empty() {
            return Err(RecertError::provider(NAME, "refusing to create an empty commit"));
        }

        let parent = self.ref_sha(branch).await?;
        let parent_commit = self
            .get(&format!("git/commits/{parent}"))
            .await
            .map_err(|e| api_error("failed to read parent commit", e))?;
        let base_tree = str_field(NAME, &parent_commit["tree"], "sha")?.to_string();

        let mut blob_shas = Vec::with_capacity(changes.len());
        for change in changes {
            let sha = match change.action {
                ChangeAction::Delete => None,
                ChangeAction::Create | ChangeAction::Update => {
                    let body = json!({
                        "content": change.content.as_deref().unwrap_or_default(),
                        "encoding": "utf-8",
                    });
                    let blob = self
                        .post("git/blobs", &body)
                        .await
                        .map_err(|e| api_error(&format!("failed to create blob for '{}'", change.path), e))?;
                    Some(str_field(NAME, &blob, "sha")?.to_string())
                }
            };
            blob_shas.push(sha);
        }

        let tree = self
            .post(
                "git/trees",
                &json!({ "base_tree": base_tree, "tree": tree_entries(changes, &blob_shas) }),
            )
            .await
            .map_err(|e| api_error("failed to create tree", e))?;
        let tree_sha = str_field(NAME, &tree, "sha")?;

        let commit = self
            .post(
                "git/commits",
                &json!({ "message": message, "tree": tree_sha, "parents": [parent] }),
            )
            .await
            .map_err(|e| api_error("failed to create commit", e))?;
        let commit_sha = str_field(NAME, &commit, "sha")?.to_string();

        let _: Value = self
            .octocrab
            .patch(
                self.route(&format!("git/refs/heads/{branch}")),
                Some(&json!({ "sha": commit_sha, "force": false })),
            )
            .await
            .map_err(|e| api_error(&format!("failed to move '{branch}'"), e))?;

        tracing::debug!(branch, commit = %commit_sha, files = changes.len(), "created commit");
        Ok(commit_sha)
    }

    async fn find_pull_request(
        &self,
        head: &str,
        base: &str,
    ) -> Result<Option<RemotePr>, RecertError> {
        let params = [
            ("head", format!("{}:{head}", self.owner)),
            ("base", base.to_string()),
            ("state", "open".to_string()),
        ];
        let pulls: Value = self
            .octocrab
            .get(self.route("pulls"), Some(&params))
            .await
            .map_err(|e| api_error("failed to list pull requests", e))?;
        match pulls.as_array().and_then(|a| a.first()) {
            Some(pr) => Ok(Some(remote_pr(pr)?)),
            None => Ok(None),
        }
    }

    async fn ensure_pull_request(&self, request: &PrRequest) -> Result<RemotePr, RecertError> {
        let body = json!({
            "title": request.title,
            "body": request.description,
            "head": request.branch,
            "base": request.base_branch,
        });
        match self.post("pulls", &body).await {
            Ok(pr) => remote_pr(&pr),
            Err(e) if status_of(&e) == Some(422) => self
                .find_pull_request(&request.branch, &request.base_branch)
                .await?
                .ok_or_else(|| api_error("failed to create pull request", e)),
            Err(e) => Err(api_error("failed to create pull request", e)),
        }
    }

    async fn assign(&self, pr: &RemotePr, assignees: &[String]) -> Result<(), RecertError> {
        if assignees.is_empty() {
            return Ok(());
        }
        self.post(
            &format!("issues/{}/assignees", pr.number),
            &json!({ "assignees": assignees }),
        )
        .await
        .map_err(|e| api_error("failed to assign pull request", e))?;
        Ok(())
    }

    async fn request_reviewers(
        &self,
        pr: &RemotePr,
        reviewers: &[String],
    ) -> Result<(), RecertError> {
        if reviewers.is_empty() {
            return Ok(());
        }
        self.post(
            &format!("pulls/{}/requested_reviewers", pr.number),
            &reviewer_payload(reviewers),
        )
        .await
        .map_err(|e| api_error("failed to request reviewers", e))?;
        Ok(())
    }

    async fn add_labels(&self, pr: &RemotePr, labels: &[String]) -> Result<(), RecertError> {
        if labels.is_empty() {
            return Ok(());
        }
        self.post(
            &format!("issues/{}/labels", pr.number),
            &json!({ "labels": labels }),
        )
        .await
        .map_err(|e| api_error("failed to add labels", e))?;
        Ok(())
    }

    async fn add_comment(&self, pr: &RemotePr, body: &str) -> Result<(), RecertError> {
        self.post(
            &format!("issues/{}/comments", pr.number),
            &json!({ "body": body }),
        )
        .await
        .map_err(|e| api_error("failed to add comment", e))?;
        Ok(())
    }
}
