//! GitLab adapter.
//!
//! A commit is a single call carrying an ordered list of `create`, `update`,
//! and `delete` actions; GitLab applies it atomically.

use async_trait::async_trait;
use recert_core::{ChangeAction, FileChange, PrRequest, RecertError, RemotePr};
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::http::{self, str_field, time_field};
use crate::{split_repo_url, ProviderGateway};

const NAME: &str = "gitlab";

/// Parse a GitLab project URL into the API base and the project path.
///
/// # Errors
///
/// Returns [`RecertError::Config`] if the URL has no project path.
///
/// # Examples
///
/// ```
/// use recert_provider::gitlab::parse_repo_url;
///
/// let (api, project) = parse_repo_url("https://gitlab.com/acme/platform/infra.git").unwrap();
/// assert_eq!(api, "https://gitlab.com/api/v4");
/// assert_eq!(project, "acme/platform/infra");
/// ```
pub fn parse_repo_url(url: &str) -> Result<(String, String), RecertError> {
    let (host, segments) = split_repo_url(url)
        .filter(|(_, segs)| segs.len() >= 2)
        .ok_or_else(|| RecertError::Config(format!("invalid GitLab project URL '{url}'")))?;
    let scheme = if url.trim_start().starts_with("http://") { "http" } else { "https" };
    Ok((format!("{scheme}://{host}/api/v4"), segments.join("/")))
}

/// GitLab gateway authenticating with a `PRIVATE-TOKEN`.
pub struct GitLab {
    http: reqwest::Client,
    token: String,
    api_base: String,
    project_url: String,
}

impl GitLab {
    /// Create a client for the project at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`RecertError::Config`] if the URL cannot be parsed.
    pub fn new(url: &str, api_base: Option<&str>, token: &str) -> Result<Self, RecertError> {
        let (default_base, project) = parse_repo_url(url)?;
        let base = api_base.map_or(default_base, |b| b.trim_end_matches('/').to_string());
        Ok(Self {
            http: reqwest::Client::new(),
            token: token.to_string(),
            project_url: format!("{base}/projects/{}", urlencoding::encode(&project)),
            api_base: base,
        })
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("PRIVATE-TOKEN", &self.token)
            .header("User-Agent", "recert")
    }

    fn url(&self, tail: &str) -> String {
        format!("{}/{tail}", self.project_url)
    }

    async fn send_json(
        &self,
        method: reqwest::Method,
        tail: &str,
        body: Option<&Value>,
    ) -> Result<Value, RecertError> {
        let mut request = self.request(method, self.url(tail));
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = http::send(NAME, request).await?;
        http::json(NAME, response).await
    }

    /// User ids for usernames, in order.
    async fn user_ids(&self, usernames: &[String]) -> Result<Vec<u64>, RecertError> {
        let mut ids = Vec::with_capacity(usernames.len());
        for name in usernames {
            let url = format!("{}/users?username={}", self.api_base, urlencoding::encode(name));
            let response = http::send(NAME, self.request(reqwest::Method::GET, url)).await?;
            let users = http::json(NAME, response).await?;
            let id = users
                .as_array()
                .and_then(|u| u.first())
                .and_then(|u| u["id"].as_u64())
                .ok_or_else(|| RecertError::provider(NAME, format!("unknown user '{name}'")))?;
            ids.push(id);
        }
        Ok(ids)
    }

    async fn update_merge_request(&self, pr: &RemotePr, body: &Value) -> Result<(), RecertError> {
        self.send_json(
            reqwest::Method::PUT,
            &format!("merge_requests/{}", pr.number),
            Some(body),
        )
        .await?;
        Ok(())
    }
}

/// Commit payload with one action per change, in order.
pub(crate) fn commit_payload(branch: &str, message: &str, changes: &[FileChange]) -> Value {
    let actions: Vec<Value> = changes
        .iter()
        .map(|c| match c.action {
            ChangeAction::Delete => json!({ "action": "delete", "file_path": c.path }),
            action => json!({
                "action": action.to_string(),
                "file_path": c.path,
                "content": c.content.as_deref().unwrap_or_default(),
            }),
        })
        .collect();
    json!({ "branch": branch, "commit_message": message, "actions": actions })
}

fn remote_pr(value: &Value) -> Result<RemotePr, RecertError> {
    let iid = value["iid"]
        .as_u64()
        .ok_or_else(|| RecertError::provider(NAME, "merge request response is missing 'iid'"))?;
    Ok(RemotePr {
        id: value["id"].as_u64().unwrap_or(iid).to_string(),
        url: value["web_url"].as_str().unwrap_or_default().to_string(),
        number: iid,
        state: value["state"].as_str().unwrap_or("opened").to_string(),
        created_at: time_field(value, "created_at"),
    })
}

#[async_trait]
impl ProviderGateway for GitLab {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool, RecertError> {
        let url = self.url(&format!("repository/branches/{}", urlencoding::encode(branch)));
        let response = http::send(NAME, self.request(reqwest::Method::GET, url)).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            _ => Err(http::status_error(NAME, response).await),
        }
    }

    async fn ensure_branch(&self, branch: &str, base: &str) -> Result<(), RecertError> {
        let url = self.url(&format!(
            "repository/branches?branch={}&ref={}",
            urlencoding::encode(branch),
            urlencoding::encode(base)
        ));
        let response = http::send(NAME, self.request(reqwest::Method::POST, url)).await?;
        let status = response.status();
        if status.is_success() {
            tracing::debug!(branch, base, "created branch");
            return Ok(());
        }
        let err = http::status_error(NAME, response).await;
        if status == StatusCode::BAD_REQUEST && err.to_string().contains("already exists") {
            tracing::debug!(branch, "branch already exists");
            return Ok(());
        }
        Err(err)
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
        let commit = self
            .send_json(
                reqwest::Method::POST,
                "repository/commits",
                Some(&commit_payload(branch, message, changes)),
            )
            .await?;
        let id = str_field(NAME, &commit, "id")?.to_string();
        tracing::debug!(branch, commit = %id, files = changes.len(), "created commit");
        Ok(id)
    }

    async fn find_pull_request(
        &self,
        head: &str,
        base: &str,
    ) -> Result<Option<RemotePr>, RecertError> {
        let tail = format!(
            "merge_requests?source_branch={}&target_branch={}&state=opened",
            urlencoding::encode(head),
            urlencoding::encode(base)
        );
        let mrs = self.send_json(reqwest::Method::GET, &tail, None).await?;
        match mrs.as_array().and_then(|a| a.first()) {
            Some(mr) => Ok(Some(remote_pr(mr)?)),
            None => Ok(None),
        }
    }

    async fn ensure_pull_request(&self, request: &PrRequest) -> Result<RemotePr, RecertError> {
        let body = json!({
            "source_branch": request.branch,
            "target_branch": request.base_branch,
            "title": request.title,
            "description": request.description,
        });
        let response = http::send(
            NAME,
            self.request(reqwest::Method::POST, self.url("merge_requests")).json(&body),
        )
        .await?;
        if response.status() == StatusCode::CONFLICT {
            if let Some(existing) = self.find_pull_request(&request.branch, &request.base_branch).await? {
                return Ok(existing);
            }
        }
        let mr = http::json(NAME, response).await?;
        remote_pr(&mr)
    }

    async fn assign(&self, pr: &RemotePr, assignees: &[String]) -> Result<(), RecertError> {
        if assignees.is_empty() {
            return Ok(());
        }
        let ids = self.user_ids(assignees).await?;
        self.update_merge_request(pr, &json!({ "assignee_ids": ids })).await
    }

    async fn request_reviewers(
        &self,
        pr: &RemotePr,
        reviewers: &[String],
    ) -> Result<(), RecertError> {
        if reviewers.is_empty() {
            return Ok(());
        }
        let ids = self.user_ids(reviewers).await?;
        self.update_merge_request(pr, &json!({ "reviewer_ids": ids })).await
    }

    async fn add_labels(&self, pr: &RemotePr, labels: &[String]) -> Result<(), RecertError> {
        if labels.is_empty() {
            return Ok(());
        }
        self.update_merge_request(pr, &json!({ "add_labels": labels.join(",") }))
            .await
    }

    async fn add_comment(&self, pr: &RemotePr, body: &str) -> Result<(), RecertError> {
        self.send_json(
            reqwest::Method::POST,
            &format!("merge_requests/{}/notes", pr.number),
            Some(&json!({ "body": body })),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_path_is_url_encoded() {
        let client = GitLab::new("https://gitlab.example.com/acme/infra", None, "t").unwrap();
        assert_eq!(
            client.url("repository/commits"),
            "https://gitlab.example.com/api/v4/projects/acme%2Finfra/repository/commits"
        );
    }

    #[test]
    fn api_base_override_is_used() {
        let client = GitLab::new(
            "https://gitlab.example.com/acme/infra",
            Some("https://gitlab.internal/api/v4/"),
            "t",
        )
        .unwrap();
        assert!(client.url("x").starts_with("https://gitlab.internal/api/v4/projects/"));
    }

    #[test]
    fn parse_requires_namespace() {
        assert!(parse_repo_url("https://gitlab.com/infra").is_err());
    }

    #[test]
    fn commit_payload_orders_actions() {
        let changes = vec![
            FileChange {
                path: "new.tf".into(),
                action: ChangeAction::Create,
                content: Some("a".into()),
            },
            FileChange::update("main.tf", "b"),
            FileChange {
                path: "old.tf".into(),
                action: ChangeAction::Delete,
                content: None,
            },
        ];
        let payload = commit_payload("recert/x", "Trigger recertification", &changes);
        let actions = payload["actions"].as_array().unwrap();
        let kinds: Vec<&str> = actions.iter().map(|a| a["action"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["create", "update", "delete"]);
        assert_eq!(actions[1]["content"], "b");
        assert!(actions[2].get("content").is_none());
        assert_eq!(payload["branch"], "recert/x");
    }

    #[test]
    fn remote_pr_uses_iid_as_number() {
        let pr = remote_pr(&json!({
            "id": 9001,
            "iid": 7,
            "web_url": "https://gitlab.com/acme/infra/-/merge_requests/7",
            "state": "opened",
        }))
        .unwrap();
        assert_eq!(pr.number, 7);
        assert_eq!(pr.id, "9001");
    }
}
