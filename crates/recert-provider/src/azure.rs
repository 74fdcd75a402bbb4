//! Azure DevOps Repos adapter.
//!
//! Commits go through the push API: one request carries the expected branch
//! tip (`oldObjectId`) and the file changes. If the branch moved in between,
//! the server answers `409 Conflict` and nothing is written.

use async_trait::async_trait;
use recert_core::{ChangeAction, FileChange, PrRequest, RecertError, RemotePr};
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::http::{self, str_field, time_field};
use crate::{split_repo_url, ProviderGateway};

const NAME: &str = "azure";
const API_VERSION: &str = "7.0";
const ZERO_OBJECT_ID: &str = "0000000000000000000000000000000000000000";

/// Location of a repository in an Azure DevOps organization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureRepo {
    /// Organization name.
    pub organization: String,
    /// Project name.
    pub project: String,
    /// Repository name.
    pub repository: String,
}

/// Parse `https://dev.azure.com/{org}/{project}/_git/{repo}` or
/// `https://{org}.visualstudio.com/{project}/_git/{repo}`.
///
/// # Errors
///
/// Returns [`RecertError::Config`] for any other shape.
///
/// # Examples
///
/// ```
/// use recert_provider::azure::parse_repo_url;
///
/// let repo = parse_repo_url("https://dev.azure.com/acme/ops/_git/infra").unwrap();
/// assert_eq!(repo.organization, "acme");
/// assert_eq!(repo.project, "ops");
/// assert_eq!(repo.repository, "infra");
/// ```
pub fn parse_repo_url(url: &str) -> Result<AzureRepo, RecertError> {
    let invalid = || RecertError::Config(format!("unsupported Azure DevOps URL '{url}'"));
    let (host, segments) = split_repo_url(url).ok_or_else(invalid)?;
    let segs: Vec<&str> = segments.iter().map(String::as_str).collect();

    let (organization, rest) = if host == "dev.azure.com" {
        let (org, rest) = segs.split_first().ok_or_else(invalid)?;
        (org.to_string(), rest)
    } else if let Some(org) = host.strip_suffix(".visualstudio.com") {
        (org.to_string(), segs.as_slice())
    } else {
        return Err(invalid());
    };

    match rest {
        [project, "_git", repository] => Ok(AzureRepo {
            organization,
            project: project.to_string(),
            repository: repository.to_string(),
        }),
        _ => Err(invalid()),
    }
}

/// Azure DevOps gateway using basic auth with a personal access token.
pub struct AzureDevOps {
    http: reqwest::Client,
    token: String,
    repo: AzureRepo,
    api_base: String,
}

impl AzureDevOps {
    /// Create a client for the repository at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`RecertError::Config`] if the URL cannot be parsed.
    pub fn new(url: &str, api_base: Option<&str>, token: &str) -> Result<Self, RecertError> {
        let repo = parse_repo_url(url)?;
        let api_base = api_base.map_or_else(
            || format!("https://dev.azure.com/{}/{}/_apis", repo.organization, repo.project),
            |b| b.trim_end_matches('/').to_string(),
        );
        Ok(Self {
            http: reqwest::Client::new(),
            token: token.to_string(),
            repo,
            api_base,
        })
    }

    fn repo_url(&self, tail: &str) -> String {
        let sep = if tail.contains('?') { '&' } else { '?' };
        format!(
            "{}/git/repositories/{}/{tail}{sep}api-version={API_VERSION}",
            self.api_base, self.repo.repository
        )
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth("", Some(&self.token))
            .header("User-Agent", "recert")
    }

    async fn get(&self, tail: &str) -> Result<Value, RecertError> {
        let response =
            http::send(NAME, self.request(reqwest::Method::GET, self.repo_url(tail))).await?;
        http::json(NAME, response).await
    }

    async fn post(&self, tail: &str, body: &Value) -> Result<Value, RecertError> {
        let response = http::send(
            NAME,
            self.request(reqwest::Method::POST, self.repo_url(tail)).json(body),
        )
        .await?;
        http::json(NAME, response).await
    }

    /// Current object id of `branch`, or `None` if it does not exist.
    async fn branch_tip(&self, branch: &str) -> Result<Option<String>, RecertError> {
        let refs = self
            .get(&format!("refs?filter={}", urlencoding::encode(&format!("heads/{branch}"))))
            .await?;
        let full = format!("refs/heads/{branch}");
        // The filter is a prefix match, so look for the exact name.
        Ok(refs["value"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|r| r["name"].as_str() == Some(full.as_str()))
            .and_then(|r| r["objectId"].as_str())
            .map(str::to_string))
    }

    fn web_url(&self, id: u64) -> String {
        format!(
            "https://dev.azure.com/{}/{}/_git/{}/pullrequest/{id}",
            self.repo.organization, self.repo.project, self.repo.repository
        )
    }

    fn remote_pr(&self, value: &Value) -> Result<RemotePr, RecertError> {
        let id = value["pullRequestId"].as_u64().ok_or_else(|| {
            RecertError::provider(NAME, "pull request response is missing 'pullRequestId'")
        })?;
        Ok(RemotePr {
            id: id.to_string(),
            url: self.web_url(id),
            number: id,
            state: value["status"].as_str().unwrap_or("active").to_string(),
            created_at: time_field(value, "creationDate"),
        })
    }

    /// Identity id for a user name, email, or id.
    async fn identity_id(&self, user: &str) -> Result<String, RecertError> {
        if looks_like_guid(user) {
            return Ok(user.to_string());
        }
        let url = format!(
            "https://vssps.dev.azure.com/{}/_apis/identities?searchFilter=General&filterValue={}&api-version={API_VERSION}",
            self.repo.organization,
            urlencoding::encode(user)
        );
        let response = http::send(NAME, self.request(reqwest::Method::GET, url)).await?;
        let identities = http::json(NAME, response).await?;
        identities["value"]
            .as_array()
            .and_then(|v| v.first())
            .and_then(|i| i["id"].as_str())
            .map(str::to_string)
            .ok_or_else(|| RecertError::provider(NAME, format!("unknown identity '{user}'")))
    }
}

fn looks_like_guid(s: &str) -> bool {
    s.len() == 36
        && s.chars()
            .enumerate()
            .all(|(i, c)| matches!(i, 8 | 13 | 18 | 23) == (c == '-') && (c == '-' || c.is_ascii_hexdigit()))
}

/// Push payload: one commit with `changes`, guarded by `old_object_id`.
pub(crate) fn push_payload(
    branch: &str,
    old_object_id: &str,
    message: &str,
    changes: &[FileChange],
) -> Value {
    let changes: Vec<Value> = changes
        .iter()
        .map(|c| {
            let change_type = match c.action {
                ChangeAction::Create => "add",
                ChangeAction::Update => "edit",
                ChangeAction::Delete => "delete",
            };
            let item = json!({ "path": format!("/{}", c.path.trim_start_matches('/')) });
            match c.action {
                ChangeAction::Delete => json!({ "changeType": change_type, "item": item }),
                _ => json!({
                    "changeType": change_type,
                    "item": item,
                    "newContent": {
                        "content": c.content.as_deref().unwrap_or_default(),
                        "contentType": "rawtext",
                    },
                }),
            }
        })
        .collect();

    json!({
        "refUpdates": [{ "name": format!("refs/heads/{branch}"), "oldObjectId": old_object_id }],
        "commits": [{ "comment": message, "changes": changes }],
    })
}

#[async_trait]
impl ProviderGateway for AzureDevOps {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool, RecertError> {
        Ok(self.branch_tip(branch).await?.is_some())
    }

    async fn ensure_branch(&self, branch: &str, base: &str) -> Result<(), RecertError> {
        let base_tip = self
            .branch_tip(base)
            .await?
            .ok_or_else(|| RecertError::provider(NAME, format!("base branch '{base}' not found")))?;
        let body = json!([{
            "name": format!("refs/heads/{branch}"),
            "oldObjectId": ZERO_OBJECT_ID,
            "newObjectId": base_tip,
        }]);
        let result = self.post("refs", &body).await?;
        let update = &result["value"][0];
        if update["success"].as_bool() == Some(true) {
            tracing::debug!(branch, base, "created branch");
            return Ok(());
        }
        if self.branch_tip(branch).await?.is_some() {
            tracing::debug!(branch, "branch already exists");
            return Ok(());
        }
        Err(RecertError::provider(
            NAME,
            format!(
                "failed to create branch '{branch}': {}",
                update["updateStatus"].as_str().unwrap_or("unknown status")
            ),
        ))
    }

    async fn create_commit(
        &self,
        branch: &str,
        message: &str,
        changes: &[FileChange],
    ) -> Result<String, RecertError> {
        if changes.is_empty() {
            return Err(RecertError::provider(NAME, "refusing to push an empty commit"));
        }
        let tip = self
            .branch_tip(branch)
            .await?
            .ok_or_else(|| RecertError::provider(NAME, format!("branch '{branch}' not found")))?;

        let body = push_payload(branch, &tip, message, changes);
        let response = http::send(
            NAME,
            self.request(reqwest::Method::POST, self.repo_url("pushes")).json(&body),
        )
        .await?;
        if response.status() == StatusCode::CONFLICT {
            return Err(RecertError::provider(
                NAME,
                format!("push to '{branch}' rejected: branch tip moved from {tip}"),
            ));
        }
        let push = http::json(NAME, response).await?;
        let commit = str_field(NAME, &push["commits"][0], "commitId")?.to_string();
        tracing::debug!(branch, commit = %commit, files = changes.len(), "pushed commit");
        Ok(commit)
    }

    async fn find_pull_request(
        &self,
        head: &str,
        base: &str,
    ) -> Result<Option<RemotePr>, RecertError> {
        let tail = format!(
            "pullrequests?searchCriteria.sourceRefName={}&searchCriteria.targetRefName={}&searchCriteria.status=active",
            urlencoding::encode(&format!("refs/heads/{head}")),
            urlencoding::encode(&format!("refs/heads/{base}")),
        );
        let prs = self.get(&tail).await?;
        match prs["value"].as_array().and_then(|a| a.first()) {
            Some(pr) => Ok(Some(self.remote_pr(pr)?)),
            None => Ok(None),
        }
    }

    async fn ensure_pull_request(&self, request: &PrRequest) -> Result<RemotePr, RecertError> {
        let body = json!({
            "sourceRefName": format!("refs/heads/{}", request.branch),
            "targetRefName": format!("refs/heads/{}", request.base_branch),
            "title": request.title,
            "description": request.description,
        });
        let response = http::send(
            NAME,
            self.request(reqwest::Method::POST, self.repo_url("pullrequests")).json(&body),
        )
        .await?;
        if response.status() == StatusCode::CONFLICT {
            if let Some(existing) = self.find_pull_request(&request.branch, &request.base_branch).await? {
                return Ok(existing);
            }
        }
        let pr = http::json(NAME, response).await?;
        self.remote_pr(&pr)
    }

    async fn assign(&self, pr: &RemotePr, assignees: &[String]) -> Result<(), RecertError> {
        // Azure pull requests have no assignees; owners are added as reviewers.
        self.request_reviewers(pr, assignees).await
    }

    async fn request_reviewers(
        &self,
        pr: &RemotePr,
        reviewers: &[String],
    ) -> Result<(), RecertError> {
        for reviewer in reviewers {
            let id = self.identity_id(reviewer).await?;
            let url = self.repo_url(&format!("pullRequests/{}/reviewers/{id}", pr.number));
            let response = http::send(
                NAME,
                self.request(reqwest::Method::PUT, url).json(&json!({ "vote": 0 })),
            )
            .await?;
            http::json(NAME, response).await?;
        }
        Ok(())
    }

    async fn add_labels(&self, pr: &RemotePr, labels: &[String]) -> Result<(), RecertError> {
        for label in labels {
            self.post(&format!("pullRequests/{}/labels", pr.number), &json!({ "name": label }))
                .await?;
        }
        Ok(())
    }

    async fn add_comment(&self, pr: &RemotePr, body: &str) -> Result<(), RecertError> {
        let thread = json!({
            "comments": [{ "parentCommentId": 0, "content": body, "commentType": 1 }],
            "status": 1,
        });
        self.post(&format!("pullRequests/{}/threads", pr.number), &thread)
            .await?;
        Ok(())
    }
}
