//! GitHub API client.
//!
//! Used to resolve branch and pull request heads for the trigger
//! endpoints, and to post commit statuses as builds progress.

use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use build_model::CommitInfo;

const GITHUB_API: &str = "https://api.github.com";
const STATUS_CONTEXT: &str = "runboat/build";

#[derive(Debug, Error)]
pub enum GithubError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("not found on GitHub: {0}")]
    NotFound(String),

    #[error("GitHub API error: {status} - {body}")]
    Api { status: u16, body: String },
}

/// State of a commit status, as GitHub defines them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Pending,
    Success,
    Failure,
}

impl CommitState {
    fn as_str(&self) -> &'static str {
        match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Failure => "failure",
        }
    }
}

pub struct GithubClient {
    http: reqwest::Client,
    token: Option<String>,
}

impl GithubClient {
    pub fn new(token: Option<String>) -> Result<Self, GithubError> {
        let http = reqwest::Client::builder()
            .user_agent("runboat")
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http, token })
    }

    async fn request(&self, method: reqwest::Method, url: &str, body: Option<Value>) -> Result<Value, GithubError> {
        let full_url = format!("{GITHUB_API}{url}");
        debug!(%full_url, "GitHub request");
        let mut request = self
            .http
            .request(method, &full_url)
            .header("Accept", "application/vnd.github.v3+json");
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("token {token}"));
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(GithubError::NotFound(full_url));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GithubError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await.unwrap_or(Value::Null))
    }

    /// Head commit of a branch.
    pub async fn branch_head(&self, repo: &str, branch: &str) -> Result<CommitInfo, GithubError> {
        let data = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{repo}/git/ref/heads/{branch}"),
                None,
            )
            .await?;
        let sha = data
            .pointer("/object/sha")
            .and_then(Value::as_str)
            .ok_or_else(|| GithubError::Api {
                status: 200,
                body: "branch ref without object.sha".to_string(),
            })?;
        Ok(CommitInfo::new(repo, branch, None, sha))
    }

    /// Head commit and base branch of a pull request.
    pub async fn pull_head(&self, repo: &str, pr: u64) -> Result<CommitInfo, GithubError> {
        let data = self
            .request(reqwest::Method::GET, &format!("/repos/{repo}/pulls/{pr}"), None)
            .await?;
        let sha = data.pointer("/head/sha").and_then(Value::as_str);
        let base = data.pointer("/base/ref").and_then(Value::as_str);
        match (sha, base) {
            (Some(sha), Some(base)) => Ok(CommitInfo::new(repo, base, Some(pr), sha)),
            _ => Err(GithubError::Api {
                status: 200,
                body: "pull request without head.sha/base.ref".to_string(),
            }),
        }
    }

    /// Posts a commit status with the runboat context.
    pub async fn notify_commit_status(
        &self,
        repo: &str,
        sha: &str,
        state: CommitState,
        target_url: Option<&str>,
    ) -> Result<(), GithubError> {
        self.request(
            reqwest::Method::POST,
            &format!("/repos/{repo}/statuses/{sha}"),
            Some(json!({
                "state": state.as_str(),
                "target_url": target_url,
                "context": STATUS_CONTEXT,
            })),
        )
        .await?;
        Ok(())
    }
}
