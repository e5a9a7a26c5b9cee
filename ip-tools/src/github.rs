use crate::error::{Result, ToolError};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;

const GITHUB_ACCEPT: &str = "application/vnd.github+json";
const GITHUB_API_VERSION: &str = "2022-11-28";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueUser {
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueLabel {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub user: Option<IssueUser>,
    #[serde(default)]
    pub labels: Vec<IssueLabel>,
}

/// The two issue operations the agent needs from the tracker.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn list_issues(&self, owner: &str, repo: &str) -> Result<Vec<Issue>>;
    async fn create_issue(&self, owner: &str, repo: &str, title: &str, body: &str)
    -> Result<Issue>;
}

/// GitHub REST client bound to the caller's token.
#[derive(Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    api_base_url: String,
    token: String,
    user_agent: String,
}

impl GithubClient {
    pub fn new(
        http: reqwest::Client,
        api_base_url: &str,
        token: &str,
        user_agent: &str,
    ) -> Result<Self> {
        let api_base_url = api_base_url.trim().trim_end_matches('/');
        if api_base_url.is_empty() {
            return Err(ToolError::InvalidArguments("github api base url is required".to_string()));
        }
        let token = token.trim();
        if token.is_empty() {
            return Err(ToolError::InvalidArguments("github token is required".to_string()));
        }
        Ok(Self {
            http,
            api_base_url: api_base_url.to_string(),
            token: token.to_string(),
            user_agent: user_agent.to_string(),
        })
    }

    fn issues_url(&self, owner: &str, repo: &str) -> Result<String> {
        let owner = validate_segment("owner", owner)?;
        let repo = validate_segment("repo", repo)?;
        Ok(format!("{}/repos/{owner}/{repo}/issues", self.api_base_url))
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, GITHUB_ACCEPT)
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
    }
}

#[async_trait]
impl IssueTracker for GithubClient {
    #[tracing::instrument(level = "info", skip_all, fields(owner = %owner, repo = %repo))]
    async fn list_issues(&self, owner: &str, repo: &str) -> Result<Vec<Issue>> {
        let url = self.issues_url(owner, repo)?;
        let response = self.request(reqwest::Method::GET, &url).send().await?;
        let body = read_success_body(response, owner, repo).await?;
        let issues: Vec<Issue> = serde_json::from_str(&body)?;
        tracing::debug!(issue_count = issues.len(), "github issues listed");
        Ok(issues)
    }

    #[tracing::instrument(level = "info", skip_all, fields(owner = %owner, repo = %repo))]
    async fn create_issue(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        body: &str,
    ) -> Result<Issue> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ToolError::InvalidArguments("title must not be empty".to_string()));
        }
        let url = self.issues_url(owner, repo)?;
        let response = self
            .request(reqwest::Method::POST, &url)
            .json(&json!({
                "title": title,
                "body": body,
            }))
            .send()
            .await?;
        let body = read_success_body(response, owner, repo).await?;
        let issue: Issue = serde_json::from_str(&body)?;
        tracing::info!(issue_number = issue.number, "github issue created");
        Ok(issue)
    }
}

async fn read_success_body(response: reqwest::Response, owner: &str, repo: &str) -> Result<String> {
    let status = response.status();
    let body = response.text().await?;
    if status.is_success() {
        return Ok(body);
    }
    tracing::warn!(status = status.as_u16(), "github request rejected");
    match status {
        StatusCode::NOT_FOUND => Err(ToolError::NotFound(format!("repository {owner}/{repo}"))),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ToolError::Unauthorized(
            format!("github status={status} body={body}"),
        )),
        _ => Err(ToolError::ExecutionFailed(format!("github status={status} body={body}"))),
    }
}

/// GitHub owner and repository names: ASCII alphanumerics, `-`, `_` and `.`,
/// never a bare `.` or `..`.
fn validate_segment<'a>(key: &str, value: &'a str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ToolError::InvalidArguments(format!("{key} must not be empty")));
    }
    if value == "." || value == ".." {
        return Err(ToolError::InvalidArguments(format!(
            "{key} must not be a relative path segment, got {value:?}"
        )));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(ToolError::InvalidArguments(format!(
            "{key} contains invalid character {c:?}, got {value:?}"
        )));
    }
    Ok(value)
}
