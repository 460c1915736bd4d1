//! GitHub Actions REST client.
//!
//! The registrar only needs four calls: trigger a workflow, list its recent
//! runs, read one run, and list a run's jobs. They sit behind `WorkflowApi`
//! so the poll loop can be driven by a scripted fake in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{Credentials, WorkflowTarget};
use crate::errors::ApiError;

const USER_AGENT: &str = "uat-registrar";
const API_VERSION: &str = "2022-11-28";

/// Run lifecycle as reported by GitHub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[serde(alias = "waiting", alias = "pending", alias = "requested")]
    Queued,
    InProgress,
    Completed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunConclusion {
    Success,
    Failure,
    Cancelled,
    TimedOut,
    #[serde(other)]
    Other,
}

impl RunConclusion {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// A workflow run (subset of fields we care about).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    /// Rendered `run-name`; this is where the correlation token shows up.
    #[serde(default)]
    pub display_title: String,
    pub status: RunStatus,
    #[serde(default)]
    pub conclusion: Option<RunConclusion>,
    #[serde(default)]
    pub event: String,
    pub created_at: DateTime<Utc>,
    pub html_url: String,
}

impl WorkflowRun {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn succeeded(&self) -> bool {
        self.is_completed() && self.conclusion.is_some_and(|c| c.is_success())
    }
}

#[derive(Debug, Deserialize)]
struct WorkflowRunsPage {
    #[serde(default)]
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStep {
    pub name: String,
    pub status: RunStatus,
    #[serde(default)]
    pub conclusion: Option<RunConclusion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub name: String,
    pub status: RunStatus,
    #[serde(default)]
    pub conclusion: Option<RunConclusion>,
    #[serde(default)]
    pub steps: Vec<JobStep>,
}

#[derive(Debug, Deserialize)]
struct JobsPage {
    #[serde(default)]
    jobs: Vec<Job>,
}

/// Abstraction over the GitHub Actions API for testability.
/// Real implementation: `GitHubActionsClient`.
#[async_trait]
pub trait WorkflowApi: Send + Sync {
    /// Trigger a `workflow_dispatch`. GitHub answers 204 with no body on success.
    async fn dispatch_workflow(
        &self,
        auth: &Credentials,
        target: &WorkflowTarget,
        git_ref: &str,
        inputs: &serde_json::Value,
    ) -> Result<(), ApiError>;

    /// Most recent runs of the target workflow, newest first, filtered by event.
    async fn list_runs(
        &self,
        auth: &Credentials,
        target: &WorkflowTarget,
        per_page: u32,
    ) -> Result<Vec<WorkflowRun>, ApiError>;

    async fn get_run(
        &self,
        auth: &Credentials,
        target: &WorkflowTarget,
        run_id: u64,
    ) -> Result<WorkflowRun, ApiError>;

    async fn list_jobs(
        &self,
        auth: &Credentials,
        target: &WorkflowTarget,
        run_id: u64,
    ) -> Result<Vec<Job>, ApiError>;
}

pub struct GitHubActionsClient {
    http: reqwest::Client,
}

impl GitHubActionsClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    fn request(
        &self,
        method: reqwest::Method,
        auth: &Credentials,
        url: &str,
    ) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", auth.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .header("User-Agent", USER_AGENT)
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<reqwest::Response, ApiError> {
        let resp = builder.send().await.map_err(|source| ApiError::Transport {
            url: url.to_string(),
            source,
        })?;

        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(ApiError::Status { status, body })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<T, ApiError> {
        self.send(builder, url)
            .await?
            .json::<T>()
            .await
            .map_err(|source| ApiError::Decode {
                url: url.to_string(),
                source,
            })
    }
}

impl Default for GitHubActionsClient {
    fn default() -> Self {
        Self::new()
    }
}

fn repo_url(auth: &Credentials, target: &WorkflowTarget) -> String {
    format!(
        "{}/repos/{}/{}",
        auth.endpoint.trim_end_matches('/'),
        target.owner,
        target.repo
    )
}

#[async_trait]
impl WorkflowApi for GitHubActionsClient {
    async fn dispatch_workflow(
        &self,
        auth: &Credentials,
        target: &WorkflowTarget,
        git_ref: &str,
        inputs: &serde_json::Value,
    ) -> Result<(), ApiError> {
        let url = format!(
            "{}/actions/workflows/{}/dispatches",
            repo_url(auth, target),
            target.workflow
        );
        let payload = serde_json::json!({ "ref": git_ref, "inputs": inputs });
        let resp = self
            .send(
                self.request(reqwest::Method::POST, auth, &url).json(&payload),
                &url,
            )
            .await?;

        // Anything other than "accepted, no content" is a rejection.
        if resp.status() != reqwest::StatusCode::NO_CONTENT {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }
        Ok(())
    }

    async fn list_runs(
        &self,
        auth: &Credentials,
        target: &WorkflowTarget,
        per_page: u32,
    ) -> Result<Vec<WorkflowRun>, ApiError> {
        let url = format!(
            "{}/actions/workflows/{}/runs",
            repo_url(auth, target),
            target.workflow
        );
        let builder = self.request(reqwest::Method::GET, auth, &url).query(&[
            ("event", target.event.as_str()),
            ("per_page", &per_page.to_string()),
        ]);
        let page: WorkflowRunsPage = self.get_json(builder, &url).await?;
        Ok(page.workflow_runs)
    }

    async fn get_run(
        &self,
        auth: &Credentials,
        target: &WorkflowTarget,
        run_id: u64,
    ) -> Result<WorkflowRun, ApiError> {
        let url = format!("{}/actions/runs/{}", repo_url(auth, target), run_id);
        let builder = self.request(reqwest::Method::GET, auth, &url);
        self.get_json(builder, &url).await
    }

    async fn list_jobs(
        &self,
        auth: &Credentials,
        target: &WorkflowTarget,
        run_id: u64,
    ) -> Result<Vec<Job>, ApiError> {
        let url = format!("{}/actions/runs/{}/jobs", repo_url(auth, target), run_id);
        let builder = self
            .request(reqwest::Method::GET, auth, &url)
            .query(&[("per_page", "100")]);
        let page: JobsPage = self.get_json(builder, &url).await?;
        Ok(page.jobs)
    }
}

/// Known GitHub token prefixes.
/// See: https://github.blog/2021-04-05-behind-githubs-new-authentication-token-formats/
const GITHUB_TOKEN_PREFIXES: &[&str] = &[
    "ghp_",        // Personal access tokens (classic)
    "github_pat_", // Fine-grained personal access tokens
    "gho_",        // OAuth access tokens
    "ghu_",        // GitHub App user-to-server tokens
    "ghs_",        // GitHub App server-to-server tokens
    "ghr_",        // GitHub App refresh tokens
];

/// Format check only; it does not verify the token is active.
pub fn is_valid_github_token(token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    GITHUB_TOKEN_PREFIXES
        .iter()
        .any(|prefix| token.starts_with(prefix))
}

/// Parse `owner/repo` from either a bare slug or a GitHub URL.
///
/// Accepts:
/// - `owner/repo`
/// - `https://github.com/owner/repo`
/// - `https://github.com/owner/repo.git`
pub fn parse_owner_repo(value: &str) -> Option<(String, String)> {
    let path = value
        .strip_prefix("https://github.com/")
        .or_else(|| value.strip_prefix("github.com/"))
        .unwrap_or(value);
    let path = path.strip_suffix(".git").unwrap_or(path);

    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() == 2 && !parts[0].is_empty() && !parts[1].is_empty() && !parts[0].contains(':')
    {
        Some((parts[0].to_string(), parts[1].to_string()))
    } else {
        None
    }
}
