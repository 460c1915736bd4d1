//! Configuration for the registrar.
//!
//! Reads `.uat/registrar.toml` from the project directory, falling back to
//! the user config dir, then to built-in defaults. Layering is
//! file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [github]
//! api_base = "https://api.github.com"
//! token_env = "GITHUB_TOKEN"
//! git_ref = "main"
//!
//! [origin]
//! owner = "acme"
//! repo = "WSO2-Processor"
//! workflow = "receive-uat-request.yml"
//! event = "workflow_dispatch"
//!
//! [approval]
//! owner = "acme"
//! repo = "GIT-Helix-Processor"
//! workflow = "uat-approval.yml"
//! event = "repository_dispatch"
//!
//! [polling]
//! interval_secs = 10
//! origin_max_attempts = 60
//! origin_max_resolve_attempts = 12
//! approval_max_resolve_attempts = 30
//! approval_max_running_attempts = 360
//! search_window = 30
//! fallback_window_secs = 300
//!
//! [features]
//! uat_registration = true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::github::{is_valid_github_token, parse_owner_repo};

/// Placeholder shipped in the example config; treated as "not configured".
pub const TOKEN_PLACEHOLDER: &str = "YOUR_GITHUB_TOKEN_HERE";

const CONFIG_DIR: &str = ".uat";
const CONFIG_FILE: &str = "registrar.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubSection {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Environment variable holding the token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_git_ref")]
    pub git_ref: String,
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_git_ref() -> String {
    "main".to_string()
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            token_env: default_token_env(),
            git_ref: default_git_ref(),
        }
    }
}

/// One remote workflow plus the trigger event its runs are listed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTarget {
    pub owner: String,
    pub repo: String,
    pub workflow: String,
    pub event: String,
}

impl WorkflowTarget {
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    fn default_origin() -> Self {
        Self {
            owner: "your-org".to_string(),
            repo: "WSO2-Processor".to_string(),
            workflow: "receive-uat-request.yml".to_string(),
            event: "workflow_dispatch".to_string(),
        }
    }

    fn default_approval() -> Self {
        Self {
            owner: "your-org".to_string(),
            repo: "GIT-Helix-Processor".to_string(),
            workflow: "uat-approval.yml".to_string(),
            event: "repository_dispatch".to_string(),
        }
    }
}

/// Polling cadence and per-phase attempt budgets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Phase 1 tick budget, resolution included.
    #[serde(default = "default_origin_max_attempts")]
    pub origin_max_attempts: u32,
    #[serde(default = "default_origin_max_resolve_attempts")]
    pub origin_max_resolve_attempts: u32,
    /// Phase 2 resolve sub-budget.
    #[serde(default = "default_approval_max_resolve_attempts")]
    pub approval_max_resolve_attempts: u32,
    /// Phase 2 running sub-budget; approvals wait on humans.
    #[serde(default = "default_approval_max_running_attempts")]
    pub approval_max_running_attempts: u32,
    /// How many recent runs each listing call asks for.
    #[serde(default = "default_search_window")]
    pub search_window: u32,
    /// Age limit for runs re-read one by one in the degraded phase 1 scan.
    #[serde(default = "default_fallback_window_secs")]
    pub fallback_window_secs: u64,
}

fn default_interval_secs() -> u64 {
    10
}

fn default_origin_max_attempts() -> u32 {
    60
}

fn default_origin_max_resolve_attempts() -> u32 {
    12
}

fn default_approval_max_resolve_attempts() -> u32 {
    30
}

fn default_approval_max_running_attempts() -> u32 {
    360
}

fn default_search_window() -> u32 {
    30
}

fn default_fallback_window_secs() -> u64 {
    300
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            origin_max_attempts: default_origin_max_attempts(),
            origin_max_resolve_attempts: default_origin_max_resolve_attempts(),
            approval_max_resolve_attempts: default_approval_max_resolve_attempts(),
            approval_max_running_attempts: default_approval_max_running_attempts(),
            search_window: default_search_window(),
            fallback_window_secs: default_fallback_window_secs(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesSection {
    #[serde(default = "default_uat_registration")]
    pub uat_registration: bool,
}

fn default_uat_registration() -> bool {
    true
}

impl Default for FeaturesSection {
    fn default() -> Self {
        Self {
            uat_registration: default_uat_registration(),
        }
    }
}

/// The complete registrar.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrarConfig {
    #[serde(default)]
    pub github: GitHubSection,
    #[serde(default = "WorkflowTarget::default_origin")]
    pub origin: WorkflowTarget,
    #[serde(default = "WorkflowTarget::default_approval")]
    pub approval: WorkflowTarget,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub features: FeaturesSection,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            github: GitHubSection::default(),
            origin: WorkflowTarget::default_origin(),
            approval: WorkflowTarget::default_approval(),
            polling: PollingConfig::default(),
            features: FeaturesSection::default(),
        }
    }
}

impl RegistrarConfig {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse registrar.toml")
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Project file, then user config dir, then defaults; environment applied on top.
    pub fn load(project_dir: &Path, explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load_file(path)?,
            None => match Self::discover(project_dir) {
                Some(path) => Self::load_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn discover(project_dir: &Path) -> Option<PathBuf> {
        let project = Self::project_path(project_dir);
        if project.exists() {
            return Some(project);
        }
        dirs::config_dir()
            .map(|dir| dir.join("uat-registrar").join(CONFIG_FILE))
            .filter(|path| path.exists())
    }

    pub fn project_path(project_dir: &Path) -> PathBuf {
        project_dir.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Directory holding persisted status records.
    pub fn status_dir(project_dir: &Path) -> PathBuf {
        project_dir.join(CONFIG_DIR).join("status")
    }

    pub fn log_dir(project_dir: &Path) -> PathBuf {
        project_dir.join(CONFIG_DIR).join("logs")
    }

    /// Apply `UAT_*` overrides; `lookup` is `std::env::var` outside tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(base) = lookup("UAT_GITHUB_API_BASE") {
            self.github.api_base = base;
        }
        if let Some(slug) = lookup("UAT_ORIGIN_REPO") {
            let (owner, repo) = parse_owner_repo(&slug)
                .with_context(|| format!("UAT_ORIGIN_REPO is not owner/repo: {}", slug))?;
            self.origin.owner = owner;
            self.origin.repo = repo;
        }
        if let Some(slug) = lookup("UAT_APPROVAL_REPO") {
            let (owner, repo) = parse_owner_repo(&slug)
                .with_context(|| format!("UAT_APPROVAL_REPO is not owner/repo: {}", slug))?;
            self.approval.owner = owner;
            self.approval.repo = repo;
        }
        if let Some(secs) = lookup("UAT_POLL_INTERVAL_SECS") {
            self.polling.interval_secs = secs
                .parse()
                .with_context(|| format!("UAT_POLL_INTERVAL_SECS is not a number: {}", secs))?;
        }
        Ok(())
    }

    /// Non-fatal problems worth showing to the user.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.polling.interval_secs == 0 {
            warnings.push("polling.interval_secs is 0; the registrar will poll GitHub without pause".into());
        }
        if self.polling.origin_max_resolve_attempts > self.polling.origin_max_attempts {
            warnings.push(
                "polling.origin_max_resolve_attempts exceeds origin_max_attempts; the phase timeout fires first"
                    .into(),
            );
        }
        if self.polling.search_window == 0 || self.polling.search_window > 100 {
            warnings.push("polling.search_window should be between 1 and 100".into());
        }
        for (name, target) in [("origin", &self.origin), ("approval", &self.approval)] {
            if target.owner == "your-org" {
                warnings.push(format!("{}.owner still has the example value", name));
            }
            if target.workflow.is_empty() {
                warnings.push(format!("{}.workflow is empty", name));
            }
        }
        if !self.features.uat_registration {
            warnings.push("features.uat_registration is disabled".into());
        }
        warnings
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

/// Endpoint and token for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub endpoint: String,
    pub token: String,
}

/// Opaque source of GitHub credentials.
pub trait CredentialProvider: Send + Sync {
    /// `None` when nothing usable is configured.
    fn resolve(&self) -> Option<Credentials>;
}

/// Reads the token from the environment variable named in the config.
pub struct EnvCredentialProvider {
    endpoint: String,
    var: String,
}

impl EnvCredentialProvider {
    pub fn from_config(config: &RegistrarConfig) -> Self {
        Self {
            endpoint: config.github.api_base.clone(),
            var: config.github.token_env.clone(),
        }
    }
}

impl CredentialProvider for EnvCredentialProvider {
    fn resolve(&self) -> Option<Credentials> {
        let token = std::env::var(&self.var).ok()?;
        credentials_from(&self.endpoint, &token)
    }
}

/// Fixed credentials, or none; used when embedding and in tests.
pub struct StaticCredentials(pub Option<Credentials>);

impl CredentialProvider for StaticCredentials {
    fn resolve(&self) -> Option<Credentials> {
        self.0
            .as_ref()
            .and_then(|c| credentials_from(&c.endpoint, &c.token))
    }
}

/// Apply the "not configured" rules to a raw token.
pub fn credentials_from(endpoint: &str, token: &str) -> Option<Credentials> {
    let token = token.trim();
    if token.is_empty() || token == TOKEN_PLACEHOLDER {
        return None;
    }
    if !is_valid_github_token(token) {
        tracing::warn!("GitHub token does not carry a known prefix; using it anyway");
    }
    Some(Credentials {
        endpoint: endpoint.to_string(),
        token: token.to_string(),
    })
}
