//! The persisted status record for one registration request.
//!
//! `RegistrationStatus` is a tagged union: each variant carries only the
//! fields that are meaningful in it, so a result can never sit next to an
//! error, and a terminal record always remembers the attempt it ended.
//! `RegistrationState` is the flat twelve-value view used for display and
//! for transition checks.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::classifier::{Classification, ErrorCategory};
use super::token::CorrelationToken;

/// Which remote system is currently being tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Phase 1: the processor pipeline that exports and validates.
    #[default]
    Origin,
    /// Phase 2: the approval pipeline that raises the change request and registers.
    Approval,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Origin => write!(f, "origin"),
            Phase::Approval => write!(f, "approval"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    Idle,
    Initiating,
    Exporting,
    Validating,
    ValidationFailed,
    RequestingApproval,
    ApprovalPending,
    ApprovalRejected,
    Finalizing,
    Completed,
    Cancelled,
    Failed,
}

impl RegistrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initiating => "initiating",
            Self::Exporting => "exporting",
            Self::Validating => "validating",
            Self::ValidationFailed => "validation_failed",
            Self::RequestingApproval => "requesting_approval",
            Self::ApprovalPending => "approval_pending",
            Self::ApprovalRejected => "approval_rejected",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Cancelled
                | Self::Failed
                | Self::ValidationFailed
                | Self::ApprovalRejected
        )
    }

    pub fn is_in_progress(&self) -> bool {
        !self.is_terminal() && *self != Self::Idle
    }

    /// Finalizing is past the point where the approval pipeline can be stopped.
    pub fn is_cancellable(&self) -> bool {
        self.is_in_progress() && *self != Self::Finalizing
    }

    /// A new dispatch is only allowed when no loop can be running.
    pub fn can_dispatch(&self) -> bool {
        !self.is_in_progress()
    }

    /// Index into the six-step progress display; `None` off the happy path.
    pub fn progress_step(&self) -> Option<usize> {
        match self {
            Self::Initiating => Some(0),
            Self::Exporting => Some(1),
            Self::Validating => Some(2),
            Self::RequestingApproval => Some(3),
            Self::ApprovalPending => Some(4),
            Self::Finalizing => Some(5),
            Self::Completed => Some(6),
            _ => None,
        }
    }
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegistrationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "initiating" => Ok(Self::Initiating),
            "exporting" => Ok(Self::Exporting),
            "validating" => Ok(Self::Validating),
            "validation_failed" => Ok(Self::ValidationFailed),
            "requesting_approval" => Ok(Self::RequestingApproval),
            "approval_pending" => Ok(Self::ApprovalPending),
            "approval_rejected" => Ok(Self::ApprovalRejected),
            "finalizing" => Ok(Self::Finalizing),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid registration state: {}", s)),
        }
    }
}

/// In-progress stages, declared in forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initiating,
    Exporting,
    Validating,
    RequestingApproval,
    ApprovalPending,
    Finalizing,
}

impl From<Stage> for RegistrationState {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Initiating => Self::Initiating,
            Stage::Exporting => Self::Exporting,
            Stage::Validating => Self::Validating,
            Stage::RequestingApproval => Self::RequestingApproval,
            Stage::ApprovalPending => Self::ApprovalPending,
            Stage::Finalizing => Self::Finalizing,
        }
    }
}

/// Terminal failure states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ValidationFailed,
    ApprovalRejected,
    Failed,
}

impl From<FailureKind> for RegistrationState {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::ValidationFailed => Self::ValidationFailed,
            FailureKind::ApprovalRejected => Self::ApprovalRejected,
            FailureKind::Failed => Self::Failed,
        }
    }
}

/// One dispatch attempt. A retry always starts a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub correlation_token: CorrelationToken,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl Attempt {
    pub fn new(correlation_token: CorrelationToken, started_at: DateTime<Utc>) -> Self {
        Self {
            correlation_token,
            started_at,
            dispatched_at: None,
        }
    }
}

/// How a run was matched to this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchConfidence {
    /// The listed run title carried the correlation token.
    #[default]
    Token,
    /// The token was only found by re-reading recent runs one by one.
    Degraded,
}

/// Identity of a resolved remote run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRef {
    pub id: u64,
    pub url: String,
    #[serde(default)]
    pub confidence: MatchConfidence,
}

/// Poll-loop bookkeeping, persisted so a reload resumes with the same budgets.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tracking {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_run: Option<RunRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_run: Option<RunRef>,
    /// Advisory progress hint, usually the running step's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_label: Option<String>,
    #[serde(default)]
    pub origin_attempts: u32,
    #[serde(default)]
    pub origin_resolve_attempts: u32,
    #[serde(default)]
    pub approval_resolve_attempts: u32,
    #[serde(default)]
    pub approval_running_attempts: u32,
}

impl Tracking {
    /// The run of the phase currently being tracked.
    pub fn remote_run(&self) -> Option<&RunRef> {
        match self.phase {
            Phase::Origin => self.origin_run.as_ref(),
            Phase::Approval => self.approval_run.as_ref(),
        }
    }
}

/// User-facing failure payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusError {
    pub category: ErrorCategory,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_url: Option<String>,
}

impl StatusError {
    pub fn from_classification(c: Classification, run_url: Option<String>) -> Self {
        Self {
            category: c.category,
            title: c.title,
            message: c.message,
            run_url,
        }
    }

    /// Fixed text for the category, with extra detail appended to the message.
    pub fn with_detail(category: ErrorCategory, detail: Option<&str>, run_url: Option<String>) -> Self {
        let mut c = Classification::for_category(category);
        if let Some(detail) = detail {
            c.message = format!("{} ({})", c.message, detail);
        }
        Self::from_classification(c, run_url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResult {
    pub revision: String,
    pub completed_at: DateTime<Utc>,
    pub artifact_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RegistrationStatus {
    #[default]
    Idle,
    InProgress {
        stage: Stage,
        attempt: Attempt,
        #[serde(default)]
        tracking: Tracking,
    },
    Completed {
        attempt: Attempt,
        #[serde(default)]
        tracking: Tracking,
        result: RegistrationResult,
    },
    Cancelled {
        attempt: Attempt,
        #[serde(default)]
        tracking: Tracking,
        cancelled_at: DateTime<Utc>,
    },
    Failed {
        kind: FailureKind,
        attempt: Attempt,
        #[serde(default)]
        tracking: Tracking,
        error: StatusError,
    },
}

impl RegistrationStatus {
    pub fn state(&self) -> RegistrationState {
        match self {
            Self::Idle => RegistrationState::Idle,
            Self::InProgress { stage, .. } => (*stage).into(),
            Self::Completed { .. } => RegistrationState::Completed,
            Self::Cancelled { .. } => RegistrationState::Cancelled,
            Self::Failed { kind, .. } => (*kind).into(),
        }
    }

    pub fn attempt(&self) -> Option<&Attempt> {
        match self {
            Self::Idle => None,
            Self::InProgress { attempt, .. }
            | Self::Completed { attempt, .. }
            | Self::Cancelled { attempt, .. }
            | Self::Failed { attempt, .. } => Some(attempt),
        }
    }

    pub fn tracking(&self) -> Option<&Tracking> {
        match self {
            Self::Idle => None,
            Self::InProgress { tracking, .. }
            | Self::Completed { tracking, .. }
            | Self::Cancelled { tracking, .. }
            | Self::Failed { tracking, .. } => Some(tracking),
        }
    }

    pub fn tracking_mut(&mut self) -> Option<&mut Tracking> {
        match self {
            Self::Idle => None,
            Self::InProgress { tracking, .. }
            | Self::Completed { tracking, .. }
            | Self::Cancelled { tracking, .. }
            | Self::Failed { tracking, .. } => Some(tracking),
        }
    }

    pub fn correlation_token(&self) -> Option<&CorrelationToken> {
        self.attempt().map(|a| &a.correlation_token)
    }

    pub fn error(&self) -> Option<&StatusError> {
        match self {
            Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn result(&self) -> Option<&RegistrationResult> {
        match self {
            Self::Completed { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Cancelled { cancelled_at, .. } => Some(*cancelled_at),
            _ => None,
        }
    }

    pub fn remote_run(&self) -> Option<&RunRef> {
        self.tracking().and_then(Tracking::remote_run)
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_in_progress(&self) -> bool {
        self.state().is_in_progress()
    }

    /// In progress under this attempt's token.
    pub fn is_owned_by(&self, token: &CorrelationToken) -> bool {
        self.is_in_progress() && self.correlation_token() == Some(token)
    }
}
