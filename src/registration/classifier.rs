//! Maps a failed remote step to a failure category and a human message.
//!
//! Both the matching rules and the title/message pairs are plain tables so
//! they can be audited and tested without running a pipeline. Rule order is
//! significant: the first rule with a matching keyword wins, because step
//! names such as "Merge pull request" hit more than one category.

use serde::{Deserialize, Serialize};

use super::status::FailureKind;

/// Failure categories recorded on a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    NoDeployedRevision,
    InvalidDomainProperty,
    RemoteSystemUnavailable,
    ApprovalSystemError,
    MergeFailed,
    SourceControlError,
    UnknownStepFailure,
    UnknownJobFailure,
    ConfigurationMissing,
    DispatchFailed,
    RunNotFound,
    PhaseTimeout,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoDeployedRevision => "no_deployed_revision",
            Self::InvalidDomainProperty => "invalid_domain_property",
            Self::RemoteSystemUnavailable => "remote_system_unavailable",
            Self::ApprovalSystemError => "approval_system_error",
            Self::MergeFailed => "merge_failed",
            Self::SourceControlError => "source_control_error",
            Self::UnknownStepFailure => "unknown_step_failure",
            Self::UnknownJobFailure => "unknown_job_failure",
            Self::ConfigurationMissing => "configuration_missing",
            Self::DispatchFailed => "dispatch_failed",
            Self::RunNotFound => "run_not_found",
            Self::PhaseTimeout => "phase_timeout",
        }
    }

    /// Which terminal state a failure in this category lands in.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::NoDeployedRevision | Self::InvalidDomainProperty => FailureKind::ValidationFailed,
            Self::ApprovalSystemError => FailureKind::ApprovalRejected,
            _ => FailureKind::Failed,
        }
    }

    /// Fixed title and message template for this category.
    pub fn text(&self) -> (&'static str, &'static str) {
        MESSAGES
            .iter()
            .find(|(category, _, _)| category == self)
            .map(|(_, title, message)| (*title, *message))
            .unwrap_or(("Registration failed", "The registration could not be completed."))
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered matching rules over the lower-cased step name.
const RULES: &[(&[&str], ErrorCategory)] = &[
    (&["deploy", "revision"], ErrorCategory::NoDeployedRevision),
    (
        &["subdominio", "subdomain", "dominio", "domain", "validate"],
        ErrorCategory::InvalidDomainProperty,
    ),
    // Export re-reads the same property, so its failures share the category.
    (&["export"], ErrorCategory::InvalidDomainProperty),
    (
        &["login", "connect", "setup", "set up"],
        ErrorCategory::RemoteSystemUnavailable,
    ),
    (
        &["helix", "crq", "approval", "ticket", "forward"],
        ErrorCategory::ApprovalSystemError,
    ),
    (&["merge"], ErrorCategory::MergeFailed),
    (
        &["pull request", "pull-request", "branch", "push", "git"],
        ErrorCategory::SourceControlError,
    ),
];

/// `{step}` in a template is replaced with the raw failed step name.
const MESSAGES: &[(ErrorCategory, &str, &str)] = &[
    (
        ErrorCategory::NoDeployedRevision,
        "No deployed revision",
        "The API has no deployed revision to export. Deploy a revision in the Publisher and retry.",
    ),
    (
        ErrorCategory::InvalidDomainProperty,
        "Missing subdominio property",
        "The API must define the 'subdominio' additional property with a known domain value. Add it in the Publisher and retry.",
    ),
    (
        ErrorCategory::RemoteSystemUnavailable,
        "Processor unavailable",
        "The processor could not log in to or connect with a required system. Retry later or contact the platform team.",
    ),
    (
        ErrorCategory::ApprovalSystemError,
        "Approval request failed",
        "The change request could not be created or forwarded to the approval system.",
    ),
    (
        ErrorCategory::MergeFailed,
        "Merge failed",
        "The registration pull request could not be merged. It may have conflicts with another change.",
    ),
    (
        ErrorCategory::SourceControlError,
        "Source control error",
        "Creating the branch, pushing, or opening the pull request failed.",
    ),
    (
        ErrorCategory::UnknownStepFailure,
        "Pipeline step failed",
        "Step '{step}' failed. Check the run logs for details.",
    ),
    (
        ErrorCategory::UnknownJobFailure,
        "Pipeline failed",
        "The pipeline failed without reporting a failed step. Check the run logs for details.",
    ),
    (
        ErrorCategory::ConfigurationMissing,
        "GitHub not configured",
        "No GitHub token is configured for the registrar. Set it and retry.",
    ),
    (
        ErrorCategory::DispatchFailed,
        "Could not start registration",
        "The processor workflow could not be triggered.",
    ),
    (
        ErrorCategory::RunNotFound,
        "Processor run not found",
        "No pipeline run carrying this request's correlation token appeared in time.",
    ),
    (
        ErrorCategory::PhaseTimeout,
        "Registration timed out",
        "The pipeline did not finish within the polling budget. Check the run before retrying.",
    ),
];

/// A classified failure, ready to be written onto the status record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: ErrorCategory,
    pub title: String,
    pub message: String,
}

impl Classification {
    pub fn for_category(category: ErrorCategory) -> Self {
        let (title, message) = category.text();
        Self {
            category,
            title: title.to_string(),
            message: message.to_string(),
        }
    }
}

/// Classify a failed run by the name of its failed step.
///
/// `None` means the run failed without any step-level detail.
pub fn classify(failed_step: Option<&str>) -> Classification {
    let Some(step) = failed_step else {
        return Classification::for_category(ErrorCategory::UnknownJobFailure);
    };

    let lower = step.to_lowercase();
    let category = RULES
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(_, category)| *category)
        .unwrap_or(ErrorCategory::UnknownStepFailure);

    let (title, template) = category.text();
    Classification {
        category,
        title: title.to_string(),
        message: template.replace("{step}", step),
    }
}
