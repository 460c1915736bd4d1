//! Typed error hierarchy for the registrar.
//!
//! Three top-level enums cover the three seams:
//! - `RegistrationError` - lifecycle failures surfaced on the status record
//! - `ApiError` - GitHub Actions HTTP client failures
//! - `StoreError` - status persistence failures

use thiserror::Error;

use crate::registration::classifier::ErrorCategory;
use crate::registration::status::{Phase, RegistrationState};

/// Errors from the registration lifecycle.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("GitHub credentials are not configured")]
    ConfigurationMissing,

    #[error("Workflow dispatch rejected ({status}): {body}")]
    DispatchFailed { status: u16, body: String },

    #[error("No {phase} run matched the correlation token after {attempts} attempts")]
    RunNotFound { phase: Phase, attempts: u32 },

    #[error("{phase} phase did not finish within {attempts} polling attempts")]
    PhaseTimeout { phase: Phase, attempts: u32 },

    #[error("Remote step failed: {category}")]
    RemoteStepFailed { category: ErrorCategory },

    #[error("Transient network error: {0}")]
    TransientNetwork(#[source] ApiError),

    #[error("A registration for {entity_id} is already in progress")]
    AlreadyInProgress { entity_id: String },

    #[error("Registration of {entity_id} became {state} while the dispatch was in flight")]
    Interrupted {
        entity_id: String,
        state: RegistrationState,
    },

    #[error("UAT registration is disabled in the configuration")]
    FeatureDisabled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RegistrationError {
    /// Network failures are retried by the next tick; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }
}

impl From<ApiError> for RegistrationError {
    fn from(err: ApiError) -> Self {
        Self::TransientNetwork(err)
    }
}

/// Errors from the GitHub Actions REST client.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("GitHub API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode GitHub response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Errors from the status persistence port.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to access status file at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt status record for {entity_id}: {source}")]
    Corrupt {
        entity_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Status store lock poisoned")]
    LockPoisoned,

    #[error("Status store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
