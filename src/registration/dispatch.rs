//! Starts phase 1 by triggering the processor workflow.
//!
//! The correlation token travels as the `correlationToken` input. The
//! processor workflow renders it into its `run-name`, which is what the
//! resolver later searches for.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{CredentialProvider, Credentials, WorkflowTarget};
use crate::errors::{ApiError, RegistrationError};
use crate::github::WorkflowApi;

use super::token::CorrelationToken;

/// Identity of the entity being registered, as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub entity_id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub api_type: Option<String>,
    #[serde(default)]
    pub lifecycle_status: Option<String>,
}

impl RegistrationRequest {
    pub fn new(entity_id: &str, name: &str, version: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            context: None,
            user_id: None,
            provider: None,
            api_type: None,
            lifecycle_status: None,
        }
    }
}

/// Workflow inputs. GitHub requires every dispatch input to be a string.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct DispatchInputs<'a> {
    correlation_token: &'a str,
    api_id: &'a str,
    api_name: &'a str,
    api_version: &'a str,
    api_context: &'a str,
    user_id: &'a str,
    timestamp: String,
    metadata: String,
}

pub fn build_inputs(
    request: &RegistrationRequest,
    token: &CorrelationToken,
    now: DateTime<Utc>,
) -> serde_json::Value {
    let metadata = serde_json::json!({
        "provider": request.provider.as_deref().unwrap_or("admin"),
        "type": request.api_type.as_deref().unwrap_or("HTTP"),
        "lifeCycleStatus": request.lifecycle_status.as_deref().unwrap_or("PUBLISHED"),
    });
    let inputs = DispatchInputs {
        correlation_token: token.as_str(),
        api_id: &request.entity_id,
        api_name: &request.name,
        api_version: &request.version,
        api_context: request.context.as_deref().unwrap_or(""),
        user_id: request.user_id.as_deref().unwrap_or("unknown"),
        timestamp: now.to_rfc3339(),
        metadata: metadata.to_string(),
    };
    serde_json::to_value(inputs).unwrap_or_default()
}

/// Resolve credentials or fail before any network call is made.
pub fn require_credentials(
    provider: &dyn CredentialProvider,
) -> Result<Credentials, RegistrationError> {
    provider
        .resolve()
        .ok_or(RegistrationError::ConfigurationMissing)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatched {
    pub dispatched_at: DateTime<Utc>,
}

pub struct TriggerDispatcher {
    api: Arc<dyn WorkflowApi>,
    target: WorkflowTarget,
    git_ref: String,
}

impl TriggerDispatcher {
    pub fn new(api: Arc<dyn WorkflowApi>, target: WorkflowTarget, git_ref: String) -> Self {
        Self {
            api,
            target,
            git_ref,
        }
    }

    /// Exactly one outbound call. Never retried here.
    pub async fn dispatch(
        &self,
        auth: &Credentials,
        request: &RegistrationRequest,
        token: &CorrelationToken,
        now: DateTime<Utc>,
    ) -> Result<Dispatched, RegistrationError> {
        let inputs = build_inputs(request, token, now);
        match self
            .api
            .dispatch_workflow(auth, &self.target, &self.git_ref, &inputs)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    entity_id = %request.entity_id,
                    token = %token,
                    workflow = %self.target.workflow,
                    repo = %self.target.slug(),
                    "Dispatched registration workflow"
                );
                Ok(Dispatched { dispatched_at: now })
            }
            Err(ApiError::Status { status, body }) => {
                Err(RegistrationError::DispatchFailed { status, body })
            }
            Err(err) => Err(RegistrationError::DispatchFailed {
                status: 0,
                body: err.to_string(),
            }),
        }
    }
}
