//! Reads a run's jobs and steps for progress hints and failure diagnosis.

use std::sync::Arc;

use crate::config::{Credentials, WorkflowTarget};
use crate::errors::ApiError;
use crate::github::{Job, RunConclusion, RunStatus, WorkflowApi};

use super::status::Stage;

/// Ordered step-name rules for the advisory stage. First match wins.
const STAGE_RULES: &[(&[&str], Stage)] = &[
    (
        &["approval", "crq", "helix", "ticket", "forward"],
        Stage::RequestingApproval,
    ),
    (
        &["validat", "lint", "spectral", "subdominio"],
        Stage::Validating,
    ),
    (&["export", "fetch", "download"], Stage::Exporting),
];

/// Map a running step's name to an in-progress stage, if it says anything.
pub fn stage_for_step(step_name: &str) -> Option<Stage> {
    let lower = step_name.to_lowercase();
    STAGE_RULES
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(_, stage)| *stage)
}

/// First step that failed or timed out, across jobs in order.
pub fn failed_step(jobs: &[Job]) -> Option<String> {
    jobs.iter()
        .flat_map(|job| job.steps.iter())
        .find(|step| {
            matches!(
                step.conclusion,
                Some(RunConclusion::Failure) | Some(RunConclusion::TimedOut)
            )
        })
        .map(|step| step.name.clone())
}

/// The step currently executing, or the last one that finished.
pub fn current_step(jobs: &[Job]) -> Option<String> {
    let steps: Vec<_> = jobs.iter().flat_map(|job| job.steps.iter()).collect();
    steps
        .iter()
        .find(|step| step.status == RunStatus::InProgress)
        .or_else(|| {
            steps
                .iter()
                .rev()
                .find(|step| step.status == RunStatus::Completed)
        })
        .map(|step| step.name.clone())
}

/// What the jobs endpoint said about one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    pub current_step: Option<String>,
    pub failed_step: Option<String>,
}

impl StepReport {
    pub fn from_jobs(jobs: &[Job]) -> Self {
        Self {
            current_step: current_step(jobs),
            failed_step: failed_step(jobs),
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        self.current_step.as_deref().and_then(stage_for_step)
    }
}

pub struct StepInspector {
    api: Arc<dyn WorkflowApi>,
}

impl StepInspector {
    pub fn new(api: Arc<dyn WorkflowApi>) -> Self {
        Self { api }
    }

    pub async fn inspect(
        &self,
        auth: &Credentials,
        target: &WorkflowTarget,
        run_id: u64,
    ) -> Result<StepReport, ApiError> {
        let jobs = self.api.list_jobs(auth, target, run_id).await?;
        Ok(StepReport::from_jobs(&jobs))
    }
}
