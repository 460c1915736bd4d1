//! Scriptable GitHub double and a hand-driven clock for loop tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Notify;

use crate::config::{Credentials, RegistrarConfig, WorkflowTarget};
use crate::errors::ApiError;
use crate::github::{Job, JobStep, RunConclusion, RunStatus, WorkflowApi, WorkflowRun};
use crate::store::StatusStore;

use super::machine::{Event, apply};
use super::poller::Clock;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap()
}

pub fn auth() -> Credentials {
    Credentials {
        endpoint: "https://api.github.com".into(),
        token: "ghp_test".into(),
    }
}

pub fn config() -> RegistrarConfig {
    let mut config = RegistrarConfig::default();
    config.polling.origin_max_attempts = 8;
    config.polling.origin_max_resolve_attempts = 3;
    config.polling.approval_max_resolve_attempts = 3;
    config.polling.approval_max_running_attempts = 4;
    config
}

pub fn run(id: u64, title: &str, status: RunStatus, conclusion: Option<RunConclusion>) -> WorkflowRun {
    WorkflowRun {
        id,
        name: None,
        display_title: title.to_string(),
        status,
        conclusion,
        event: "workflow_dispatch".into(),
        created_at: t0(),
        html_url: format!("https://github.com/your-org/repo/actions/runs/{}", id),
    }
}

pub fn job(steps: &[(&str, RunStatus, Option<RunConclusion>)]) -> Job {
    Job {
        name: "register".into(),
        status: RunStatus::InProgress,
        conclusion: None,
        steps: steps
            .iter()
            .map(|(name, status, conclusion)| JobStep {
                name: name.to_string(),
                status: *status,
                conclusion: *conclusion,
            })
            .collect(),
    }
}

/// Runs and jobs per repository, mutated by the test between ticks.
#[derive(Default)]
pub struct ScriptedApi {
    runs: Mutex<Vec<(String, WorkflowRun)>>,
    jobs: Mutex<HashMap<u64, Vec<Job>>>,
    pub dispatches: Mutex<Vec<serde_json::Value>>,
    pub dispatch_reply: Mutex<Option<(u16, String)>>,
    pub listing_down: Mutex<bool>,
    /// Writes a cancel for this entity while a `get_run` call is in flight.
    cancel_during_get_run: Mutex<Option<CancelHook>>,
    /// Same, while the dispatch POST is in flight.
    cancel_during_dispatch: Mutex<Option<CancelHook>>,
    /// The next dispatch waits on this until notified.
    dispatch_gate: Mutex<Option<Arc<Notify>>>,
}

type CancelHook = (Arc<dyn StatusStore>, String);

async fn fire(hook: Option<CancelHook>) {
    if let Some((store, entity_id)) = hook {
        let current = store.load(&entity_id).await.unwrap();
        let cancelled = apply(current, Event::Cancel { at: t0() });
        store.save(&entity_id, &cancelled).await.unwrap();
    }
}

impl ScriptedApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert or replace a run in `repo`. Newest first, like the listing.
    pub fn put_run(&self, repo: &str, run: WorkflowRun) {
        let mut runs = self.runs.lock().unwrap();
        runs.retain(|(_, r)| r.id != run.id);
        runs.insert(0, (repo.to_string(), run));
    }

    pub fn put_jobs(&self, run_id: u64, jobs: Vec<Job>) {
        self.jobs.lock().unwrap().insert(run_id, jobs);
    }

    pub fn cancel_during_get_run(&self, store: Arc<dyn StatusStore>, entity_id: &str) {
        *self.cancel_during_get_run.lock().unwrap() = Some((store, entity_id.to_string()));
    }

    pub fn cancel_during_dispatch(&self, store: Arc<dyn StatusStore>, entity_id: &str) {
        *self.cancel_during_dispatch.lock().unwrap() = Some((store, entity_id.to_string()));
    }

    /// Hold the next dispatch open; notify the returned handle to let it finish.
    pub fn hold_next_dispatch(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.dispatch_gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl WorkflowApi for ScriptedApi {
    async fn dispatch_workflow(
        &self,
        _: &Credentials,
        _: &WorkflowTarget,
        _: &str,
        inputs: &serde_json::Value,
    ) -> Result<(), ApiError> {
        self.dispatches.lock().unwrap().push(inputs.clone());
        let gate = self.dispatch_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let hook = self.cancel_during_dispatch.lock().unwrap().take();
        fire(hook).await;
        match self.dispatch_reply.lock().unwrap().clone() {
            None => Ok(()),
            Some((status, body)) => Err(ApiError::Status { status, body }),
        }
    }

    async fn list_runs(
        &self,
        _: &Credentials,
        target: &WorkflowTarget,
        per_page: u32,
    ) -> Result<Vec<WorkflowRun>, ApiError> {
        if *self.listing_down.lock().unwrap() {
            return Err(ApiError::Status {
                status: 502,
                body: "Bad Gateway".into(),
            });
        }
        Ok(self
            .runs
            .lock()
            .unwrap()
            .iter()
            .filter(|(repo, _)| *repo == target.repo)
            .map(|(_, run)| run.clone())
            .take(per_page as usize)
            .collect())
    }

    async fn get_run(
        &self,
        _: &Credentials,
        _: &WorkflowTarget,
        run_id: u64,
    ) -> Result<WorkflowRun, ApiError> {
        let hook = self.cancel_during_get_run.lock().unwrap().take();
        fire(hook).await;
        self.runs
            .lock()
            .unwrap()
            .iter()
            .find(|(_, run)| run.id == run_id)
            .map(|(_, run)| run.clone())
            .ok_or(ApiError::Status {
                status: 404,
                body: "Not Found".into(),
            })
    }

    async fn list_jobs(
        &self,
        _: &Credentials,
        _: &WorkflowTarget,
        run_id: u64,
    ) -> Result<Vec<Job>, ApiError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Sleeping advances time instantly.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    pub sleeps: Mutex<u32>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(t0()),
            sleeps: Mutex::new(0),
        })
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        *self.sleeps.lock().unwrap() += 1;
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(duration).unwrap();
    }
}
