//! Drives one registration from dispatch to a terminal state.
//!
//! One `PhasePoller` owns one entity's loop. Every tick starts from the
//! persisted record, so a cancel written by another process is seen on the
//! next tick, and every write re-reads the record first so the loop never
//! overwrites a cancel that landed while a network call was in flight.
//!
//! Phase 1 tracks the processor run, phase 2 the approval run. Each phase has
//! its own run id and its own attempt budget; the interval is fixed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{Credentials, RegistrarConfig, WorkflowTarget};
use crate::errors::{ApiError, RegistrationError};
use crate::github::{RunStatus, WorkflowApi, WorkflowRun};
use crate::store::{SaveOutcome, StatusStore};

use super::classifier::{ErrorCategory, classify};
use super::inspector::StepInspector;
use super::machine::{Event, apply};
use super::resolver::{FallbackWindow, ResolveOutcome, RunQuery, RunResolver};
use super::status::{Phase, RegistrationStatus, RunRef, StatusError};
use super::token::CorrelationToken;

/// Time source and delay for the poll loop; tests drive it by hand.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by the tokio timer.
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Still in progress; wait one interval and tick again.
    Continue,
    /// Terminal, cancelled, or superseded. The loop exits with this record.
    Stopped(RegistrationStatus),
}

/// Result of looking for a phase's run on this tick.
enum Located {
    Run(WorkflowRun),
    Done(TickOutcome),
}

pub struct PhasePoller {
    entity_id: String,
    token: CorrelationToken,
    auth: Credentials,
    config: Arc<RegistrarConfig>,
    store: Arc<dyn StatusStore>,
    api: Arc<dyn WorkflowApi>,
    clock: Arc<dyn Clock>,
    resolver: RunResolver,
    inspector: StepInspector,
    /// Last record this loop wrote; governs the session if the store fails.
    last: Mutex<RegistrationStatus>,
}

impl std::fmt::Debug for PhasePoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhasePoller")
            .field("entity_id", &self.entity_id)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl PhasePoller {
    /// Returns `None` unless `status` is an in-progress attempt.
    pub fn new(
        entity_id: &str,
        status: RegistrationStatus,
        auth: Credentials,
        config: Arc<RegistrarConfig>,
        store: Arc<dyn StatusStore>,
        api: Arc<dyn WorkflowApi>,
        clock: Arc<dyn Clock>,
    ) -> Option<Self> {
        if !status.is_in_progress() {
            return None;
        }
        let token = status.correlation_token()?.clone();
        Some(Self {
            entity_id: entity_id.to_string(),
            token,
            auth,
            config,
            store,
            resolver: RunResolver::new(api.clone()),
            inspector: StepInspector::new(api.clone()),
            api,
            clock,
            last: Mutex::new(status),
        })
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn token(&self) -> &CorrelationToken {
        &self.token
    }

    /// Tick until the record is terminal or something outside the loop stops it.
    pub async fn run(&self) -> RegistrationStatus {
        let interval = self.config.polling.interval();
        tracing::info!(
            entity_id = %self.entity_id,
            token = %self.token,
            interval_secs = interval.as_secs(),
            "Polling registration"
        );
        loop {
            self.clock.sleep(interval).await;
            if let TickOutcome::Stopped(status) = self.tick().await {
                tracing::info!(
                    entity_id = %self.entity_id,
                    token = %self.token,
                    state = %status.state(),
                    "Polling stopped"
                );
                return status;
            }
        }
    }

    /// One pass: read, resolve or inspect, transition, write.
    pub async fn tick(&self) -> TickOutcome {
        let current = match self.store.load(&self.entity_id).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(entity_id = %self.entity_id, error = %e, "Failed to load status; using in-memory copy");
                self.remembered()
            }
        };

        if !self.owns(&current) {
            return TickOutcome::Stopped(current);
        }

        match current.tracking().map(|t| t.phase).unwrap_or_default() {
            Phase::Origin => self.tick_origin(current).await,
            Phase::Approval => self.tick_approval(current).await,
        }
    }

    async fn tick_origin(&self, mut status: RegistrationStatus) -> TickOutcome {
        let polling = &self.config.polling;
        let target = &self.config.origin;

        let Some(tracking) = status.tracking_mut() else {
            return TickOutcome::Stopped(status);
        };
        tracking.origin_attempts += 1;
        let attempts = tracking.origin_attempts;
        let known_run = tracking.origin_run.clone();

        if attempts > polling.origin_max_attempts {
            return self
                .fail(status, ErrorCategory::PhaseTimeout, Phase::Origin, attempts - 1, None)
                .await;
        }

        let run = match known_run {
            Some(run_ref) => match self.api.get_run(&self.auth, target, run_ref.id).await {
                Ok(run) => run,
                Err(e) => return self.transient(status, e).await,
            },
            None => match self.resolve_origin(&mut status).await {
                Located::Run(run) => run,
                Located::Done(outcome) => return outcome,
            },
        };

        if run.is_completed() {
            if run.succeeded() {
                tracing::info!(entity_id = %self.entity_id, run_id = run.id, "Origin run succeeded; switching to approval");
                return self.commit(self.advance(status, Event::OriginSucceeded)).await;
            }
            return self.fail_from_run(status, target, &run).await;
        }

        if run.status == RunStatus::InProgress
            && let Some(run_ref) = status.remote_run().cloned()
        {
            // A run resolved while queued may have started since.
            status = self.advance(
                status,
                Event::OriginResolved {
                    run: run_ref,
                    running: true,
                },
            );
        }

        match self.inspector.inspect(&self.auth, target, run.id).await {
            Ok(report) => {
                let stage = report.stage();
                status = self.advance(
                    status,
                    Event::StepObserved {
                        stage,
                        label: report.current_step,
                    },
                );
            }
            Err(e) => {
                tracing::debug!(entity_id = %self.entity_id, error = %e, "Job listing failed; keeping previous stage");
            }
        }
        self.commit(status).await
    }

    /// Token search for the processor run, with the degraded re-read enabled.
    async fn resolve_origin(&self, status: &mut RegistrationStatus) -> Located {
        let polling = &self.config.polling;
        let dispatched_at = status.attempt().and_then(|a| a.dispatched_at);
        let Some(tracking) = status.tracking_mut() else {
            return Located::Done(TickOutcome::Stopped(status.clone()));
        };
        tracking.origin_resolve_attempts += 1;
        let attempt = tracking.origin_resolve_attempts;

        let fallback = dispatched_at.map(|since| FallbackWindow {
            since,
            window: chrono::Duration::seconds(
                i64::try_from(polling.fallback_window_secs).unwrap_or(i64::MAX / 1000),
            ),
        });
        let query = RunQuery {
            token: &self.token,
            target: &self.config.origin,
            search_window: polling.search_window,
            max_attempts: polling.origin_max_resolve_attempts,
            fallback,
        };

        match self.resolver.resolve(&self.auth, &query, attempt).await {
            Ok(ResolveOutcome::Matched { run, confidence }) => {
                tracing::info!(
                    entity_id = %self.entity_id,
                    run_id = run.id,
                    ?confidence,
                    "Origin run resolved"
                );
                let run_ref = RunRef {
                    id: run.id,
                    url: run.html_url.clone(),
                    confidence,
                };
                let next = self.advance(
                    std::mem::take(status),
                    Event::OriginResolved {
                        run: run_ref,
                        running: run.status == RunStatus::InProgress,
                    },
                );
                *status = next;
                Located::Run(run)
            }
            Ok(ResolveOutcome::Pending) => Located::Done(self.commit(status.clone()).await),
            Ok(ResolveOutcome::NotFound) => Located::Done(
                self.fail(
                    status.clone(),
                    ErrorCategory::RunNotFound,
                    Phase::Origin,
                    attempt,
                    None,
                )
                .await,
            ),
            Err(e) => Located::Done(self.transient(status.clone(), e).await),
        }
    }

    async fn tick_approval(&self, mut status: RegistrationStatus) -> TickOutcome {
        let polling = &self.config.polling;
        let target = &self.config.approval;

        let Some(tracking) = status.tracking_mut() else {
            return TickOutcome::Stopped(status);
        };

        let run = match tracking.approval_run.clone() {
            Some(run_ref) => {
                tracking.approval_running_attempts += 1;
                let attempts = tracking.approval_running_attempts;
                if attempts > polling.approval_max_running_attempts {
                    return self
                        .fail(
                            status,
                            ErrorCategory::PhaseTimeout,
                            Phase::Approval,
                            attempts - 1,
                            Some(run_ref.url),
                        )
                        .await;
                }
                match self.api.get_run(&self.auth, target, run_ref.id).await {
                    Ok(run) => run,
                    Err(e) => return self.transient(status, e).await,
                }
            }
            None => match self.resolve_approval(&mut status).await {
                Located::Run(run) => run,
                Located::Done(outcome) => return outcome,
            },
        };

        if run.is_completed() {
            if run.succeeded() {
                tracing::info!(entity_id = %self.entity_id, run_id = run.id, "Approval run succeeded");
                let event = Event::ApprovalSucceeded {
                    completed_at: self.clock.now(),
                    artifact_url: run.html_url.clone(),
                };
                return self.commit(self.advance(status, event)).await;
            }
            return self.fail_from_run(status, target, &run).await;
        }

        if run.status == RunStatus::InProgress {
            status = self.advance(status, Event::ApprovalRunning);
        }
        if let Ok(report) = self.inspector.inspect(&self.auth, target, run.id).await
            && report.current_step.is_some()
            && let Some(tracking) = status.tracking_mut()
        {
            tracking.current_step_label = report.current_step;
        }
        self.commit(status).await
    }

    /// Token search for the approval run. No degraded path here.
    async fn resolve_approval(&self, status: &mut RegistrationStatus) -> Located {
        let polling = &self.config.polling;
        let Some(tracking) = status.tracking_mut() else {
            return Located::Done(TickOutcome::Stopped(status.clone()));
        };
        tracking.approval_resolve_attempts += 1;
        let attempt = tracking.approval_resolve_attempts;
        if attempt > polling.approval_max_resolve_attempts {
            return Located::Done(
                self.fail(
                    status.clone(),
                    ErrorCategory::RunNotFound,
                    Phase::Approval,
                    attempt - 1,
                    None,
                )
                .await,
            );
        }

        let query = RunQuery {
            token: &self.token,
            target: &self.config.approval,
            search_window: polling.search_window,
            max_attempts: polling.approval_max_resolve_attempts,
            fallback: None,
        };

        match self.resolver.resolve(&self.auth, &query, attempt).await {
            Ok(ResolveOutcome::Matched { run, confidence }) => {
                tracing::info!(entity_id = %self.entity_id, run_id = run.id, "Approval run resolved");
                let run_ref = RunRef {
                    id: run.id,
                    url: run.html_url.clone(),
                    confidence,
                };
                let next = self.advance(
                    std::mem::take(status),
                    Event::ApprovalResolved {
                        run: run_ref,
                        running: run.status != RunStatus::Queued,
                    },
                );
                *status = next;
                Located::Run(run)
            }
            Ok(ResolveOutcome::Pending) => Located::Done(self.commit(status.clone()).await),
            Ok(ResolveOutcome::NotFound) => Located::Done(
                self.fail(
                    status.clone(),
                    ErrorCategory::RunNotFound,
                    Phase::Approval,
                    attempt,
                    None,
                )
                .await,
            ),
            Err(e) => Located::Done(self.transient(status.clone(), e).await),
        }
    }

    /// Classify a failed run by its failed step and finish.
    async fn fail_from_run(
        &self,
        status: RegistrationStatus,
        target: &WorkflowTarget,
        run: &WorkflowRun,
    ) -> TickOutcome {
        let report = match self.inspector.inspect(&self.auth, target, run.id).await {
            Ok(report) => report,
            // The run stays completed; classify on the next tick.
            Err(e) => return self.transient(status, e).await,
        };
        let classification = classify(report.failed_step.as_deref());
        tracing::warn!(
            entity_id = %self.entity_id,
            run_id = run.id,
            failed_step = report.failed_step.as_deref().unwrap_or("-"),
            category = %classification.category,
            "Remote run failed"
        );
        let error = StatusError::from_classification(classification, Some(run.html_url.clone()));
        self.commit(self.advance(status, Event::Fail { error })).await
    }

    async fn fail(
        &self,
        status: RegistrationStatus,
        category: ErrorCategory,
        phase: Phase,
        attempts: u32,
        run_url: Option<String>,
    ) -> TickOutcome {
        let reason = match category {
            ErrorCategory::RunNotFound => RegistrationError::RunNotFound { phase, attempts },
            ErrorCategory::PhaseTimeout => RegistrationError::PhaseTimeout { phase, attempts },
            other => RegistrationError::RemoteStepFailed { category: other },
        };
        tracing::warn!(
            entity_id = %self.entity_id,
            token = %self.token,
            %phase,
            attempts,
            error = %reason,
            "Registration failed"
        );
        let detail = match reason {
            RegistrationError::RemoteStepFailed { .. } => format!("{} phase", phase),
            other => other.to_string(),
        };
        let error = StatusError::with_detail(category, Some(&detail), run_url);
        self.commit(self.advance(status, Event::Fail { error })).await
    }

    /// Network trouble: keep the bumped counters and try again next tick.
    async fn transient(&self, status: RegistrationStatus, err: ApiError) -> TickOutcome {
        let err = RegistrationError::from(err);
        tracing::warn!(
            entity_id = %self.entity_id,
            transient = err.is_transient(),
            error = %err,
            "GitHub call failed; retrying next tick"
        );
        self.commit(status).await
    }

    /// Persist only if the stored record is still ours; the store checks and
    /// writes under one lock, so a concurrent cancel is never overwritten.
    async fn commit(&self, next: RegistrationStatus) -> TickOutcome {
        match self.store.save_if_owned(&self.entity_id, &self.token, &next).await {
            Ok(SaveOutcome::Saved) => {}
            Ok(SaveOutcome::Rejected(fresh)) => {
                tracing::info!(
                    entity_id = %self.entity_id,
                    state = %fresh.state(),
                    "Status changed outside the poll loop; stopping"
                );
                self.remember(fresh.clone());
                return TickOutcome::Stopped(fresh);
            }
            Err(e) => {
                tracing::warn!(entity_id = %self.entity_id, error = %e, "Failed to persist status; continuing in memory");
            }
        }
        self.remember(next.clone());

        if next.is_in_progress() {
            TickOutcome::Continue
        } else {
            TickOutcome::Stopped(next)
        }
    }

    /// The record is an in-progress record of this loop's attempt.
    fn owns(&self, status: &RegistrationStatus) -> bool {
        status.is_owned_by(&self.token)
    }

    fn advance(&self, status: RegistrationStatus, event: Event) -> RegistrationStatus {
        let name = event.name();
        let from = status.state();
        let next = apply(status, event);
        if next.state() != from {
            tracing::debug!(
                entity_id = %self.entity_id,
                event = name,
                %from,
                to = %next.state(),
                "State transition"
            );
        }
        next
    }

    fn remembered(&self) -> RegistrationStatus {
        self.last.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn remember(&self, status: RegistrationStatus) {
        if let Ok(mut last) = self.last.lock() {
            *last = status;
        }
    }
}
