//! The public face of the engine: start, cancel, retry, resume.
//!
//! `Registrar` owns the shared pieces (config, store, GitHub client, clock,
//! credential source) and an in-process registry of entities whose loop is
//! running, so a second `start` for the same entity is refused even before
//! its first record lands in the store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;

use crate::config::{CredentialProvider, Credentials, RegistrarConfig};
use crate::errors::RegistrationError;
use crate::github::WorkflowApi;
use crate::store::{SaveOutcome, StatusStore};

use super::classifier::ErrorCategory;
use super::dispatch::{RegistrationRequest, TriggerDispatcher, require_credentials};
use super::machine::{Event, apply};
use super::poller::{Clock, PhasePoller};
use super::status::{RegistrationStatus, StatusError};
use super::token::{self, CorrelationToken};

type ActiveLoops = Arc<tokio::sync::Mutex<HashMap<String, CorrelationToken>>>;

pub struct Registrar {
    config: Arc<RegistrarConfig>,
    store: Arc<dyn StatusStore>,
    api: Arc<dyn WorkflowApi>,
    credentials: Arc<dyn CredentialProvider>,
    clock: Arc<dyn Clock>,
    /// Entity id to the token of the loop currently driving it.
    active: ActiveLoops,
}

impl Registrar {
    pub fn new(
        config: Arc<RegistrarConfig>,
        store: Arc<dyn StatusStore>,
        api: Arc<dyn WorkflowApi>,
        credentials: Arc<dyn CredentialProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            api,
            credentials,
            clock,
            active: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    pub async fn status(&self, entity_id: &str) -> Result<RegistrationStatus, RegistrationError> {
        Ok(self.store.load(entity_id).await?)
    }

    pub async fn list(&self) -> Result<Vec<(String, RegistrationStatus)>, RegistrationError> {
        Ok(self.store.list().await?)
    }

    /// Mint a token, dispatch, and return the poller for the new attempt.
    ///
    /// The entity is reserved in the active registry for the whole call and
    /// stays there until the returned poller is handed to [`Registrar::drive`].
    /// The registry lock itself is only held to reserve and release, never
    /// across store or network calls. Configuration and dispatch failures are
    /// recorded as `Failed` before the error is returned.
    pub async fn start(
        &self,
        request: &RegistrationRequest,
    ) -> Result<PhasePoller, RegistrationError> {
        if !self.config.features.uat_registration {
            return Err(RegistrationError::FeatureDisabled);
        }
        let entity_id = request.entity_id.as_str();
        let now = self.clock.now();
        let token = token::generate_at(entity_id, now);

        {
            let mut active = self.active.lock().await;
            if active.contains_key(entity_id) {
                return Err(RegistrationError::AlreadyInProgress {
                    entity_id: entity_id.to_string(),
                });
            }
            active.insert(entity_id.to_string(), token.clone());
        }

        let started = self.start_reserved(request, &token, now).await;
        if started.is_err() {
            self.release(entity_id, &token).await;
        }
        started
    }

    async fn start_reserved(
        &self,
        request: &RegistrationRequest,
        token: &CorrelationToken,
        now: DateTime<Utc>,
    ) -> Result<PhasePoller, RegistrationError> {
        let entity_id = request.entity_id.as_str();
        let mut current = self.store.load(entity_id).await?;
        if current.is_in_progress() {
            return Err(RegistrationError::AlreadyInProgress {
                entity_id: entity_id.to_string(),
            });
        }
        if current.is_terminal() {
            current = apply(current, Event::Retry);
        }

        let status = apply(
            current,
            Event::Start {
                token: token.clone(),
                at: now,
            },
        );
        self.store.save(entity_id, &status).await?;
        tracing::info!(entity_id, token = %token, "Registration started");

        let auth = match require_credentials(self.credentials.as_ref()) {
            Ok(auth) => auth,
            Err(err) => {
                let error = StatusError::with_detail(ErrorCategory::ConfigurationMissing, None, None);
                self.record_failure(entity_id, token, status, error).await?;
                tracing::warn!(entity_id, "No GitHub credentials; registration failed");
                return Err(err);
            }
        };

        let dispatcher = TriggerDispatcher::new(
            self.api.clone(),
            self.config.origin.clone(),
            self.config.github.git_ref.clone(),
        );
        let dispatched = match dispatcher.dispatch(&auth, request, token, now).await {
            Ok(dispatched) => dispatched,
            Err(err) => {
                let detail = err.to_string();
                let error = StatusError::with_detail(ErrorCategory::DispatchFailed, Some(&detail), None);
                self.record_failure(entity_id, token, status, error).await?;
                tracing::warn!(entity_id, error = %err, "Dispatch failed");
                return Err(err);
            }
        };

        let status = apply(
            status,
            Event::Dispatched {
                at: dispatched.dispatched_at,
            },
        );
        // A cancel may have landed while the dispatch was in flight.
        if let SaveOutcome::Rejected(fresh) = self.store.save_if_owned(entity_id, token, &status).await? {
            tracing::info!(
                entity_id,
                state = %fresh.state(),
                "Status changed during dispatch; not polling"
            );
            return Err(RegistrationError::Interrupted {
                entity_id: entity_id.to_string(),
                state: fresh.state(),
            });
        }

        self.poller(entity_id, status, auth)
    }

    /// Record a failure unless something else already took the record over.
    async fn record_failure(
        &self,
        entity_id: &str,
        token: &CorrelationToken,
        status: RegistrationStatus,
        error: StatusError,
    ) -> Result<(), RegistrationError> {
        let failed = apply(status, Event::Fail { error });
        if let SaveOutcome::Rejected(fresh) = self.store.save_if_owned(entity_id, token, &failed).await? {
            tracing::info!(entity_id, state = %fresh.state(), "Status changed before the failure was recorded");
        }
        Ok(())
    }

    async fn release(&self, entity_id: &str, token: &CorrelationToken) {
        let mut active = self.active.lock().await;
        if active.get(entity_id) == Some(token) {
            active.remove(entity_id);
        }
    }

    /// Run a poller to its end and drop it from the active registry.
    pub async fn drive(&self, poller: PhasePoller) -> RegistrationStatus {
        let status = poller.run().await;
        self.release(poller.entity_id(), poller.token()).await;
        status
    }

    /// Start and poll to a terminal state.
    pub async fn register(
        &self,
        request: &RegistrationRequest,
    ) -> Result<RegistrationStatus, RegistrationError> {
        let poller = self.start(request).await?;
        Ok(self.drive(poller).await)
    }

    /// Move an in-progress record to `Cancelled`. A no-op everywhere else,
    /// including `Finalizing`. The running loop notices on its next tick.
    pub async fn cancel(&self, entity_id: &str) -> Result<RegistrationStatus, RegistrationError> {
        let current = self.store.load(entity_id).await?;
        if !current.state().is_cancellable() {
            tracing::info!(entity_id, state = %current.state(), "Nothing to cancel");
            return Ok(current);
        }
        let cancelled = apply(
            current,
            Event::Cancel {
                at: self.clock.now(),
            },
        );
        self.store.save(entity_id, &cancelled).await?;
        tracing::info!(entity_id, "Registration cancelled");
        Ok(cancelled)
    }

    /// Reset a terminal record to `Idle`. The next start mints a new token.
    pub async fn retry(&self, entity_id: &str) -> Result<RegistrationStatus, RegistrationError> {
        let current = self.store.load(entity_id).await?;
        if current.is_in_progress() {
            return Err(RegistrationError::AlreadyInProgress {
                entity_id: entity_id.to_string(),
            });
        }
        let reset = apply(current, Event::Retry);
        self.store.save(entity_id, &reset).await?;
        tracing::info!(entity_id, "Registration reset for retry");
        Ok(reset)
    }

    /// Drive every persisted in-progress record to its end, concurrently.
    pub async fn resume_all(&self) -> Result<Vec<(String, RegistrationStatus)>, RegistrationError> {
        let records = self.store.list().await?;
        let in_progress: Vec<_> = records
            .into_iter()
            .filter(|(_, status)| status.is_in_progress())
            .collect();
        if in_progress.is_empty() {
            return Ok(Vec::new());
        }

        let auth = require_credentials(self.credentials.as_ref())?;
        let mut pollers = Vec::new();
        {
            let mut active = self.active.lock().await;
            for (entity_id, status) in in_progress {
                if active.contains_key(&entity_id) {
                    tracing::debug!(entity_id = %entity_id, "Loop already running; not resuming");
                    continue;
                }
                let poller = self.poller(&entity_id, status, auth.clone())?;
                active.insert(entity_id, poller.token().clone());
                pollers.push(poller);
            }
        }

        tracing::info!(count = pollers.len(), "Resuming registrations");
        let finished = join_all(pollers.into_iter().map(|poller| async move {
            let entity_id = poller.entity_id().to_string();
            (entity_id, self.drive(poller).await)
        }))
        .await;
        Ok(finished)
    }

    fn poller(
        &self,
        entity_id: &str,
        status: RegistrationStatus,
        auth: Credentials,
    ) -> Result<PhasePoller, RegistrationError> {
        PhasePoller::new(
            entity_id,
            status,
            auth,
            self.config.clone(),
            self.store.clone(),
            self.api.clone(),
            self.clock.clone(),
        )
        .ok_or_else(|| RegistrationError::AlreadyInProgress {
            entity_id: entity_id.to_string(),
        })
    }
}
