//! Pure transition function for `RegistrationStatus`.
//!
//! `apply` takes the current record and one event and returns the next
//! record. Any event the current state has no row for returns the record
//! unchanged; the poll loop and the user actions never mutate state any other
//! way.

use chrono::{DateTime, Utc};

use super::status::{
    Attempt, Phase, RegistrationResult, RegistrationStatus, RunRef, Stage, StatusError, Tracking,
};
use super::token::{CorrelationToken, to_base36};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A new attempt begins: Idle → Initiating.
    Start {
        token: CorrelationToken,
        at: DateTime<Utc>,
    },
    /// The trigger call was accepted: Initiating → Exporting.
    Dispatched { at: DateTime<Utc> },
    /// The phase 1 run was found.
    OriginResolved { run: RunRef, running: bool },
    /// A phase 1 step was seen running; `stage` is its advisory mapping.
    StepObserved {
        stage: Option<Stage>,
        label: Option<String>,
    },
    /// Phase 1 finished successfully; tracking moves to the approval system.
    OriginSucceeded,
    /// The phase 2 run was found.
    ApprovalResolved { run: RunRef, running: bool },
    /// A previously queued phase 2 run started executing.
    ApprovalRunning,
    ApprovalSucceeded {
        completed_at: DateTime<Utc>,
        artifact_url: String,
    },
    /// Any terminal failure; the category decides which failure state.
    Fail { error: StatusError },
    Cancel { at: DateTime<Utc> },
    Retry,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Start { .. } => "start",
            Event::Dispatched { .. } => "dispatched",
            Event::OriginResolved { .. } => "origin_resolved",
            Event::StepObserved { .. } => "step_observed",
            Event::OriginSucceeded => "origin_succeeded",
            Event::ApprovalResolved { .. } => "approval_resolved",
            Event::ApprovalRunning => "approval_running",
            Event::ApprovalSucceeded { .. } => "approval_succeeded",
            Event::Fail { .. } => "fail",
            Event::Cancel { .. } => "cancel",
            Event::Retry => "retry",
        }
    }
}

/// Revision label recorded on completion.
pub fn revision_for(completed_at: DateTime<Utc>) -> String {
    let millis = u128::try_from(completed_at.timestamp_millis()).unwrap_or_default();
    format!("rev-{}", to_base36(millis))
}

pub fn apply(status: RegistrationStatus, event: Event) -> RegistrationStatus {
    use RegistrationStatus as S;

    match (status, event) {
        (S::Idle, Event::Start { token, at }) => S::InProgress {
            stage: Stage::Initiating,
            attempt: Attempt::new(token, at),
            tracking: Tracking::default(),
        },

        (
            S::InProgress {
                stage: Stage::Initiating,
                mut attempt,
                tracking,
            },
            Event::Dispatched { at },
        ) => {
            attempt.dispatched_at = Some(at);
            S::InProgress {
                stage: Stage::Exporting,
                attempt,
                tracking,
            }
        }

        (
            S::InProgress {
                stage,
                attempt,
                mut tracking,
            },
            Event::OriginResolved { run, running },
        ) if tracking.phase == Phase::Origin && stage >= Stage::Exporting => {
            tracking.origin_run = Some(run);
            let stage = if running && stage == Stage::Exporting {
                Stage::Validating
            } else {
                stage
            };
            S::InProgress {
                stage,
                attempt,
                tracking,
            }
        }

        (
            S::InProgress {
                stage,
                attempt,
                mut tracking,
            },
            Event::StepObserved {
                stage: observed,
                label,
            },
        ) if tracking.phase == Phase::Origin && stage >= Stage::Exporting => {
            if label.is_some() {
                tracking.current_step_label = label;
            }
            // Forward only, and never past what phase 1 can report.
            let stage = match observed {
                Some(observed) if observed > stage && observed <= Stage::RequestingApproval => {
                    observed
                }
                _ => stage,
            };
            S::InProgress {
                stage,
                attempt,
                tracking,
            }
        }

        (
            S::InProgress {
                stage,
                attempt,
                mut tracking,
            },
            Event::OriginSucceeded,
        ) if tracking.phase == Phase::Origin && stage >= Stage::Exporting => {
            tracking.phase = Phase::Approval;
            tracking.current_step_label = None;
            S::InProgress {
                stage: Stage::RequestingApproval,
                attempt,
                tracking,
            }
        }

        (
            S::InProgress {
                stage: Stage::RequestingApproval,
                attempt,
                mut tracking,
            },
            Event::ApprovalResolved { run, running },
        ) if tracking.phase == Phase::Approval => {
            tracking.approval_run = Some(run);
            let stage = if running {
                Stage::Finalizing
            } else {
                Stage::ApprovalPending
            };
            S::InProgress {
                stage,
                attempt,
                tracking,
            }
        }

        (
            S::InProgress {
                stage: Stage::ApprovalPending,
                attempt,
                tracking,
            },
            Event::ApprovalRunning,
        ) if tracking.phase == Phase::Approval => S::InProgress {
            stage: Stage::Finalizing,
            attempt,
            tracking,
        },

        (
            S::InProgress {
                stage,
                attempt,
                tracking,
            },
            Event::ApprovalSucceeded {
                completed_at,
                artifact_url,
            },
        ) if tracking.phase == Phase::Approval && stage >= Stage::RequestingApproval => {
            S::Completed {
                attempt,
                tracking,
                result: RegistrationResult {
                    revision: revision_for(completed_at),
                    completed_at,
                    artifact_url,
                },
            }
        }

        (
            S::InProgress {
                attempt, tracking, ..
            },
            Event::Fail { error },
        ) => S::Failed {
            kind: error.category.failure_kind(),
            attempt,
            tracking,
            error,
        },

        (
            S::InProgress {
                stage,
                attempt,
                tracking,
            },
            Event::Cancel { at },
        ) if stage != Stage::Finalizing => S::Cancelled {
            attempt,
            tracking,
            cancelled_at: at,
        },

        (status, Event::Retry) if status.is_terminal() => S::Idle,

        (status, _) => status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::classifier::{ErrorCategory, classify};
    use crate::registration::status::{MatchConfidence, RegistrationState};

    fn token() -> CorrelationToken {
        CorrelationToken::from("uat-abc-1-2")
    }

    fn run(id: u64) -> RunRef {
        RunRef {
            id,
            url: format!("https://github.com/o/r/actions/runs/{}", id),
            confidence: MatchConfidence::Token,
        }
    }

    fn in_progress(stage: Stage, phase: Phase) -> RegistrationStatus {
        RegistrationStatus::InProgress {
            stage,
            attempt: Attempt::new(token(), Utc::now()),
            tracking: Tracking {
                phase,
                ..Tracking::default()
            },
        }
    }

    fn failed() -> RegistrationStatus {
        apply(
            in_progress(Stage::Validating, Phase::Origin),
            Event::Fail {
                error: StatusError::from_classification(classify(Some("login")), None),
            },
        )
    }

    fn every_event() -> Vec<Event> {
        vec![
            Event::Start {
                token: token(),
                at: Utc::now(),
            },
            Event::Dispatched { at: Utc::now() },
            Event::OriginResolved {
                run: run(1),
                running: true,
            },
            Event::StepObserved {
                stage: Some(Stage::RequestingApproval),
                label: None,
            },
            Event::OriginSucceeded,
            Event::ApprovalResolved {
                run: run(2),
                running: true,
            },
            Event::ApprovalRunning,
            Event::ApprovalSucceeded {
                completed_at: Utc::now(),
                artifact_url: "u".into(),
            },
            Event::Fail {
                error: StatusError::with_detail(ErrorCategory::PhaseTimeout, None, None),
            },
            Event::Cancel { at: Utc::now() },
            Event::Retry,
        ]
    }

    #[test]
    fn test_documented_transitions() {
        let cases: Vec<(RegistrationStatus, Event, RegistrationState)> = vec![
            (
                RegistrationStatus::Idle,
                Event::Start {
                    token: token(),
                    at: Utc::now(),
                },
                RegistrationState::Initiating,
            ),
            (
                in_progress(Stage::Initiating, Phase::Origin),
                Event::Dispatched { at: Utc::now() },
                RegistrationState::Exporting,
            ),
            (
                in_progress(Stage::Exporting, Phase::Origin),
                Event::OriginResolved {
                    run: run(1),
                    running: true,
                },
                RegistrationState::Validating,
            ),
            (
                in_progress(Stage::Validating, Phase::Origin),
                Event::StepObserved {
                    stage: Some(Stage::RequestingApproval),
                    label: Some("Request CRQ".into()),
                },
                RegistrationState::RequestingApproval,
            ),
            (
                in_progress(Stage::RequestingApproval, Phase::Origin),
                Event::OriginSucceeded,
                RegistrationState::RequestingApproval,
            ),
            (
                in_progress(Stage::RequestingApproval, Phase::Approval),
                Event::ApprovalResolved {
                    run: run(2),
                    running: true,
                },
                RegistrationState::Finalizing,
            ),
            (
                in_progress(Stage::RequestingApproval, Phase::Approval),
                Event::ApprovalResolved {
                    run: run(2),
                    running: false,
                },
                RegistrationState::ApprovalPending,
            ),
            (
                in_progress(Stage::ApprovalPending, Phase::Approval),
                Event::ApprovalRunning,
                RegistrationState::Finalizing,
            ),
            (
                in_progress(Stage::Finalizing, Phase::Approval),
                Event::ApprovalSucceeded {
                    completed_at: Utc::now(),
                    artifact_url: "https://github.com/o/r/actions/runs/2".into(),
                },
                RegistrationState::Completed,
            ),
            (
                in_progress(Stage::Validating, Phase::Origin),
                Event::Fail {
                    error: StatusError::from_classification(
                        classify(Some("Validate subdominio property")),
                        None,
                    ),
                },
                RegistrationState::ValidationFailed,
            ),
            (
                in_progress(Stage::Finalizing, Phase::Approval),
                Event::Fail {
                    error: StatusError::from_classification(classify(Some("Create CRQ")), None),
                },
                RegistrationState::ApprovalRejected,
            ),
            (
                in_progress(Stage::Exporting, Phase::Origin),
                Event::Fail {
                    error: StatusError::with_detail(ErrorCategory::RunNotFound, None, None),
                },
                RegistrationState::Failed,
            ),
            (
                in_progress(Stage::ApprovalPending, Phase::Approval),
                Event::Cancel { at: Utc::now() },
                RegistrationState::Cancelled,
            ),
            (failed(), Event::Retry, RegistrationState::Idle),
        ];

        for (from, event, expected) in cases {
            let from_state = from.state();
            let name = event.name();
            let to = apply(from, event);
            assert_eq!(
                to.state(),
                expected,
                "{} --{}--> expected {}",
                from_state,
                name,
                expected
            );
        }
    }

    #[test]
    fn test_undocumented_events_are_noops_on_terminal_states() {
        let completed = apply(
            in_progress(Stage::Finalizing, Phase::Approval),
            Event::ApprovalSucceeded {
                completed_at: Utc::now(),
                artifact_url: "u".into(),
            },
        );
        for terminal in [failed(), completed] {
            for event in every_event() {
                if matches!(event, Event::Retry) {
                    continue;
                }
                let before = terminal.clone();
                assert_eq!(apply(terminal.clone(), event), before);
            }
        }
    }

    #[test]
    fn test_idle_only_accepts_start() {
        for event in every_event() {
            if matches!(event, Event::Start { .. }) {
                continue;
            }
            assert_eq!(
                apply(RegistrationStatus::Idle, event),
                RegistrationStatus::Idle
            );
        }
    }

    #[test]
    fn test_step_observed_never_moves_backward() {
        let status = apply(
            in_progress(Stage::RequestingApproval, Phase::Origin),
            Event::StepObserved {
                stage: Some(Stage::Exporting),
                label: Some("Export API".into()),
            },
        );
        assert_eq!(status.state(), RegistrationState::RequestingApproval);
        assert_eq!(
            status.tracking().unwrap().current_step_label.as_deref(),
            Some("Export API")
        );
    }

    #[test]
    fn test_origin_success_from_validating_skips_forward() {
        let status = apply(
            in_progress(Stage::Validating, Phase::Origin),
            Event::OriginSucceeded,
        );
        assert_eq!(status.state(), RegistrationState::RequestingApproval);
        assert_eq!(status.tracking().unwrap().phase, Phase::Approval);
    }

    #[test]
    fn test_origin_events_ignored_in_approval_phase() {
        let status = in_progress(Stage::RequestingApproval, Phase::Approval);
        let after = apply(
            status.clone(),
            Event::OriginResolved {
                run: run(9),
                running: true,
            },
        );
        assert_eq!(after, status);
    }

    #[test]
    fn test_cancel_is_noop_in_finalizing() {
        let status = in_progress(Stage::Finalizing, Phase::Approval);
        let after = apply(status.clone(), Event::Cancel { at: Utc::now() });
        assert_eq!(after, status);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let cancelled = apply(
            in_progress(Stage::Validating, Phase::Origin),
            Event::Cancel { at: Utc::now() },
        );
        let again = apply(cancelled.clone(), Event::Cancel { at: Utc::now() });
        assert_eq!(again, cancelled);
    }

    #[test]
    fn test_retry_from_in_progress_is_noop() {
        let status = in_progress(Stage::Validating, Phase::Origin);
        assert_eq!(apply(status.clone(), Event::Retry), status);
    }

    #[test]
    fn test_completion_records_result() {
        let status = apply(
            in_progress(Stage::Finalizing, Phase::Approval),
            Event::ApprovalSucceeded {
                completed_at: Utc::now(),
                artifact_url: "https://github.com/o/r/actions/runs/2".into(),
            },
        );
        let result = status.result().unwrap();
        assert!(result.revision.starts_with("rev-"));
        assert_eq!(result.artifact_url, "https://github.com/o/r/actions/runs/2");
    }

    #[test]
    fn test_dispatched_records_timestamp() {
        let at = Utc::now();
        let status = apply(
            in_progress(Stage::Initiating, Phase::Origin),
            Event::Dispatched { at },
        );
        assert_eq!(status.attempt().unwrap().dispatched_at, Some(at));
    }
}
