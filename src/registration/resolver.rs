//! Finds the remote run that belongs to one correlation token.
//!
//! Many equivalent requests run at once, so the token embedded in a run's
//! title is the only trustworthy link between a request and a run. A run is
//! never picked by timing alone: without a token match the answer is
//! "not yet" and, once the attempt budget is spent, "not found".

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::config::{Credentials, WorkflowTarget};
use crate::errors::ApiError;
use crate::github::{WorkflowApi, WorkflowRun};

use super::status::MatchConfidence;
use super::token::CorrelationToken;

/// Tolerated clock skew between us and GitHub when bounding the fallback scan.
const CLOCK_SKEW_SECS: i64 = 60;
/// Upper bound on runs re-read one by one in a single fallback scan.
const MAX_FALLBACK_READS: usize = 10;

/// Degraded path: re-read recent runs individually, because the listing
/// endpoint can lag behind the rendered run title. Still token-checked.
#[derive(Debug, Clone, Copy)]
pub struct FallbackWindow {
    pub since: DateTime<Utc>,
    pub window: Duration,
}

impl FallbackWindow {
    fn contains(&self, created_at: DateTime<Utc>) -> bool {
        let skew = Duration::seconds(CLOCK_SKEW_SECS);
        created_at >= self.since - skew && created_at <= self.since + self.window
    }
}

#[derive(Debug, Clone)]
pub struct RunQuery<'a> {
    pub token: &'a CorrelationToken,
    pub target: &'a WorkflowTarget,
    pub search_window: u32,
    pub max_attempts: u32,
    pub fallback: Option<FallbackWindow>,
}

#[derive(Debug, Clone)]
pub enum ResolveOutcome {
    Matched {
        run: WorkflowRun,
        confidence: MatchConfidence,
    },
    /// No match yet; budget remains.
    Pending,
    /// Budget spent without a token match.
    NotFound,
}

/// Newest run whose title or name carries the token.
pub fn find_by_token<'r>(runs: &'r [WorkflowRun], token: &CorrelationToken) -> Option<&'r WorkflowRun> {
    runs.iter().find(|run| {
        token.is_in(&run.display_title) || run.name.as_deref().is_some_and(|n| token.is_in(n))
    })
}

pub struct RunResolver {
    api: Arc<dyn WorkflowApi>,
}

impl RunResolver {
    pub fn new(api: Arc<dyn WorkflowApi>) -> Self {
        Self { api }
    }

    /// One resolution attempt. `attempt` is 1-based and counts this call.
    pub async fn resolve(
        &self,
        auth: &Credentials,
        query: &RunQuery<'_>,
        attempt: u32,
    ) -> Result<ResolveOutcome, ApiError> {
        let runs = self
            .api
            .list_runs(auth, query.target, query.search_window)
            .await?;

        if let Some(run) = find_by_token(&runs, query.token) {
            tracing::debug!(
                token = %query.token,
                run_id = run.id,
                workflow = %query.target.workflow,
                "Resolved run by token"
            );
            return Ok(ResolveOutcome::Matched {
                run: run.clone(),
                confidence: MatchConfidence::Token,
            });
        }

        if let Some(fallback) = query.fallback
            && let Some(run) = self.degraded_scan(auth, query, &runs, fallback).await
        {
            tracing::warn!(
                token = %query.token,
                run_id = run.id,
                confidence = "degraded",
                "Resolved run by re-reading recent runs; listing did not show the token"
            );
            return Ok(ResolveOutcome::Matched {
                run,
                confidence: MatchConfidence::Degraded,
            });
        }

        if attempt >= query.max_attempts {
            tracing::warn!(
                token = %query.token,
                attempts = attempt,
                workflow = %query.target.workflow,
                "No run carries the correlation token; giving up"
            );
            Ok(ResolveOutcome::NotFound)
        } else {
            Ok(ResolveOutcome::Pending)
        }
    }

    async fn degraded_scan(
        &self,
        auth: &Credentials,
        query: &RunQuery<'_>,
        runs: &[WorkflowRun],
        fallback: FallbackWindow,
    ) -> Option<WorkflowRun> {
        let candidates = runs
            .iter()
            .filter(|run| run.event == query.target.event && fallback.contains(run.created_at))
            .take(MAX_FALLBACK_READS);

        for candidate in candidates {
            let fresh = match self.api.get_run(auth, query.target, candidate.id).await {
                Ok(fresh) => fresh,
                Err(e) => {
                    tracing::debug!(run_id = candidate.id, error = %e, "Skipping run that could not be re-read");
                    continue;
                }
            };
            if find_by_token(std::slice::from_ref(&fresh), query.token).is_some() {
                return Some(fresh);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::{Job, RunStatus};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Listing returns `listed`; `get_run` returns `fresh` entries by id.
    struct FakeApi {
        listed: Vec<WorkflowRun>,
        fresh: HashMap<u64, WorkflowRun>,
        /// Listed, but gone by the time they are re-read.
        deleted: Vec<u64>,
        detail_reads: Mutex<u32>,
    }

    #[async_trait]
    impl WorkflowApi for FakeApi {
        async fn dispatch_workflow(
            &self,
            _: &Credentials,
            _: &WorkflowTarget,
            _: &str,
            _: &serde_json::Value,
        ) -> Result<(), ApiError> {
            Ok(())
        }

        async fn list_runs(
            &self,
            _: &Credentials,
            _: &WorkflowTarget,
            _: u32,
        ) -> Result<Vec<WorkflowRun>, ApiError> {
            Ok(self.listed.clone())
        }

        async fn get_run(
            &self,
            _: &Credentials,
            _: &WorkflowTarget,
            run_id: u64,
        ) -> Result<WorkflowRun, ApiError> {
            *self.detail_reads.lock().unwrap() += 1;
            if self.deleted.contains(&run_id) {
                return Err(ApiError::Status {
                    status: 404,
                    body: "Not Found".into(),
                });
            }
            self.fresh
                .get(&run_id)
                .or_else(|| self.listed.iter().find(|r| r.id == run_id))
                .cloned()
                .ok_or(ApiError::Status {
                    status: 404,
                    body: "Not Found".into(),
                })
        }

        async fn list_jobs(
            &self,
            _: &Credentials,
            _: &WorkflowTarget,
            _: u64,
        ) -> Result<Vec<Job>, ApiError> {
            Ok(Vec::new())
        }
    }

    fn auth() -> Credentials {
        Credentials {
            endpoint: "https://api.github.com".into(),
            token: "ghp_test".into(),
        }
    }

    fn target() -> WorkflowTarget {
        WorkflowTarget {
            owner: "o".into(),
            repo: "r".into(),
            workflow: "receive-uat-request.yml".into(),
            event: "workflow_dispatch".into(),
        }
    }

    fn run(id: u64, title: &str, created_at: DateTime<Utc>) -> WorkflowRun {
        WorkflowRun {
            id,
            name: Some("Receive UAT request".into()),
            display_title: title.to_string(),
            status: RunStatus::InProgress,
            conclusion: None,
            event: "workflow_dispatch".into(),
            created_at,
            html_url: format!("https://github.com/o/r/actions/runs/{}", id),
        }
    }

    fn resolver(listed: Vec<WorkflowRun>, fresh: Vec<WorkflowRun>) -> (RunResolver, Arc<FakeApi>) {
        let api = Arc::new(FakeApi {
            listed,
            fresh: fresh.into_iter().map(|r| (r.id, r)).collect(),
            deleted: Vec::new(),
            detail_reads: Mutex::new(0),
        });
        (RunResolver::new(api.clone()), api)
    }

    fn query<'a>(
        token: &'a CorrelationToken,
        target: &'a WorkflowTarget,
        fallback: Option<FallbackWindow>,
    ) -> RunQuery<'a> {
        RunQuery {
            token,
            target,
            search_window: 30,
            max_attempts: 3,
            fallback,
        }
    }

    #[tokio::test]
    async fn test_single_token_match_among_many() {
        let token = CorrelationToken::from("uat-pizza-k1-aaaa");
        let now = Utc::now();
        for position in [0usize, 7, 19] {
            let mut runs: Vec<_> = (0..20)
                .map(|i| run(i, &format!("UAT uat-other-k1-{:04}", i), now))
                .collect();
            runs[position].display_title = format!("UAT registration {}", token);
            let expected = runs[position].id;
            let (resolver, _) = resolver(runs, vec![]);
            let target = target();
            let outcome = resolver
                .resolve(&auth(), &query(&token, &target, None), 1)
                .await
                .unwrap();
            match outcome {
                ResolveOutcome::Matched { run, confidence } => {
                    assert_eq!(run.id, expected);
                    assert_eq!(confidence, MatchConfidence::Token);
                }
                other => panic!("Expected match, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_no_match_is_pending_then_not_found() {
        let token = CorrelationToken::from("uat-pizza-k1-aaaa");
        let now = Utc::now();
        // A run created right at dispatch time, but for someone else.
        let runs = vec![run(1, "UAT uat-other-k1-bbbb", now)];
        let (resolver, _) = resolver(runs, vec![]);
        let target = target();
        let q = query(&token, &target, None);

        for attempt in 1..3 {
            let outcome = resolver.resolve(&auth(), &q, attempt).await.unwrap();
            assert!(matches!(outcome, ResolveOutcome::Pending));
        }
        let outcome = resolver.resolve(&auth(), &q, 3).await.unwrap();
        assert!(matches!(outcome, ResolveOutcome::NotFound));
    }

    #[tokio::test]
    async fn test_matches_on_run_name() {
        let token = CorrelationToken::from("uat-pizza-k1-aaaa");
        let mut r = run(4, "Receive UAT request", Utc::now());
        r.name = Some(format!("UAT {}", token));
        let (resolver, _) = resolver(vec![r], vec![]);
        let target = target();
        let outcome = resolver
            .resolve(&auth(), &query(&token, &target, None), 1)
            .await
            .unwrap();
        assert!(matches!(outcome, ResolveOutcome::Matched { ref run, .. } if run.id == 4));
    }

    #[tokio::test]
    async fn degraded_scan_finds_token_in_fresh_title() {
        let token = CorrelationToken::from("uat-pizza-k1-aaaa");
        let now = Utc::now();
        let listed = vec![run(10, "Receive UAT request", now)];
        let fresh = vec![run(10, &format!("UAT {}", token), now)];
        let (resolver, _) = resolver(listed, fresh);
        let target = target();
        let fallback = FallbackWindow {
            since: now,
            window: Duration::seconds(300),
        };
        let outcome = resolver
            .resolve(&auth(), &query(&token, &target, Some(fallback)), 1)
            .await
            .unwrap();
        match outcome {
            ResolveOutcome::Matched { run, confidence } => {
                assert_eq!(run.id, 10);
                assert_eq!(confidence, MatchConfidence::Degraded);
            }
            other => panic!("Expected degraded match, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn degraded_scan_never_guesses_by_time() {
        let token = CorrelationToken::from("uat-pizza-k1-aaaa");
        let now = Utc::now();
        // Perfect time proximity, no token anywhere.
        let listed = vec![run(11, "Receive UAT request", now)];
        let (resolver, _) = resolver(listed, vec![]);
        let target = target();
        let fallback = FallbackWindow {
            since: now,
            window: Duration::seconds(300),
        };
        let q = RunQuery {
            max_attempts: 1,
            ..query(&token, &target, Some(fallback))
        };
        let outcome = resolver.resolve(&auth(), &q, 1).await.unwrap();
        assert!(matches!(outcome, ResolveOutcome::NotFound));
    }

    #[tokio::test]
    async fn degraded_scan_skips_runs_that_fail_to_load() {
        let token = CorrelationToken::from("uat-pizza-k1-aaaa");
        let now = Utc::now();
        let listed = vec![
            run(20, "Receive UAT request", now),
            run(21, "Receive UAT request", now),
        ];
        let api = Arc::new(FakeApi {
            listed,
            fresh: [(21, run(21, &format!("UAT {}", token), now))].into(),
            deleted: vec![20],
            detail_reads: Mutex::new(0),
        });
        let resolver = RunResolver::new(api.clone());
        let target = target();
        let fallback = FallbackWindow {
            since: now,
            window: Duration::seconds(300),
        };
        let outcome = resolver
            .resolve(&auth(), &query(&token, &target, Some(fallback)), 1)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ResolveOutcome::Matched { ref run, confidence: MatchConfidence::Degraded } if run.id == 21
        ));
        assert_eq!(*api.detail_reads.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn degraded_scan_skips_runs_outside_window() {
        let token = CorrelationToken::from("uat-pizza-k1-aaaa");
        let now = Utc::now();
        let old = now - Duration::hours(2);
        let listed = vec![run(12, "Receive UAT request", old)];
        let fresh = vec![run(12, &format!("UAT {}", token), old)];
        let (resolver, api) = resolver(listed, fresh);
        let target = target();
        let fallback = FallbackWindow {
            since: now,
            window: Duration::seconds(300),
        };
        let outcome = resolver
            .resolve(&auth(), &query(&token, &target, Some(fallback)), 1)
            .await
            .unwrap();
        assert!(matches!(outcome, ResolveOutcome::Pending));
        assert_eq!(*api.detail_reads.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_listing_failure_propagates() {
        struct Down;
        #[async_trait]
        impl WorkflowApi for Down {
            async fn dispatch_workflow(
                &self,
                _: &Credentials,
                _: &WorkflowTarget,
                _: &str,
                _: &serde_json::Value,
            ) -> Result<(), ApiError> {
                Ok(())
            }
            async fn list_runs(
                &self,
                _: &Credentials,
                _: &WorkflowTarget,
                _: u32,
            ) -> Result<Vec<WorkflowRun>, ApiError> {
                Err(ApiError::Status {
                    status: 503,
                    body: "unavailable".into(),
                })
            }
            async fn get_run(
                &self,
                _: &Credentials,
                _: &WorkflowTarget,
                _: u64,
            ) -> Result<WorkflowRun, ApiError> {
                unreachable!()
            }
            async fn list_jobs(
                &self,
                _: &Credentials,
                _: &WorkflowTarget,
                _: u64,
            ) -> Result<Vec<Job>, ApiError> {
                unreachable!()
            }
        }
        let resolver = RunResolver::new(Arc::new(Down));
        let token = CorrelationToken::from("uat-x-1-2");
        let target = target();
        let result = resolver
            .resolve(&auth(), &query(&token, &target, None), 1)
            .await;
        assert!(matches!(result, Err(ApiError::Status { status: 503, .. })));
    }
}
