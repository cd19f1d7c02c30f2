//! One instigator's work for one coordinator iteration: open a tick, call the
//! evaluator, deduplicate and dispatch its run requests, close the tick.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use instigate_core::dedup::{DedupDecision, RunKeyDeduplicator};
use instigate_core::definition::{InstigatorDefinition, SkipCursorPolicy};
use instigate_core::due::Due;
use instigate_core::evaluation::{
    format_scheduled_for, EvaluationContext, EvaluationError, EvaluationResult,
};
use instigate_core::storage::{InstigatorStorage, TickOpen};
use instigate_core::tick::{CursorUpdate, Tick, TickClose, TickError, TickErrorKind, TickStatus};
use instigate_core::InstigateError;

use crate::dispatch::DispatchBoundary;
use crate::run_blocking;

const CLOSE_ATTEMPTS: u32 = 3;
const CLOSE_RETRY_DELAY: Duration = Duration::from_millis(200);

// ─── TickOutcome ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Closed(Tick),
    /// Another evaluation holds the instigator.
    AlreadyStarted(Tick),
    OpenFailed(String),
    /// The tick stays STARTED until reconciliation fails it.
    CloseFailed { tick: Tick, error: String },
}

impl TickOutcome {
    pub fn status(&self) -> Option<TickStatus> {
        match self {
            TickOutcome::Closed(t) => Some(t.status),
            _ => None,
        }
    }
}

// ─── Verdict ──────────────────────────────────────────────────────────────

/// How a tick will close, before `ended_at` is known.
#[derive(Debug)]
enum Verdict {
    Success(CursorUpdate),
    Skipped(String, CursorUpdate),
    Failed(TickError),
}

impl Verdict {
    fn into_close(self, ended_at: DateTime<Utc>) -> TickClose {
        match self {
            Verdict::Success(cursor) => TickClose::success(ended_at, cursor),
            Verdict::Skipped(reason, cursor) => TickClose::skipped(ended_at, Some(reason), cursor),
            Verdict::Failed(error) => TickClose::failure(ended_at, error),
        }
    }
}

// ─── EvaluationTask ───────────────────────────────────────────────────────

pub struct EvaluationTask {
    storage: Arc<dyn InstigatorStorage>,
    dispatcher: DispatchBoundary,
    dedup: RunKeyDeduplicator,
    definition: InstigatorDefinition,
    timeout: Duration,
}

impl EvaluationTask {
    pub fn new(
        storage: Arc<dyn InstigatorStorage>,
        dispatcher: DispatchBoundary,
        definition: InstigatorDefinition,
        timeout: Duration,
    ) -> Self {
        Self {
            dedup: RunKeyDeduplicator::new(storage.clone()),
            storage,
            dispatcher,
            definition,
            timeout,
        }
    }

    /// Evaluate everything `due` names. Schedule boundaries run oldest first
    /// and stop at the first one whose window the cursor did not move past.
    pub async fn run(
        self,
        due: Due,
        mut last_evaluated_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Vec<TickOutcome> {
        match due {
            Due::Sensor => vec![self.run_tick(None, last_evaluated_at, now).await],
            Due::Schedule(boundaries) => {
                let mut outcomes = Vec::with_capacity(boundaries.len());
                for scheduled_for in boundaries {
                    let outcome = self
                        .run_tick(Some(scheduled_for), last_evaluated_at, now)
                        .await;
                    let advanced = match &outcome {
                        TickOutcome::Closed(t) => {
                            last_evaluated_at = Some(t.started_at);
                            let boundary = format_scheduled_for(scheduled_for);
                            t.cursor.as_deref() == Some(boundary.as_str())
                        }
                        _ => false,
                    };
                    outcomes.push(outcome);
                    if !advanced {
                        break;
                    }
                }
                outcomes
            }
        }
    }

    async fn run_tick(
        &self,
        scheduled_for: Option<DateTime<Utc>>,
        last_evaluated_at: Option<DateTime<Utc>>,
        started_at: DateTime<Utc>,
    ) -> TickOutcome {
        let id = &self.definition.id;
        let storage = self.storage.clone();
        let open_id = id.clone();
        let opened =
            run_blocking(move || storage.open_tick(&open_id, started_at, scheduled_for)).await;
        let tick = match opened {
            Ok(TickOpen::Opened(tick)) => tick,
            Ok(TickOpen::AlreadyStarted(other)) => {
                tracing::debug!(instigator = %id, tick = other.sequence, "tick already in progress");
                return TickOutcome::AlreadyStarted(other);
            }
            Err(e) => {
                tracing::warn!(instigator = %id, "could not open tick: {e}");
                return TickOutcome::OpenFailed(e.to_string());
            }
        };

        let clock = Instant::now();
        let ctx = EvaluationContext {
            instigator: id.clone(),
            instigator_type: self.definition.instigator_type(),
            job_name: self.definition.job_name.clone(),
            scheduled_for,
            cursor: tick.cursor.clone(),
            last_evaluated_at,
            evaluation_time: started_at,
        };

        let verdict = match self.evaluate(ctx).await {
            Ok(result) => self.act(&tick, result).await,
            Err(e) => Verdict::Failed(TickError::new(e.kind.into(), e.message)),
        };
        let elapsed = chrono::Duration::from_std(clock.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.close(tick, verdict.into_close(started_at + elapsed)).await
    }

    async fn evaluate(&self, ctx: EvaluationContext) -> Result<EvaluationResult, EvaluationError> {
        let evaluator = self.definition.evaluator.clone();
        let handle = tokio::task::spawn_blocking(move || evaluator.evaluate(&ctx));
        match tokio::time::timeout(self.timeout, handle).await {
            Err(_) => Err(EvaluationError::timeout(format!(
                "evaluation did not finish within {:?}",
                self.timeout
            ))),
            Ok(Err(join)) if join.is_panic() => {
                Err(EvaluationError::panicked(panic_message(join.into_panic())))
            }
            Ok(Err(join)) => Err(EvaluationError::panicked(join.to_string())),
            Ok(Ok(result)) => result,
        }
    }

    async fn act(&self, tick: &Tick, result: EvaluationResult) -> Verdict {
        if result.skip_reason.is_some() && !result.run_requests.is_empty() {
            return Verdict::Failed(TickError::new(
                TickErrorKind::Malformed,
                "evaluation returned both run requests and a skip reason",
            ));
        }

        // Schedules are positioned by the boundary they served.
        let cursor = match tick.scheduled_for {
            Some(t) => Some(format_scheduled_for(t)),
            None => result.cursor.clone(),
        };
        let skip_cursor = match (&self.definition.skip_cursor_policy, &cursor) {
            (SkipCursorPolicy::Advance, Some(c)) => CursorUpdate::Set(Some(c.clone())),
            _ => CursorUpdate::Keep,
        };

        if let Some(reason) = result.skip_reason {
            return Verdict::Skipped(reason, skip_cursor);
        }
        if result.run_requests.is_empty() {
            return Verdict::Skipped("no run requests".to_string(), skip_cursor);
        }

        let mut accepted = 0usize;
        for request in &result.run_requests {
            let dedup = self.dedup.clone();
            let id = tick.instigator.clone();
            let key = request.effective_run_key().map(str::to_string);
            let sequence = tick.sequence;
            let decision = run_blocking(move || {
                dedup.try_accept(&id, key.as_deref(), sequence, Utc::now())
            })
            .await;
            match decision {
                Ok(DedupDecision::Accepted) => {
                    accepted += 1;
                    if let Err(e) = self.dispatcher.dispatch(tick, &self.definition, request).await {
                        tracing::warn!(tick = %tick.label(), "dispatch failed: {e}");
                        return Verdict::Failed(TickError::new(TickErrorKind::Dispatch, e.to_string()));
                    }
                }
                Ok(DedupDecision::Duplicate { .. }) => {}
                Err(e) => {
                    return Verdict::Failed(TickError::new(
                        TickErrorKind::Storage,
                        format!("could not record run key: {e}"),
                    ))
                }
            }
        }

        if accepted == 0 {
            return Verdict::Skipped(
                format!(
                    "all {} run requests were launched by earlier ticks",
                    result.run_requests.len()
                ),
                skip_cursor,
            );
        }
        Verdict::Success(match cursor {
            Some(c) => CursorUpdate::Set(Some(c)),
            None => CursorUpdate::Keep,
        })
    }

    async fn close(&self, tick: Tick, close: TickClose) -> TickOutcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let storage = self.storage.clone();
            let id = tick.instigator.clone();
            let sequence = tick.sequence;
            let c = close.clone();
            match run_blocking(move || storage.close_tick(&id, sequence, &c)).await {
                Ok(closed) => {
                    log_closed(&closed);
                    return TickOutcome::Closed(closed);
                }
                Err(e @ InstigateError::TickNotStarted(_)) => {
                    tracing::warn!(tick = %tick.label(), "tick was closed elsewhere: {e}");
                    return TickOutcome::CloseFailed {
                        tick,
                        error: e.to_string(),
                    };
                }
                Err(e) if attempt < CLOSE_ATTEMPTS => {
                    tracing::warn!(tick = %tick.label(), attempt, "could not close tick: {e}");
                    tokio::time::sleep(CLOSE_RETRY_DELAY * attempt).await;
                }
                Err(e) => {
                    tracing::error!(
                        tick = %tick.label(),
                        "giving up closing tick; it stays STARTED until reconciled: {e}"
                    );
                    return TickOutcome::CloseFailed {
                        tick,
                        error: e.to_string(),
                    };
                }
            }
        }
    }
}

fn log_closed(tick: &Tick) {
    match tick.status {
        TickStatus::Failure => tracing::warn!(
            tick = %tick.label(),
            error = %tick.error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
            "tick failed"
        ),
        status => tracing::info!(
            tick = %tick.label(),
            status = %status,
            runs = tick.run_ids.len(),
            skip_reason = tick.skip_reason.as_deref().unwrap_or(""),
            "tick closed"
        ),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("evaluator panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("evaluator panicked: {s}")
    } else {
        "evaluator panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, hourly, sensor, RecordingLauncher};
    use instigate_core::definition::InstigatorId;
    use instigate_core::evaluation::{RunRequest, StaticScheduleEvaluator};
    use instigate_core::state::InstigatorStatus;
    use instigate_core::storage::MemoryStorage;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        storage: Arc<MemoryStorage>,
        launcher: Arc<RecordingLauncher>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                storage: Arc::new(MemoryStorage::new()),
                launcher: RecordingLauncher::new(),
            }
        }

        fn task(&self, def: &InstigatorDefinition, timeout: Duration) -> EvaluationTask {
            self.storage
                .ensure_state(&def.id, InstigatorStatus::Running, at(0, 0))
                .unwrap();
            EvaluationTask::new(
                self.storage.clone(),
                DispatchBoundary::new(self.storage.clone(), self.launcher.clone()),
                def.clone(),
                timeout,
            )
        }

        async fn sensor_tick(&self, def: &InstigatorDefinition) -> TickOutcome {
            let mut outcomes = self
                .task(def, Duration::from_secs(5))
                .run(Due::Sensor, None, at(9, 0))
                .await;
            assert_eq!(outcomes.len(), 1);
            outcomes.remove(0)
        }

        fn cursor(&self, id: &InstigatorId) -> Option<String> {
            self.storage.get_state(id).unwrap().unwrap().cursor
        }
    }

    fn closed(outcome: TickOutcome) -> Tick {
        match outcome {
            TickOutcome::Closed(t) => t,
            other => panic!("expected a closed tick, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn success_launches_and_commits_cursor() {
        let h = Harness::new();
        let def = sensor("s", 30, |_| {
            Ok(EvaluationResult::requests(vec![RunRequest::keyed("a"), RunRequest::keyed("b")])
                .with_cursor("5"))
        });
        let tick = closed(h.sensor_tick(&def).await);
        assert_eq!(tick.status, TickStatus::Success);
        assert_eq!(tick.run_keys, vec!["a", "b"]);
        assert_eq!(tick.run_ids.len(), 2);
        assert_eq!(h.launcher.run_keys(), vec!["a", "b"]);
        assert_eq!(h.cursor(&def.id).as_deref(), Some("5"));

        let state = h.storage.get_state(&def.id).unwrap().unwrap();
        assert_eq!(state.last_evaluated_at, Some(at(9, 0)));
    }

    #[tokio::test]
    async fn skip_is_not_failure_and_keeps_cursor() {
        let h = Harness::new();
        let def = sensor("s", 30, |ctx| {
            assert_eq!(ctx.cursor.as_deref(), Some("3"));
            Ok(EvaluationResult::skip("nothing new").with_cursor("4"))
        });
        h.task(&def, Duration::from_secs(5));
        h.storage.set_cursor(&def.id, Some("3")).unwrap();

        let tick = closed(h.sensor_tick(&def).await);
        assert_eq!(tick.status, TickStatus::Skipped);
        assert_eq!(tick.skip_reason.as_deref(), Some("nothing new"));
        assert!(tick.error.is_none());
        assert_eq!(h.cursor(&def.id).as_deref(), Some("3"));
        assert!(h.launcher.launches().is_empty());
    }

    #[tokio::test]
    async fn advance_policy_moves_cursor_on_skip() {
        let h = Harness::new();
        let def = sensor("s", 30, |_| Ok(EvaluationResult::default().with_cursor("9")))
            .with_skip_cursor_policy(SkipCursorPolicy::Advance);
        let tick = closed(h.sensor_tick(&def).await);
        assert_eq!(tick.status, TickStatus::Skipped);
        assert_eq!(h.cursor(&def.id).as_deref(), Some("9"));
    }

    #[tokio::test]
    async fn failure_keeps_previous_cursor() {
        let h = Harness::new();
        let def = sensor("s", 30, |_| Err(EvaluationError::raised("boom")));
        h.task(&def, Duration::from_secs(5));
        h.storage.set_cursor(&def.id, Some("3")).unwrap();

        let tick = closed(h.sensor_tick(&def).await);
        assert_eq!(tick.status, TickStatus::Failure);
        let error = tick.error.unwrap();
        assert_eq!(error.kind, TickErrorKind::Raised);
        assert_eq!(error.message, "boom");
        assert_eq!(h.cursor(&def.id).as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn slow_evaluation_times_out() {
        let h = Harness::new();
        let def = sensor("s", 30, |_| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(EvaluationResult::default())
        });
        let mut outcomes = h
            .task(&def, Duration::from_millis(20))
            .run(Due::Sensor, None, at(9, 0))
            .await;
        let tick = closed(outcomes.remove(0));
        assert_eq!(tick.status, TickStatus::Failure);
        assert_eq!(tick.error.unwrap().kind, TickErrorKind::Timeout);
    }

    #[tokio::test]
    async fn panicking_evaluator_is_contained() {
        let h = Harness::new();
        let def = sensor("s", 30, |_| panic!("evaluator bug"));
        let tick = closed(h.sensor_tick(&def).await);
        let error = tick.error.unwrap();
        assert_eq!(error.kind, TickErrorKind::Panicked);
        assert!(error.message.contains("evaluator bug"));
    }

    #[tokio::test]
    async fn skip_reason_with_requests_is_malformed() {
        let h = Harness::new();
        let def = sensor("s", 30, |_| {
            let mut r = EvaluationResult::requests(vec![RunRequest::keyed("a")]);
            r.skip_reason = Some("both".into());
            Ok(r)
        });
        let tick = closed(h.sensor_tick(&def).await);
        assert_eq!(tick.error.unwrap().kind, TickErrorKind::Malformed);
        assert!(h.launcher.launches().is_empty());
    }

    #[tokio::test]
    async fn duplicate_keys_launch_once() {
        let h = Harness::new();
        let def = sensor("s", 30, |_| {
            Ok(EvaluationResult::requests(vec![RunRequest::keyed("same")]))
        });
        assert_eq!(closed(h.sensor_tick(&def).await).status, TickStatus::Success);

        let second = closed(h.sensor_tick(&def).await);
        assert_eq!(second.status, TickStatus::Skipped);
        assert!(second.run_keys.is_empty());
        assert_eq!(h.launcher.run_keys(), vec!["same"]);
    }

    #[tokio::test]
    async fn dispatch_failure_fails_tick_but_keeps_key() {
        let h = Harness::new();
        h.launcher.set_rejecting(true);
        let def = sensor("s", 30, |_| {
            Ok(EvaluationResult::requests(vec![RunRequest::keyed("k")]).with_cursor("1"))
        });
        let tick = closed(h.sensor_tick(&def).await);
        assert_eq!(tick.status, TickStatus::Failure);
        assert_eq!(tick.error.unwrap().kind, TickErrorKind::Dispatch);
        assert_eq!(h.cursor(&def.id), None);
        assert!(h.storage.run_key_record(&def.id, "k").unwrap().is_some());

        // The retry sees the key as taken: the run is missed, not doubled.
        h.launcher.set_rejecting(false);
        let retry = closed(h.sensor_tick(&def).await);
        assert_eq!(retry.status, TickStatus::Skipped);
        assert!(h.launcher.launches().is_empty());
    }

    #[tokio::test]
    async fn started_tick_blocks_evaluation() {
        let h = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let def = sensor("s", 30, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(EvaluationResult::default())
        });
        h.task(&def, Duration::from_secs(5));
        h.storage.open_tick(&def.id, at(8, 0), None).unwrap();

        let outcome = h.sensor_tick(&def).await;
        assert!(matches!(outcome, TickOutcome::AlreadyStarted(ref t) if t.started_at == at(8, 0)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unavailable_storage_skips_instigator() {
        let h = Harness::new();
        let def = sensor("s", 30, |_| Ok(EvaluationResult::default()));
        h.task(&def, Duration::from_secs(5));
        h.storage.set_unavailable(true);
        assert!(matches!(h.sensor_tick(&def).await, TickOutcome::OpenFailed(_)));
    }

    #[tokio::test]
    async fn schedule_catch_up_runs_oldest_first() {
        let h = Harness::new();
        let mut def = hourly("hourly", 3, |_| Ok(EvaluationResult::default()));
        def.evaluator = Arc::new(StaticScheduleEvaluator::new(
            serde_json::json!({"ops": {}}),
            BTreeMap::new(),
        ));
        let due = Due::Schedule(vec![at(8, 0), at(9, 0), at(10, 0)]);
        let outcomes = h
            .task(&def, Duration::from_secs(5))
            .run(due, None, at(10, 1))
            .await;

        assert_eq!(outcomes.len(), 3);
        let boundaries: Vec<_> = outcomes
            .into_iter()
            .map(|o| closed(o).scheduled_for.unwrap())
            .collect();
        assert_eq!(boundaries, vec![at(8, 0), at(9, 0), at(10, 0)]);
        assert_eq!(h.launcher.launches().len(), 3);
        assert_eq!(h.cursor(&def.id).as_deref(), Some("2024-05-01T10:00:00Z"));
    }

    #[tokio::test]
    async fn schedule_catch_up_stops_at_failed_window() {
        let h = Harness::new();
        let def = hourly("hourly", 3, |ctx| {
            let t = ctx.scheduled_for.unwrap();
            if t == at(9, 0) {
                return Err(EvaluationError::raised("upstream down"));
            }
            Ok(EvaluationResult::requests(vec![RunRequest::keyed(format_scheduled_for(t))]))
        });
        let due = Due::Schedule(vec![at(8, 0), at(9, 0), at(10, 0)]);
        let outcomes = h
            .task(&def, Duration::from_secs(5))
            .run(due, None, at(10, 1))
            .await;

        let statuses: Vec<_> = outcomes.iter().map(|o| o.status()).collect();
        assert_eq!(
            statuses,
            vec![Some(TickStatus::Success), Some(TickStatus::Failure)]
        );
        assert_eq!(h.cursor(&def.id).as_deref(), Some("2024-05-01T08:00:00Z"));
    }
}
