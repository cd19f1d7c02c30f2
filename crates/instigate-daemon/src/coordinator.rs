//! The evaluation coordinator: one scan loop per daemon process.
//!
//! Each iteration reloads definitions, brings the state store in line with
//! them, and spawns an [`EvaluationTask`] for every RUNNING instigator that is
//! due. The scan never waits on an evaluation; tasks share a semaphore and are
//! collected on a `JoinSet` that [`Coordinator::drain`] empties at shutdown.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use instigate_core::config::CoordinatorConfig;
use instigate_core::definition::{InstigatorDefinition, InstigatorId};
use instigate_core::due::{due_work, Due};
use instigate_core::instance::Instance;
use instigate_core::launcher::RunLauncher;
use instigate_core::state::{InstigatorState, InstigatorStatus};
use instigate_core::storage::InstigatorStorage;
use instigate_core::workspace::{DefinitionSource, LocationLoad};
use rand::Rng;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::dispatch::{DispatchBoundary, JobDefaults};
use crate::error::{DaemonError, Result};
use crate::evaluation::EvaluationTask;
use crate::reconcile::reconcile_stale_ticks;
use crate::run_blocking;
use crate::shutdown::Shutdown;

const MAX_BACKOFF: Duration = Duration::from_secs(300);

// ─── Reports ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IterationReport {
    /// Instigators handed to an evaluation task.
    pub evaluated: usize,
    pub skipped_not_due: usize,
    pub skipped_in_flight: usize,
    pub load_errors: usize,
    /// States dropped because their definition vanished.
    pub removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub completed: usize,
    /// Tasks still running at the end of the grace period. Their ticks stay
    /// STARTED for the next reconciliation.
    pub aborted: usize,
}

// ─── In-flight tracking ───────────────────────────────────────────────────

type InFlight = Arc<Mutex<HashSet<InstigatorId>>>;

fn in_flight_lock(set: &InFlight) -> std::sync::MutexGuard<'_, HashSet<InstigatorId>> {
    match set.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Holds an instigator's in-flight slot; released when the task ends,
/// including when it is aborted.
struct InFlightGuard {
    set: InFlight,
    id: InstigatorId,
}

impl InFlightGuard {
    fn claim(set: &InFlight, id: &InstigatorId) -> Option<Self> {
        if !in_flight_lock(set).insert(id.clone()) {
            return None;
        }
        Some(Self {
            set: set.clone(),
            id: id.clone(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        in_flight_lock(&self.set).remove(&self.id);
    }
}

// ─── Coordinator ──────────────────────────────────────────────────────────

pub struct Coordinator {
    storage: Arc<dyn InstigatorStorage>,
    source: Arc<dyn DefinitionSource>,
    launcher: Arc<dyn RunLauncher>,
    config: CoordinatorConfig,
    permits: Arc<Semaphore>,
    in_flight: InFlight,
    tasks: JoinSet<()>,
}

impl Coordinator {
    pub fn new(
        storage: Arc<dyn InstigatorStorage>,
        source: Arc<dyn DefinitionSource>,
        launcher: Arc<dyn RunLauncher>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_evaluations.max(1))),
            storage,
            source,
            launcher,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            tasks: JoinSet::new(),
        }
    }

    pub fn from_instance(instance: &Instance, source: Arc<dyn DefinitionSource>) -> Self {
        Self::new(
            instance.storage(),
            source,
            instance.run_launcher(),
            instance.config().coordinator.clone(),
        )
    }

    /// Number of evaluation tasks not yet collected.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// One scan: reconcile stale ticks, load, sync state, submit due
    /// instigators. Returns once the work is submitted, not when it finishes.
    pub async fn run_iteration(&mut self, now: DateTime<Utc>) -> Result<IterationReport> {
        self.reap();
        self.reconcile(now).await;
        let mut report = IterationReport::default();

        let source = self.source.clone();
        let loads = tokio::task::spawn_blocking(move || source.load()).await?;

        let mut loaded_locations = BTreeSet::new();
        let mut work: Vec<(InstigatorDefinition, Arc<JobDefaults>)> = Vec::new();
        for load in loads {
            match load {
                LocationLoad::Loaded(location) => {
                    loaded_locations.insert(location.name.clone());
                    let mut by_repo: BTreeMap<String, JobDefaults> = BTreeMap::new();
                    for ((repository, job), definition) in location.jobs {
                        by_repo.entry(repository).or_default().insert(job, definition);
                    }
                    let by_repo: BTreeMap<String, Arc<JobDefaults>> = by_repo
                        .into_iter()
                        .map(|(repo, jobs)| (repo, Arc::new(jobs)))
                        .collect();
                    for definition in location.definitions {
                        let jobs = by_repo
                            .get(&definition.id.repository)
                            .cloned()
                            .unwrap_or_default();
                        work.push((definition, jobs));
                    }
                }
                LocationLoad::Failed { location, error } => {
                    report.load_errors += 1;
                    tracing::warn!(location = %location, "failed to load definitions: {error}");
                }
            }
        }

        let states = self.sync_states(&work, loaded_locations, now, &mut report).await?;

        for (definition, jobs) in work {
            let Some(state) = states.get(&definition.id) else {
                continue;
            };
            if !state.is_running() {
                continue;
            }
            let Some(guard) = InFlightGuard::claim(&self.in_flight, &definition.id) else {
                report.skipped_in_flight += 1;
                continue;
            };
            let due = match due_work(&definition, state, now) {
                Ok(Some(due)) => due,
                Ok(None) => {
                    report.skipped_not_due += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(instigator = %definition.id, "cannot compute due-ness: {e}");
                    report.skipped_not_due += 1;
                    continue;
                }
            };
            self.submit(guard, definition, jobs, due, state.last_evaluated_at, now);
            report.evaluated += 1;
        }

        tracing::debug!(
            evaluated = report.evaluated,
            skipped_not_due = report.skipped_not_due,
            skipped_in_flight = report.skipped_in_flight,
            load_errors = report.load_errors,
            "coordinator iteration"
        );
        Ok(report)
    }

    async fn sync_states(
        &self,
        work: &[(InstigatorDefinition, Arc<JobDefaults>)],
        loaded_locations: BTreeSet<String>,
        now: DateTime<Utc>,
        report: &mut IterationReport,
    ) -> Result<HashMap<InstigatorId, InstigatorState>> {
        let wanted: Vec<(InstigatorId, InstigatorStatus)> = work
            .iter()
            .map(|(d, _)| (d.id.clone(), d.default_status))
            .collect();
        let storage = self.storage.clone();
        let in_flight = self.in_flight.clone();
        let (states, removed) = run_blocking(move || {
            let mut states = HashMap::with_capacity(wanted.len());
            for (id, status) in &wanted {
                states.insert(id.clone(), storage.ensure_state(id, *status, now)?);
            }
            let mut removed = Vec::new();
            for state in storage.all_states()? {
                let vanished = loaded_locations.contains(&state.id.location)
                    && !states.contains_key(&state.id)
                    && !in_flight_lock(&in_flight).contains(&state.id);
                if vanished && storage.remove_state(&state.id)? {
                    removed.push(state.id);
                }
            }
            Ok((states, removed))
        })
        .await?;

        for id in &removed {
            tracing::info!(instigator = %id, "definition removed; dropped its state");
        }
        report.removed = removed.len();
        Ok(states)
    }

    fn submit(
        &mut self,
        guard: InFlightGuard,
        definition: InstigatorDefinition,
        jobs: Arc<JobDefaults>,
        due: Due,
        last_evaluated_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        let dispatcher =
            DispatchBoundary::new(self.storage.clone(), self.launcher.clone()).with_jobs(jobs);
        let task = EvaluationTask::new(
            self.storage.clone(),
            dispatcher,
            definition,
            self.config.evaluation_timeout(),
        );
        let permits = self.permits.clone();
        self.tasks.spawn(async move {
            let _guard = guard;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            task.run(due, last_evaluated_at, now).await;
        });
    }

    /// Collect finished tasks without waiting.
    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            log_join(result);
        }
    }

    /// Wait up to `grace` for in-flight evaluations, then abort the rest.
    pub async fn drain(&mut self, grace: Duration) -> DrainReport {
        let deadline = tokio::time::Instant::now() + grace;
        let mut report = DrainReport::default();
        loop {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(result)) => {
                    report.completed += 1;
                    log_join(result);
                }
                Ok(None) => break,
                Err(_) => {
                    report.aborted = self.tasks.len();
                    tracing::warn!(
                        count = report.aborted,
                        "evaluations still running after the grace period; \
                         their ticks stay STARTED until reconciled"
                    );
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }
        report
    }

    async fn reconcile(&self, now: DateTime<Utc>) {
        if let Err(e) =
            reconcile_stale_ticks(self.storage.clone(), self.config.reconcile_grace(), now).await
        {
            tracing::warn!("reconciliation failed: {e}");
        }
    }

    /// Scan once and wait for the submitted work.
    pub async fn run_once(&mut self, now: DateTime<Utc>) -> Result<IterationReport> {
        let report = self.run_iteration(now).await;
        self.drain(self.config.shutdown_grace()).await;
        report
    }

    /// The daemon loop. Returns `Ok` after shutdown, or
    /// [`DaemonError::Escalated`] once too many iterations in a row failed.
    pub async fn run(&mut self, mut shutdown: Shutdown) -> Result<()> {
        tracing::info!(
            interval = ?self.config.interval(),
            max_concurrent = self.config.max_concurrent_evaluations,
            "coordinator started"
        );

        let mut failures = 0u32;
        while !shutdown.is_requested() {
            let delay = match self.run_iteration(Utc::now()).await {
                Ok(_) => {
                    failures = 0;
                    self.config.interval()
                }
                Err(e) => {
                    failures += 1;
                    tracing::error!(failures, "coordinator iteration failed: {e}");
                    let limit = self.config.max_consecutive_failures;
                    if limit > 0 && failures >= limit {
                        self.drain(self.config.shutdown_grace()).await;
                        return Err(DaemonError::Escalated {
                            failures,
                            last_error: e.to_string(),
                        });
                    }
                    with_jitter(backoff_delay(self.config.interval(), failures))
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                signal = shutdown.wait() => {
                    tracing::info!(signal = %signal, "coordinator stopping");
                }
            }
        }

        let drained = self.drain(self.config.shutdown_grace()).await;
        tracing::info!(
            completed = drained.completed,
            aborted = drained.aborted,
            "coordinator stopped"
        );
        Ok(())
    }
}

fn log_join(result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            tracing::error!("evaluation task panicked: {e}");
        }
    }
}

/// `base * 2^(failures-1)`, capped at five minutes.
pub fn backoff_delay(base: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(MAX_BACKOFF)
}

fn with_jitter(delay: Duration) -> Duration {
    let fraction: f64 = rand::thread_rng().gen_range(0.0..0.1);
    delay + delay.mul_f64(fraction)
}
