//! `instigate-daemon`: the long-running half of instigate.
//!
//! ```text
//! DefinitionSource ──load──▶ Coordinator ──spawn──▶ evaluation task
//!                              │                      │ open_tick
//!                              │ due-ness             │ Evaluate (blocking pool)
//!                              ▼                      │ RunKeyDeduplicator
//!                         InstigatorStorage ◀─────────┤ DispatchBoundary ─▶ RunLauncher
//!                                                     │ close_tick
//!
//! Supervisor ── owns the api and daemon child processes of `instigate start`
//! ```
//!
//! All storage and evaluator calls are blocking and run on tokio's blocking
//! pool. Shutdown is a `watch` channel fed by SIGINT/SIGTERM or by the caller.

pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod evaluation;
pub mod reconcile;
pub mod shutdown;
pub mod supervisor;

pub(crate) mod process;

pub use coordinator::{Coordinator, DrainReport, IterationReport};
pub use dispatch::{DispatchBoundary, DispatchError};
pub use error::{DaemonError, Result};
pub use evaluation::{EvaluationTask, TickOutcome};
pub use reconcile::reconcile_stale_ticks;
pub use shutdown::{listen_for_signals, shutdown_channel, Shutdown, ShutdownSignal, ShutdownTrigger};
pub use supervisor::{ProcessSpec, Supervisor, SupervisorError, SupervisorExit};

use instigate_core::InstigateError;

/// Run a blocking storage call on the blocking pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> instigate_core::Result<T>
where
    F: FnOnce() -> instigate_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| InstigateError::Storage(format!("storage task failed: {e}")))?
}

#[cfg(test)]
pub(crate) mod testing {
    use chrono::{DateTime, TimeZone, Utc};
    use instigate_core::definition::{
        InstigatorDefinition, InstigatorId, InstigatorKind, ScheduleSpec, SensorSpec,
    };
    use instigate_core::evaluation::{EvaluationContext, EvaluationError, EvaluationResult, FnEvaluator};
    use instigate_core::launcher::{LaunchError, RunId, RunLaunch, RunLauncher};
    use instigate_core::state::InstigatorStatus;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    pub struct RecordingLauncher {
        launches: Mutex<Vec<RunLaunch>>,
        reject: AtomicBool,
    }

    impl RecordingLauncher {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn set_rejecting(&self, reject: bool) {
            self.reject.store(reject, Ordering::SeqCst);
        }

        pub fn launches(&self) -> Vec<RunLaunch> {
            self.launches.lock().unwrap().clone()
        }

        pub fn run_keys(&self) -> Vec<String> {
            self.launches()
                .into_iter()
                .filter_map(|l| l.run_key)
                .collect()
        }
    }

    impl RunLauncher for RecordingLauncher {
        fn launch_run(&self, launch: &RunLaunch) -> Result<RunId, LaunchError> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(LaunchError::Rejected("launcher offline".into()));
            }
            let mut launches = self.launches.lock().unwrap();
            launches.push(launch.clone());
            Ok(RunId::from(format!("run-{}", launches.len())))
        }
    }

    pub fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    pub fn sensor<F>(name: &str, interval: u64, f: F) -> InstigatorDefinition
    where
        F: Fn(&EvaluationContext) -> Result<EvaluationResult, EvaluationError>
            + Send
            + Sync
            + 'static,
    {
        InstigatorDefinition::new(
            InstigatorId::new("etl", "repo", name).unwrap(),
            InstigatorKind::Sensor(SensorSpec {
                minimum_interval_seconds: interval,
            }),
            "foo_job",
            Arc::new(FnEvaluator::new(f)),
        )
        .unwrap()
        .with_default_status(InstigatorStatus::Running)
    }

    pub fn hourly<F>(name: &str, max_catchup_ticks: u32, f: F) -> InstigatorDefinition
    where
        F: Fn(&EvaluationContext) -> Result<EvaluationResult, EvaluationError>
            + Send
            + Sync
            + 'static,
    {
        InstigatorDefinition::new(
            InstigatorId::new("etl", "repo", name).unwrap(),
            InstigatorKind::Schedule(ScheduleSpec {
                cron: "0 * * * *".into(),
                timezone: "UTC".into(),
                max_catchup_ticks,
            }),
            "foo_job",
            Arc::new(FnEvaluator::new(f)),
        )
        .unwrap()
        .with_default_status(InstigatorStatus::Running)
    }
}
