//! The dispatch boundary: where an accepted run request becomes a run.

use std::collections::BTreeMap;
use std::sync::Arc;

use instigate_core::definition::{InstigatorDefinition, JobDefinition};
use instigate_core::evaluation::RunRequest;
use instigate_core::launcher::{LaunchError, RunId, RunLaunch, RunLauncher};
use instigate_core::storage::InstigatorStorage;
use instigate_core::tick::Tick;
use instigate_core::InstigateError;
use serde_json::Value;
use thiserror::Error;

pub const INSTIGATOR_TAG: &str = "instigate/instigator";
pub const TICK_TAG: &str = "instigate/tick";
pub const RUN_KEY_TAG: &str = "instigate/run_key";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid run config: {0}")]
    InvalidRunConfig(String),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// The run was launched but could not be recorded on its tick.
    #[error("run {run_id} launched but not recorded: {source}")]
    Record {
        run_id: RunId,
        #[source]
        source: InstigateError,
    },

    #[error("launch task failed: {0}")]
    Join(String),
}

/// Job defaults visible to one repository, by job name.
pub type JobDefaults = BTreeMap<String, JobDefinition>;

#[derive(Clone)]
pub struct DispatchBoundary {
    storage: Arc<dyn InstigatorStorage>,
    launcher: Arc<dyn RunLauncher>,
    jobs: Arc<JobDefaults>,
}

impl DispatchBoundary {
    pub fn new(storage: Arc<dyn InstigatorStorage>, launcher: Arc<dyn RunLauncher>) -> Self {
        Self {
            storage,
            launcher,
            jobs: Arc::new(JobDefaults::new()),
        }
    }

    pub fn with_jobs(mut self, jobs: Arc<JobDefaults>) -> Self {
        self.jobs = jobs;
        self
    }

    /// Launch one accepted request for `tick` and record the run id on it.
    /// Never retried by the caller.
    pub async fn dispatch(
        &self,
        tick: &Tick,
        definition: &InstigatorDefinition,
        request: &RunRequest,
    ) -> Result<RunId, DispatchError> {
        let launch = self.prepare(tick, definition, request)?;

        let launcher = self.launcher.clone();
        let run_id = tokio::task::spawn_blocking(move || launcher.launch_run(&launch))
            .await
            .map_err(|e| DispatchError::Join(e.to_string()))??;

        let storage = self.storage.clone();
        let id = tick.instigator.clone();
        let sequence = tick.sequence;
        let recorded = run_id.clone();
        tokio::task::spawn_blocking(move || storage.add_tick_run(&id, sequence, recorded.as_str()))
            .await
            .map_err(|e| DispatchError::Join(e.to_string()))?
            .map_err(|source| DispatchError::Record {
                run_id: run_id.clone(),
                source,
            })?;

        tracing::info!(
            instigator = %tick.instigator,
            tick = tick.sequence,
            run_id = %run_id,
            "launched run"
        );
        Ok(run_id)
    }

    fn prepare(
        &self,
        tick: &Tick,
        definition: &InstigatorDefinition,
        request: &RunRequest,
    ) -> Result<RunLaunch, DispatchError> {
        let job_name = request
            .job_name
            .clone()
            .filter(|j| !j.is_empty())
            .unwrap_or_else(|| definition.job_name.clone());
        let default = self.jobs.get(&job_name).map(|j| &j.default_run_config);
        let run_config = resolve_run_config(&request.run_config, default)?;

        let mut tags = request.tags.clone();
        tags.insert(INSTIGATOR_TAG.to_string(), tick.instigator.key());
        tags.insert(TICK_TAG.to_string(), tick.sequence.to_string());
        let run_key = request.effective_run_key().map(str::to_string);
        if let Some(key) = &run_key {
            tags.insert(RUN_KEY_TAG.to_string(), key.clone());
        }

        Ok(RunLaunch {
            instigator: tick.instigator.clone(),
            tick_sequence: tick.sequence,
            job_name,
            run_key,
            run_config,
            tags,
        })
    }
}

/// `null` or `{}` falls back to the job default; anything else must be an
/// object.
pub fn resolve_run_config(
    requested: &Value,
    job_default: Option<&Value>,
) -> Result<Value, DispatchError> {
    let empty = match requested {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        other => {
            return Err(DispatchError::InvalidRunConfig(format!(
                "expected an object, got {}",
                json_kind(other)
            )))
        }
    };
    if !empty {
        return Ok(requested.clone());
    }
    match job_default {
        Some(d) if d.is_object() => Ok(d.clone()),
        Some(Value::Null) | None => Ok(Value::Object(Default::default())),
        Some(other) => Err(DispatchError::InvalidRunConfig(format!(
            "job default_run_config must be an object, got {}",
            json_kind(other)
        ))),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sensor, RecordingLauncher};
    use chrono::Utc;
    use instigate_core::evaluation::EvaluationResult;
    use instigate_core::state::InstigatorStatus;
    use instigate_core::storage::{MemoryStorage, TickOpen};
    use serde_json::json;

    fn definition() -> InstigatorDefinition {
        sensor("inbox", 30, |_| Ok(EvaluationResult::default()))
    }

    fn open(storage: &MemoryStorage, def: &InstigatorDefinition) -> Tick {
        storage
            .ensure_state(&def.id, InstigatorStatus::Running, Utc::now())
            .unwrap();
        match storage.open_tick(&def.id, Utc::now(), None).unwrap() {
            TickOpen::Opened(t) => t,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn jobs() -> Arc<JobDefaults> {
        let mut jobs = JobDefaults::new();
        for (name, cfg) in [
            ("foo_job", json!({"ops": {"foo": 1}})),
            ("bar_job", json!({"ops": {"bar": 2}})),
        ] {
            jobs.insert(
                name.to_string(),
                JobDefinition {
                    name: name.to_string(),
                    default_run_config: cfg,
                },
            );
        }
        Arc::new(jobs)
    }

    #[tokio::test]
    async fn empty_config_uses_job_default_and_records_run() {
        let storage = Arc::new(MemoryStorage::new());
        let launcher = RecordingLauncher::new();
        let def = definition();
        let tick = open(&storage, &def);
        let boundary = DispatchBoundary::new(storage.clone(), launcher.clone()).with_jobs(jobs());

        let run_id = boundary
            .dispatch(&tick, &def, &RunRequest::keyed("k1"))
            .await
            .unwrap();

        let launches = launcher.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].job_name, "foo_job");
        assert_eq!(launches[0].run_config, json!({"ops": {"foo": 1}}));
        assert_eq!(launches[0].tags[RUN_KEY_TAG], "k1");
        assert_eq!(launches[0].tags[INSTIGATOR_TAG], "etl/repo/inbox");

        let stored = storage.get_tick(&def.id, tick.sequence).unwrap().unwrap();
        assert_eq!(stored.run_ids, vec![run_id.to_string()]);
    }

    #[tokio::test]
    async fn request_job_override_picks_its_default() {
        let storage = Arc::new(MemoryStorage::new());
        let launcher = RecordingLauncher::new();
        let def = definition();
        let tick = open(&storage, &def);
        let boundary = DispatchBoundary::new(storage.clone(), launcher.clone()).with_jobs(jobs());

        let request = RunRequest {
            job_name: Some("bar_job".into()),
            ..RunRequest::default()
        };
        boundary.dispatch(&tick, &def, &request).await.unwrap();
        let launches = launcher.launches();
        assert_eq!(launches[0].job_name, "bar_job");
        assert_eq!(launches[0].run_config, json!({"ops": {"bar": 2}}));
        assert!(!launches[0].tags.contains_key(RUN_KEY_TAG));
    }

    #[tokio::test]
    async fn launcher_rejection_is_a_dispatch_error() {
        let storage = Arc::new(MemoryStorage::new());
        let launcher = RecordingLauncher::new();
        launcher.set_rejecting(true);
        let def = definition();
        let tick = open(&storage, &def);
        let boundary = DispatchBoundary::new(storage.clone(), launcher);

        let err = boundary
            .dispatch(&tick, &def, &RunRequest::keyed("k"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Launch(LaunchError::Rejected(_))));
        assert!(storage
            .get_tick(&def.id, tick.sequence)
            .unwrap()
            .unwrap()
            .run_ids
            .is_empty());
    }

    #[test]
    fn run_config_resolution() {
        let default = json!({"a": 1});
        assert_eq!(resolve_run_config(&Value::Null, Some(&default)).unwrap(), default);
        assert_eq!(resolve_run_config(&json!({}), Some(&default)).unwrap(), default);
        assert_eq!(
            resolve_run_config(&json!({"b": 2}), Some(&default)).unwrap(),
            json!({"b": 2})
        );
        assert_eq!(resolve_run_config(&Value::Null, None).unwrap(), json!({}));
        assert!(matches!(
            resolve_run_config(&json!([1, 2]), None),
            Err(DispatchError::InvalidRunConfig(_))
        ));
        assert!(matches!(
            resolve_run_config(&json!("x"), None),
            Err(DispatchError::InvalidRunConfig(_))
        ));
    }
}
