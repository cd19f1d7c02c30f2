//! Definitions files, workspace files and the [`DefinitionSource`] seam.
//!
//! A definitions file is one code location:
//!
//! ```yaml
//! location: etl
//! repositories:
//!   - name: example_repo
//!     jobs:
//!       - name: foo_job
//!         default_run_config: { ops: {} }
//!     schedules:
//!       - name: hourly_foo
//!         job: foo_job
//!         cron: "0 * * * *"
//!     sensors:
//!       - name: inbox
//!         job: foo_job
//!         directory: { path: inbox }
//! ```
//!
//! A workspace file lists several: `load_from: [{ definitions_file, location }]`.

use crate::command::{CommandEvaluator, CommandSpec};
use crate::definition::{
    InstigatorDefinition, InstigatorId, InstigatorKind, JobDefinition, ScheduleSpec,
    SensorSpec, SkipCursorPolicy,
};
use crate::directory_sensor::DirectorySensorEvaluator;
use crate::error::{InstigateError, Result};
use crate::evaluation::{Evaluate, StaticScheduleEvaluator};
use crate::paths::{self, validate_name};
use crate::state::InstigatorStatus;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// File formats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefinitionsFile {
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    repositories: Vec<RepositoryFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RepositoryFile {
    name: String,
    #[serde(default)]
    jobs: Vec<JobDefinition>,
    #[serde(default)]
    schedules: Vec<ScheduleFile>,
    #[serde(default)]
    sensors: Vec<SensorFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScheduleFile {
    name: String,
    job: String,
    cron: String,
    #[serde(default = "default_timezone")]
    timezone: String,
    #[serde(default)]
    default_status: Option<InstigatorStatus>,
    #[serde(default = "default_max_catchup")]
    max_catchup_ticks: u32,
    #[serde(default)]
    run_config: serde_json::Value,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    #[serde(default)]
    command: Option<Vec<String>>,
    #[serde(default)]
    skip_cursor_policy: Option<SkipCursorPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SensorFile {
    name: String,
    job: String,
    #[serde(default = "default_minimum_interval")]
    minimum_interval_seconds: u64,
    #[serde(default)]
    default_status: Option<InstigatorStatus>,
    #[serde(default)]
    command: Option<Vec<String>>,
    #[serde(default)]
    directory: Option<DirectoryFile>,
    #[serde(default)]
    skip_cursor_policy: Option<SkipCursorPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DirectoryFile {
    path: PathBuf,
    #[serde(default)]
    run_config: serde_json::Value,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_max_catchup() -> u32 {
    1
}

fn default_minimum_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceFile {
    #[serde(default)]
    pub load_from: Vec<WorkspaceEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceEntry {
    pub definitions_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl WorkspaceFile {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&data)?)
    }
}

// ---------------------------------------------------------------------------
// Loaded locations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadedLocation {
    pub name: String,
    pub source: PathBuf,
    pub definitions: Vec<InstigatorDefinition>,
    /// Jobs by `(repository, job)`.
    pub jobs: BTreeMap<(String, String), JobDefinition>,
}

impl LoadedLocation {
    pub fn job(&self, repository: &str, job: &str) -> Option<&JobDefinition> {
        self.jobs.get(&(repository.to_string(), job.to_string()))
    }
}

#[derive(Debug, Clone)]
pub enum LocationLoad {
    Loaded(LoadedLocation),
    Failed { location: String, error: String },
}

impl LocationLoad {
    pub fn location(&self) -> &str {
        match self {
            LocationLoad::Loaded(l) => &l.name,
            LocationLoad::Failed { location, .. } => location,
        }
    }
}

/// Where instigator definitions come from. Called once per coordinator
/// iteration; implementations should re-read their sources each time.
pub trait DefinitionSource: Send + Sync {
    fn load(&self) -> Vec<LocationLoad>;
}

/// Knobs passed through to the evaluators a workspace builds.
#[derive(Debug, Clone)]
pub struct WorkspaceOptions {
    pub code_server_log_level: String,
    pub evaluation_timeout: Option<Duration>,
}

impl Default for WorkspaceOptions {
    fn default() -> Self {
        Self {
            code_server_log_level: "warning".to_string(),
            evaluation_timeout: None,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkspaceTarget
// ---------------------------------------------------------------------------

/// The `-w/--workspace` and `-f/--definitions-file` arguments shared by every
/// command that loads definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceTarget {
    pub workspace_file: Option<PathBuf>,
    pub definitions_files: Vec<PathBuf>,
}

impl WorkspaceTarget {
    pub fn is_empty(&self) -> bool {
        self.workspace_file.is_none() && self.definitions_files.is_empty()
    }

    /// Fall back to `<home>/workspace.yaml` when nothing was given.
    pub fn or_home_default(self, home: &Path) -> Self {
        if !self.is_empty() {
            return self;
        }
        let default = paths::workspace_path(home);
        if default.exists() {
            Self {
                workspace_file: Some(default),
                definitions_files: Vec::new(),
            }
        } else {
            self
        }
    }

    /// Make every path absolute against `base`, so the arguments survive
    /// being handed to a child process.
    pub fn absolutize(self, base: &Path) -> Self {
        Self {
            workspace_file: self.workspace_file.map(|p| paths::resolve(base, &p)),
            definitions_files: self
                .definitions_files
                .iter()
                .map(|p| paths::resolve(base, p))
                .collect(),
        }
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(w) = &self.workspace_file {
            args.push("--workspace".to_string());
            args.push(w.display().to_string());
        }
        for f in &self.definitions_files {
            args.push("--definitions-file".to_string());
            args.push(f.display().to_string());
        }
        args
    }
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
struct LocationEntry {
    file: PathBuf,
    location: Option<String>,
}

/// File-backed [`DefinitionSource`]. Files are re-read on every `load`, so
/// edits take effect on the next coordinator iteration.
#[derive(Debug, Clone)]
pub struct Workspace {
    entries: Vec<LocationEntry>,
    options: WorkspaceOptions,
}

impl Workspace {
    pub fn from_target(target: &WorkspaceTarget, options: WorkspaceOptions) -> Result<Self> {
        if target.is_empty() {
            return Err(InstigateError::InvalidDefinition(
                "no workspace: pass --workspace or --definitions-file, \
                 or create workspace.yaml in the instance home"
                    .to_string(),
            ));
        }
        let mut entries = Vec::new();
        if let Some(ws) = &target.workspace_file {
            let file = WorkspaceFile::load(ws)?;
            let base = ws.parent().unwrap_or(Path::new("."));
            for e in file.load_from {
                entries.push(LocationEntry {
                    file: paths::resolve(base, &e.definitions_file),
                    location: e.location,
                });
            }
        }
        for f in &target.definitions_files {
            entries.push(LocationEntry {
                file: f.clone(),
                location: None,
            });
        }
        Ok(Self { entries, options })
    }

    pub fn options(&self) -> &WorkspaceOptions {
        &self.options
    }
}

impl DefinitionSource for Workspace {
    fn load(&self) -> Vec<LocationLoad> {
        let mut seen = BTreeSet::new();
        let mut loads = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let fallback = entry
                .location
                .clone()
                .unwrap_or_else(|| file_stem(&entry.file));
            let load = match load_definitions_file(
                &entry.file,
                entry.location.as_deref(),
                &self.options,
            ) {
                Ok(loc) if !seen.insert(loc.name.clone()) => LocationLoad::Failed {
                    location: loc.name.clone(),
                    error: format!(
                        "duplicate location '{}' in {}",
                        loc.name,
                        entry.file.display()
                    ),
                },
                Ok(loc) => LocationLoad::Loaded(loc),
                Err(e) => LocationLoad::Failed {
                    location: fallback,
                    error: format!("{}: {e}", entry.file.display()),
                },
            };
            loads.push(load);
        }
        loads
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "default".to_string())
}

/// Parse and validate one definitions file. `location` overrides the name
/// the file declares, which in turn overrides the file stem.
pub fn load_definitions_file(
    path: &Path,
    location: Option<&str>,
    options: &WorkspaceOptions,
) -> Result<LoadedLocation> {
    let data = std::fs::read_to_string(path)?;
    let file: DefinitionsFile = serde_yaml::from_str(&data)?;
    let base = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let name = location
        .map(str::to_string)
        .or(file.location.clone())
        .unwrap_or_else(|| file_stem(path));
    validate_name(&name)?;
    build_location(name, path, &base, file, options)
}

fn build_location(
    name: String,
    source: &Path,
    base: &Path,
    file: DefinitionsFile,
    options: &WorkspaceOptions,
) -> Result<LoadedLocation> {
    if file.repositories.is_empty() {
        return Err(InstigateError::InvalidDefinition(format!(
            "location '{name}' has no repositories"
        )));
    }

    let mut definitions = Vec::new();
    let mut jobs = BTreeMap::new();
    let mut repo_names = BTreeSet::new();

    for repo in file.repositories {
        validate_name(&repo.name)?;
        if !repo_names.insert(repo.name.clone()) {
            return Err(InstigateError::InvalidDefinition(format!(
                "duplicate repository '{}' in location '{name}'",
                repo.name
            )));
        }

        for job in repo.jobs {
            validate_name(&job.name)?;
            let key = (repo.name.clone(), job.name.clone());
            if jobs.insert(key, job.clone()).is_some() {
                return Err(InstigateError::InvalidDefinition(format!(
                    "duplicate job '{}' in {name}/{}",
                    job.name, repo.name
                )));
            }
        }

        let mut names = BTreeSet::new();
        let mut claim = |n: &str| -> Result<()> {
            if names.insert(n.to_string()) {
                Ok(())
            } else {
                Err(InstigateError::InvalidDefinition(format!(
                    "duplicate instigator '{n}' in {name}/{}",
                    repo.name
                )))
            }
        };

        for s in repo.schedules {
            claim(&s.name)?;
            let id = InstigatorId::new(&name, &repo.name, &s.name)?;
            let evaluator: Arc<dyn Evaluate> = match &s.command {
                Some(argv) => command_evaluator(argv, base, options)?,
                None => Arc::new(StaticScheduleEvaluator::new(
                    s.run_config.clone(),
                    s.tags.clone(),
                )),
            };
            let kind = InstigatorKind::Schedule(ScheduleSpec {
                cron: s.cron,
                timezone: s.timezone,
                max_catchup_ticks: s.max_catchup_ticks,
            });
            definitions.push(finish(
                InstigatorDefinition::new(id, kind, s.job, evaluator)?,
                s.default_status,
                s.skip_cursor_policy,
            ));
        }

        for s in repo.sensors {
            claim(&s.name)?;
            let id = InstigatorId::new(&name, &repo.name, &s.name)?;
            if s.minimum_interval_seconds == 0 {
                return Err(InstigateError::InvalidDefinition(format!(
                    "{id}: minimum_interval_seconds must be greater than 0"
                )));
            }
            let evaluator: Arc<dyn Evaluate> = match (&s.command, &s.directory) {
                (Some(argv), None) => command_evaluator(argv, base, options)?,
                (None, Some(dir)) => {
                    if !(dir.run_config.is_null() || dir.run_config.is_object()) {
                        return Err(InstigateError::InvalidDefinition(format!(
                            "{id}: directory.run_config must be a mapping"
                        )));
                    }
                    Arc::new(DirectorySensorEvaluator::new(
                        paths::resolve(base, &dir.path),
                        dir.run_config.clone(),
                    ))
                }
                _ => {
                    return Err(InstigateError::InvalidDefinition(format!(
                        "{id}: a sensor needs exactly one of `command` or `directory`"
                    )))
                }
            };
            let kind = InstigatorKind::Sensor(SensorSpec {
                minimum_interval_seconds: s.minimum_interval_seconds,
            });
            definitions.push(finish(
                InstigatorDefinition::new(id, kind, s.job, evaluator)?,
                s.default_status,
                s.skip_cursor_policy,
            ));
        }
    }

    Ok(LoadedLocation {
        name,
        source: source.to_path_buf(),
        definitions,
        jobs,
    })
}

fn finish(
    def: InstigatorDefinition,
    status: Option<InstigatorStatus>,
    policy: Option<SkipCursorPolicy>,
) -> InstigatorDefinition {
    let def = match status {
        Some(s) => def.with_default_status(s),
        None => def,
    };
    match policy {
        Some(p) => def.with_skip_cursor_policy(p),
        None => def,
    }
}

fn command_evaluator(
    argv: &[String],
    base: &Path,
    options: &WorkspaceOptions,
) -> Result<Arc<dyn Evaluate>> {
    let spec = CommandSpec::from_argv(argv, Some(base))?;
    spec.resolve_program()?;
    Ok(Arc::new(CommandEvaluator::new(
        spec,
        &options.code_server_log_level,
        options.evaluation_timeout,
    )))
}

// ---------------------------------------------------------------------------
// StaticDefinitions
// ---------------------------------------------------------------------------

/// In-memory [`DefinitionSource`] for embedders and tests. `replace` swaps
/// the whole set, as a reload would.
#[derive(Default)]
pub struct StaticDefinitions {
    loads: Mutex<Vec<LocationLoad>>,
}

impl StaticDefinitions {
    pub fn new(loads: Vec<LocationLoad>) -> Self {
        Self {
            loads: Mutex::new(loads),
        }
    }

    /// One successfully loaded location holding `definitions`.
    pub fn single(location: &str, definitions: Vec<InstigatorDefinition>) -> Self {
        Self::new(vec![LocationLoad::Loaded(LoadedLocation {
            name: location.to_string(),
            source: PathBuf::new(),
            definitions,
            jobs: BTreeMap::new(),
        })])
    }

    pub fn replace(&self, loads: Vec<LocationLoad>) {
        match self.loads.lock() {
            Ok(mut guard) => *guard = loads,
            Err(poisoned) => *poisoned.into_inner() = loads,
        }
    }
}

impl DefinitionSource for StaticDefinitions {
    fn load(&self) -> Vec<LocationLoad> {
        match self.loads.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::InstigatorType;
    use tempfile::TempDir;

    const ETL: &str = r#"
location: etl
repositories:
  - name: example_repo
    jobs:
      - name: foo_job
        default_run_config: { ops: { a: 1 } }
    schedules:
      - name: hourly_foo
        job: foo_job
        cron: "0 * * * *"
        default_status: running
    sensors:
      - name: always_on_sensor
        job: foo_job
        minimum_interval_seconds: 10
        default_status: running
        directory: { path: inbox }
"#;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, body).unwrap();
        p
    }

    fn loaded(load: &LocationLoad) -> &LoadedLocation {
        match load {
            LocationLoad::Loaded(l) => l,
            LocationLoad::Failed { error, .. } => panic!("load failed: {error}"),
        }
    }

    #[test]
    fn loads_schedules_sensors_and_jobs() {
        let dir = TempDir::new().unwrap();
        let f = write(dir.path(), "etl.yaml", ETL);
        let loc = load_definitions_file(&f, None, &WorkspaceOptions::default()).unwrap();
        assert_eq!(loc.name, "etl");
        assert_eq!(loc.definitions.len(), 2);

        let sched = &loc.definitions[0];
        assert_eq!(sched.id.key(), "etl/example_repo/hourly_foo");
        assert_eq!(sched.instigator_type(), InstigatorType::Schedule);
        assert_eq!(sched.default_status, InstigatorStatus::Running);
        assert_eq!(sched.skip_cursor_policy, SkipCursorPolicy::Advance);

        let sensor = &loc.definitions[1];
        assert_eq!(sensor.skip_cursor_policy, SkipCursorPolicy::Retain);
        assert_eq!(
            sensor.kind,
            InstigatorKind::Sensor(SensorSpec {
                minimum_interval_seconds: 10
            })
        );

        let job = loc.job("example_repo", "foo_job").unwrap();
        assert_eq!(job.default_run_config["ops"]["a"], 1);
    }

    #[test]
    fn location_defaults_to_file_stem() {
        let dir = TempDir::new().unwrap();
        let body = ETL.replace("location: etl\n", "");
        let f = write(dir.path(), "nightly.yaml", &body);
        let loc = load_definitions_file(&f, None, &WorkspaceOptions::default()).unwrap();
        assert_eq!(loc.name, "nightly");
        let loc = load_definitions_file(&f, Some("override"), &WorkspaceOptions::default()).unwrap();
        assert_eq!(loc.name, "override");
    }

    #[test]
    fn rejects_invalid_files() {
        let dir = TempDir::new().unwrap();
        let opts = WorkspaceOptions::default();
        let cases = [
            ("empty.yaml", "location: x\nrepositories: []\n"),
            (
                "dup.yaml",
                "repositories:\n  - name: r\n    schedules:\n      - { name: a, job: j, cron: '0 * * * *' }\n      - { name: a, job: j, cron: '0 * * * *' }\n",
            ),
            (
                "cron.yaml",
                "repositories:\n  - name: r\n    schedules:\n      - { name: a, job: j, cron: 'every hour' }\n",
            ),
            (
                "tz.yaml",
                "repositories:\n  - name: r\n    schedules:\n      - { name: a, job: j, cron: '0 * * * *', timezone: Nowhere/Land }\n",
            ),
            (
                "sensor.yaml",
                "repositories:\n  - name: r\n    sensors:\n      - { name: s, job: j }\n",
            ),
            (
                "typo.yaml",
                "repositories:\n  - name: r\n    sensors:\n      - { name: s, job: j, directroy: { path: x } }\n",
            ),
        ];
        for (name, body) in cases {
            let f = write(dir.path(), name, body);
            assert!(
                load_definitions_file(&f, None, &opts).is_err(),
                "{name} should fail"
            );
        }
    }

    #[test]
    fn workspace_resolves_relative_entries_and_isolates_failures() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("defs")).unwrap();
        write(&dir.path().join("defs"), "etl.yaml", ETL);
        write(&dir.path().join("defs"), "broken.yaml", "repositories: [");
        let ws = write(
            dir.path(),
            "workspace.yaml",
            "load_from:\n  - definitions_file: defs/etl.yaml\n  - definitions_file: defs/broken.yaml\n    location: broken\n",
        );

        let target = WorkspaceTarget {
            workspace_file: Some(ws),
            definitions_files: vec![],
        };
        let workspace = Workspace::from_target(&target, WorkspaceOptions::default()).unwrap();
        let loads = workspace.load();
        assert_eq!(loads.len(), 2);
        assert_eq!(loaded(&loads[0]).definitions.len(), 2);
        match &loads[1] {
            LocationLoad::Failed { location, .. } => assert_eq!(location, "broken"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_locations_fail_the_second() {
        let dir = TempDir::new().unwrap();
        let a = write(dir.path(), "a.yaml", ETL);
        let b = write(dir.path(), "b.yaml", ETL);
        let target = WorkspaceTarget {
            workspace_file: None,
            definitions_files: vec![a, b],
        };
        let loads = Workspace::from_target(&target, WorkspaceOptions::default())
            .unwrap()
            .load();
        assert!(matches!(loads[0], LocationLoad::Loaded(_)));
        assert!(matches!(loads[1], LocationLoad::Failed { .. }));
    }

    #[test]
    fn reload_sees_edits() {
        let dir = TempDir::new().unwrap();
        let f = write(dir.path(), "etl.yaml", ETL);
        let target = WorkspaceTarget {
            workspace_file: None,
            definitions_files: vec![f.clone()],
        };
        let workspace = Workspace::from_target(&target, WorkspaceOptions::default()).unwrap();
        assert_eq!(loaded(&workspace.load()[0]).definitions.len(), 2);

        let without_sensor = ETL.split("    sensors:").next().unwrap().to_string();
        std::fs::write(&f, without_sensor).unwrap();
        assert_eq!(loaded(&workspace.load()[0]).definitions.len(), 1);
    }

    #[test]
    fn target_args_and_defaults() {
        let dir = TempDir::new().unwrap();
        let empty = WorkspaceTarget::default();
        assert!(Workspace::from_target(&empty, WorkspaceOptions::default()).is_err());
        assert!(empty.clone().or_home_default(dir.path()).is_empty());

        write(dir.path(), "workspace.yaml", "load_from: []\n");
        let resolved = empty.or_home_default(dir.path());
        assert_eq!(
            resolved.workspace_file,
            Some(dir.path().join("workspace.yaml"))
        );

        let target = WorkspaceTarget {
            workspace_file: None,
            definitions_files: vec![PathBuf::from("etl.yaml")],
        }
        .absolutize(Path::new("/srv"));
        assert_eq!(
            target.to_args(),
            vec!["--definitions-file".to_string(), "/srv/etl.yaml".to_string()]
        );
    }
}
