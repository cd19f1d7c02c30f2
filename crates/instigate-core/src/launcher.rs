//! The run-launch boundary. Executing a run is someone else's job; a launcher
//! only hands the request over and names the run.

use crate::command::CommandSpec;
use crate::config::RunLauncherConfig;
use crate::definition::InstigatorId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

pub const RUN_ID_ENV: &str = "INSTIGATE_RUN_ID";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated run request, ready to hand to a launcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLaunch {
    pub instigator: InstigatorId,
    pub tick_sequence: u64,
    pub job_name: String,
    pub run_key: Option<String>,
    pub run_config: serde_json::Value,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to start run launcher: {0}")]
    Spawn(String),
    #[error("run launcher rejected the run: {0}")]
    Rejected(String),
}

pub trait RunLauncher: Send + Sync {
    fn launch_run(&self, launch: &RunLaunch) -> Result<RunId, LaunchError>;
}

// ---------------------------------------------------------------------------
// LogOnlyRunLauncher
// ---------------------------------------------------------------------------

/// Records launches in the log and nothing else.
#[derive(Debug, Default)]
pub struct LogOnlyRunLauncher;

impl RunLauncher for LogOnlyRunLauncher {
    fn launch_run(&self, launch: &RunLaunch) -> Result<RunId, LaunchError> {
        let run_id = RunId::generate();
        tracing::info!(
            instigator = %launch.instigator,
            tick = launch.tick_sequence,
            job = %launch.job_name,
            run_key = launch.run_key.as_deref().unwrap_or(""),
            run_id = %run_id,
            "launched run (log only)"
        );
        Ok(run_id)
    }
}

// ---------------------------------------------------------------------------
// CommandRunLauncher
// ---------------------------------------------------------------------------

/// Spawns a command per run and does not wait for it. The [`RunLaunch`] is
/// written to stdin as JSON and the run id is passed in `INSTIGATE_RUN_ID`.
#[derive(Debug, Clone)]
pub struct CommandRunLauncher {
    spec: CommandSpec,
}

impl CommandRunLauncher {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

impl RunLauncher for CommandRunLauncher {
    fn launch_run(&self, launch: &RunLaunch) -> Result<RunId, LaunchError> {
        let run_id = RunId::generate();
        let payload =
            serde_json::to_vec(launch).map_err(|e| LaunchError::Rejected(e.to_string()))?;

        let mut cmd = self
            .spec
            .command()
            .map_err(|e| LaunchError::Spawn(e.to_string()))?;
        cmd.env(RUN_ID_ENV, run_id.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        let mut child = cmd
            .spawn()
            .map_err(|e| LaunchError::Spawn(format!("{}: {e}", self.spec.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&payload) {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(LaunchError::Spawn(format!("failed to write stdin: {e}")));
                }
            }
        }

        let program = self.spec.program.clone();
        let reaped_id = run_id.clone();
        std::thread::spawn(move || match child.wait() {
            Ok(status) if !status.success() => {
                tracing::warn!(run_id = %reaped_id, %program, %status, "run launcher command failed");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(run_id = %reaped_id, error = %e, "failed to reap run launcher"),
        });

        tracing::info!(
            instigator = %launch.instigator,
            tick = launch.tick_sequence,
            job = %launch.job_name,
            run_id = %run_id,
            "launched run"
        );
        Ok(run_id)
    }
}

/// Build the configured launcher. Relative programs resolve against `home`.
pub fn launcher_from_config(cfg: &RunLauncherConfig, home: &Path) -> Arc<dyn RunLauncher> {
    match cfg {
        RunLauncherConfig::LogOnly => Arc::new(LogOnlyRunLauncher),
        RunLauncherConfig::Command { program, args, env } => {
            Arc::new(CommandRunLauncher::new(CommandSpec {
                program: program.clone(),
                args: args.clone(),
                env: env.clone(),
                working_dir: Some(home.to_path_buf()),
            }))
        }
    }
}
