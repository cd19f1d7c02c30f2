pub mod api;
pub mod daemon;
pub mod instigator;
pub mod start;

use anyhow::Result;
use clap::Args;
use instigate_core::workspace::{Workspace, WorkspaceOptions, WorkspaceTarget};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CODE_SERVER_LOG_LEVELS: [&str; 6] =
    ["critical", "error", "warning", "info", "debug", "trace"];

/// Where definitions come from. Shared by every command that loads them.
/// Targets are always files; code-backed evaluators are reached through a
/// definition's `command` argv, not an importable module name.
#[derive(Args, Debug, Clone)]
pub struct WorkspaceArgs {
    /// Workspace file listing code locations
    #[arg(short = 'w', long = "workspace", global = true)]
    pub workspace: Option<PathBuf>,

    /// Definitions file (one code location); repeatable
    #[arg(short = 'f', long = "definitions-file", global = true)]
    pub definitions_files: Vec<PathBuf>,

    /// Log level handed to code-server evaluators
    #[arg(
        long,
        global = true,
        default_value = "warning",
        value_parser = CODE_SERVER_LOG_LEVELS
    )]
    pub code_server_log_level: String,
}

impl WorkspaceArgs {
    /// Absolute target, falling back to `<home>/workspace.yaml`.
    pub fn target(&self, home: &Path) -> Result<WorkspaceTarget> {
        let cwd = std::env::current_dir()?;
        Ok(WorkspaceTarget {
            workspace_file: self.workspace.clone(),
            definitions_files: self.definitions_files.clone(),
        }
        .absolutize(&cwd)
        .or_home_default(home))
    }

    pub fn open(&self, home: &Path, evaluation_timeout: Option<Duration>) -> Result<Workspace> {
        let options = WorkspaceOptions {
            code_server_log_level: self.code_server_log_level.clone(),
            evaluation_timeout,
        };
        Ok(Workspace::from_target(&self.target(home)?, options)?)
    }
}

/// Set by `instigate start` on the processes it supervises.
#[derive(Args, Debug, Clone, Default)]
pub struct InstanceArgs {
    /// Serialized instance reference (JSON)
    #[arg(long, hide = true)]
    pub instance_ref: Option<String>,
}

/// Build a multi-threaded runtime, run `fut`, then give blocked evaluator
/// threads one second before abandoning them.
pub fn block_on<F, T>(fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(fut);
    rt.shutdown_timeout(Duration::from_secs(1));
    result
}
