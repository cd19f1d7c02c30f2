use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::supervisor::ProcessSpec;

// ─── ChildProcess ─────────────────────────────────────────────────────────

/// A supervised child. Killed if dropped while still running.
pub(crate) struct ChildProcess {
    name: String,
    child: Child,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChildShutdown {
    Exited(Option<i32>),
    Killed,
}

impl ChildProcess {
    pub(crate) fn spawn(spec: &ProcessSpec) -> std::io::Result<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        // Own process group: a terminal Ctrl-C reaches the supervisor only,
        // which then stops the children itself.
        #[cfg(unix)]
        cmd.process_group(0);
        let child = cmd.spawn()?;
        Ok(Self {
            name: spec.name.clone(),
            child,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub(crate) fn try_exit(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Send SIGTERM (`kill -TERM {pid}`). A child that already exited is left
    /// alone.
    pub(crate) async fn terminate(&mut self) -> std::io::Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        #[cfg(unix)]
        {
            let status = Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .status()
                .await?;
            if !status.success() {
                return Err(std::io::Error::other(format!(
                    "kill -TERM {pid} failed with exit code {:?}",
                    status.code()
                )));
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            self.child.start_kill()
        }
    }

    /// Wait up to `limit` for the child to exit, then kill it.
    pub(crate) async fn wait_or_kill(&mut self, limit: Duration) -> ChildShutdown {
        tracing::info!(name = %self.name, "waiting for process to exit");
        match tokio::time::timeout(limit, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(name = %self.name, code = ?status.code(), "process shut down");
                ChildShutdown::Exited(status.code())
            }
            Ok(Err(e)) => {
                tracing::warn!(name = %self.name, "could not wait for process: {e}");
                self.kill().await
            }
            Err(_) => {
                tracing::warn!(
                    name = %self.name,
                    timeout = ?limit,
                    "process did not exit in time; killing"
                );
                self.kill().await
            }
        }
    }

    async fn kill(&mut self) -> ChildShutdown {
        if let Err(e) = self.child.kill().await {
            tracing::error!(name = %self.name, "failed to kill process: {e}");
        } else {
            tracing::info!(name = %self.name, "process killed");
        }
        ChildShutdown::Killed
    }
}
