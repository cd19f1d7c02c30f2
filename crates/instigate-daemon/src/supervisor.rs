//! Keeps a group of sibling processes alive together: if one exits, all go.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use futures::future::join_all;
use instigate_core::config::SupervisorConfig;
use thiserror::Error;

use crate::process::{ChildProcess, ChildShutdown};
use crate::shutdown::{Shutdown, ShutdownSignal};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to start {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{name} exited unexpectedly ({})", describe_code(.code))]
    ChildExited { name: String, code: Option<i32> },
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "terminated by a signal".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorExit {
    pub signal: ShutdownSignal,
    /// Children that ignored SIGTERM and had to be killed.
    pub killed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    poll_interval: Duration,
    shutdown_timeout: Duration,
}

impl Supervisor {
    pub fn new(poll_interval: Duration, shutdown_timeout: Duration) -> Self {
        Self {
            poll_interval,
            shutdown_timeout,
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(config.poll_interval(), config.shutdown_timeout())
    }

    /// Start every process and watch them until shutdown or until one exits.
    pub async fn supervise(
        &self,
        specs: Vec<ProcessSpec>,
        mut shutdown: Shutdown,
    ) -> Result<SupervisorExit, SupervisorError> {
        let mut children = Vec::with_capacity(specs.len());
        for spec in &specs {
            match ChildProcess::spawn(spec) {
                Ok(child) => {
                    tracing::info!(name = %spec.name, pid = ?child.pid(), "started process");
                    children.push(child);
                }
                Err(source) => {
                    tracing::error!(name = %spec.name, "failed to start process: {source}");
                    self.shutdown_all(&mut children).await;
                    return Err(SupervisorError::Spawn {
                        name: spec.name.clone(),
                        source,
                    });
                }
            }
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                signal = shutdown.wait() => {
                    tracing::info!(signal = %signal, "shutting down processes");
                    let killed = self.shutdown_all(&mut children).await;
                    return Ok(SupervisorExit { signal, killed });
                }
                _ = ticker.tick() => {
                    if let Some((index, code)) = first_exited(&mut children) {
                        let exited = children.remove(index);
                        tracing::error!(
                            name = %exited.name(),
                            code = ?code,
                            "process exited unexpectedly; shutting down the others"
                        );
                        self.shutdown_all(&mut children).await;
                        return Err(SupervisorError::ChildExited {
                            name: exited.name().to_string(),
                            code,
                        });
                    }
                }
            }
        }
    }

    /// SIGTERM everyone at once, then wait for all of them in parallel.
    /// Returns the names of children that had to be killed.
    async fn shutdown_all(&self, children: &mut [ChildProcess]) -> Vec<String> {
        for child in children.iter_mut() {
            if let Err(e) = child.terminate().await {
                tracing::warn!(name = %child.name(), "failed to send SIGTERM: {e}");
            }
        }
        let timeout = self.shutdown_timeout;
        let outcomes = join_all(children.iter_mut().map(|child| async move {
            let outcome = child.wait_or_kill(timeout).await;
            (child.name().to_string(), outcome)
        }))
        .await;
        outcomes
            .into_iter()
            .filter(|(_, outcome)| *outcome == ChildShutdown::Killed)
            .map(|(name, _)| name)
            .collect()
    }
}

fn first_exited(children: &mut [ChildProcess]) -> Option<(usize, Option<i32>)> {
    for (index, child) in children.iter_mut().enumerate() {
        match child.try_exit() {
            Ok(Some(status)) => return Some((index, status.code())),
            Ok(None) => {}
            Err(e) => tracing::warn!(name = %child.name(), "failed to poll process: {e}"),
        }
    }
    None
}
