use crate::error::Result;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// StorageConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file, relative to the instance home unless absolute.
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(paths::DATABASE_FILE)
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// CoordinatorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_evaluations: usize,
    #[serde(default = "default_evaluation_timeout")]
    pub evaluation_timeout_seconds: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
    #[serde(default = "default_reconcile_grace")]
    pub reconcile_grace_seconds: u64,
    /// Consecutive failed iterations before the loop gives up. 0 never gives up.
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
}

fn default_interval() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    10
}

fn default_evaluation_timeout() -> u64 {
    300
}

fn default_shutdown_grace() -> u64 {
    60
}

fn default_reconcile_grace() -> u64 {
    600
}

fn default_max_failures() -> u32 {
    40
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            max_concurrent_evaluations: default_max_concurrent(),
            evaluation_timeout_seconds: default_evaluation_timeout(),
            shutdown_grace_seconds: default_shutdown_grace(),
            reconcile_grace_seconds: default_reconcile_grace(),
            max_consecutive_failures: default_max_failures(),
        }
    }
}

impl CoordinatorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn evaluation_timeout(&self) -> Duration {
        Duration::from_secs(self.evaluation_timeout_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn reconcile_grace(&self) -> Duration {
        Duration::from_secs(self.reconcile_grace_seconds)
    }
}

// ---------------------------------------------------------------------------
// SupervisorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_shutdown_timeout() -> u64 {
    60
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
        }
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

// ---------------------------------------------------------------------------
// RunLauncherConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunLauncherConfig {
    #[default]
    LogOnly,
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
}

// ---------------------------------------------------------------------------
// InstanceConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub run_launcher: RunLauncherConfig,
}

impl InstanceConfig {
    /// Load `instance.yaml` from `home`, falling back to defaults when absent.
    pub fn load(home: &Path) -> Result<Self> {
        let path = paths::instance_config_path(home);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: InstanceConfig = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, home: &Path) -> Result<()> {
        let path = paths::instance_config_path(home);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn database_path(&self, home: &Path) -> PathBuf {
        paths::resolve(home, &self.storage.path)
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let c = &self.coordinator;

        if c.interval_seconds == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "coordinator.interval_seconds must be greater than 0".to_string(),
            });
        }
        if c.max_concurrent_evaluations == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "coordinator.max_concurrent_evaluations must be greater than 0"
                    .to_string(),
            });
        }
        if c.evaluation_timeout_seconds == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "coordinator.evaluation_timeout_seconds must be greater than 0"
                    .to_string(),
            });
        }
        if c.reconcile_grace_seconds < c.evaluation_timeout_seconds {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "coordinator.reconcile_grace_seconds ({}) is shorter than the evaluation \
                     timeout ({}); live ticks may be failed by a concurrent reconcile",
                    c.reconcile_grace_seconds, c.evaluation_timeout_seconds
                ),
            });
        }
        if self.supervisor.poll_interval_seconds == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "supervisor.poll_interval_seconds must be greater than 0".to_string(),
            });
        }
        if let RunLauncherConfig::Command { program, .. } = &self.run_launcher {
            if program.trim().is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: "run_launcher.program is empty".to_string(),
                });
            }
        }

        warnings
    }

    /// Turn validation errors into a hard failure; warnings pass through.
    pub fn ensure_valid(&self) -> Result<Vec<ConfigWarning>> {
        let warnings = self.validate();
        let errors: Vec<&str> = warnings
            .iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message.as_str())
            .collect();
        if !errors.is_empty() {
            return Err(crate::InstigateError::InvalidConfig(errors.join("; ")));
        }
        Ok(warnings)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
