//! An instance is a home directory, its `instance.yaml` and its storage.
//! Every process of a deployment opens the same instance; the supervisor
//! passes it to its children as a serialized [`InstanceRef`].

use crate::config::InstanceConfig;
use crate::error::Result;
use crate::launcher::{launcher_from_config, RunLauncher};
use crate::paths;
use crate::storage::{InstigatorStorage, MemoryStorage, SqliteStorage};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Everything a child process needs to open the same instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRef {
    pub home: PathBuf,
    pub config: InstanceConfig,
}

impl InstanceRef {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

pub struct Instance {
    home: PathBuf,
    config: InstanceConfig,
    storage: Arc<dyn InstigatorStorage>,
    // Dropped last; removes a temporary home.
    _temp: Option<TempDir>,
}

impl Instance {
    /// Open (and initialize if needed) the instance at `home`.
    pub fn open(home: &Path) -> Result<Self> {
        crate::io::ensure_dir(home)?;
        let config = InstanceConfig::load(home)?;
        let config_path = paths::instance_config_path(home);
        if !config_path.exists() {
            config.save(home)?;
        }
        Self::with_config(home, config, None)
    }

    pub fn from_ref(instance_ref: &InstanceRef) -> Result<Self> {
        Self::with_config(&instance_ref.home, instance_ref.config.clone(), None)
    }

    /// A throwaway instance in a fresh directory under `parent`, deleted
    /// when the instance is dropped.
    pub fn local_temp(parent: &Path) -> Result<Self> {
        let temp = tempfile::Builder::new()
            .prefix(".instigate-")
            .tempdir_in(parent)?;
        let home = temp.path().to_path_buf();
        let config = InstanceConfig::default();
        config.save(&home)?;
        Self::with_config(&home, config, Some(temp))
    }

    /// An instance over caller-supplied storage. Nothing is read from or
    /// written to `home`.
    pub fn with_storage(
        home: &Path,
        config: InstanceConfig,
        storage: Arc<dyn InstigatorStorage>,
    ) -> Self {
        Self {
            home: home.to_path_buf(),
            config,
            storage,
            _temp: None,
        }
    }

    pub fn in_memory(home: &Path, config: InstanceConfig) -> Self {
        Self::with_storage(home, config, Arc::new(MemoryStorage::new()))
    }

    fn with_config(home: &Path, config: InstanceConfig, temp: Option<TempDir>) -> Result<Self> {
        for warning in config.ensure_valid()? {
            tracing::warn!("{}", warning.message);
        }
        let storage = SqliteStorage::open(&config.database_path(home))?;
        Ok(Self {
            home: home.to_path_buf(),
            config,
            storage: Arc::new(storage),
            _temp: temp,
        })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn storage(&self) -> Arc<dyn InstigatorStorage> {
        self.storage.clone()
    }

    pub fn run_launcher(&self) -> Arc<dyn RunLauncher> {
        launcher_from_config(&self.config.run_launcher, &self.home)
    }

    pub fn is_temporary(&self) -> bool {
        self._temp.is_some()
    }

    pub fn get_ref(&self) -> InstanceRef {
        InstanceRef {
            home: self.home.clone(),
            config: self.config.clone(),
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("home", &self.home)
            .field("temporary", &self.is_temporary())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::InstigatorId;
    use crate::state::InstigatorStatus;
    use chrono::Utc;

    #[test]
    fn open_initializes_home() {
        let dir = TempDir::new().unwrap();
        let instance = Instance::open(dir.path()).unwrap();
        assert!(dir.path().join("instance.yaml").exists());
        assert!(dir.path().join("storage/instigate.db").exists());
        assert!(!instance.is_temporary());
    }

    #[test]
    fn ref_roundtrip_opens_same_storage() {
        let dir = TempDir::new().unwrap();
        let instance = Instance::open(dir.path()).unwrap();
        let id = InstigatorId::new("etl", "repo", "a").unwrap();
        instance
            .storage()
            .ensure_state(&id, InstigatorStatus::Running, Utc::now())
            .unwrap();

        let json = instance.get_ref().to_json().unwrap();
        let child = Instance::from_ref(&InstanceRef::from_json(&json).unwrap()).unwrap();
        assert!(child.storage().get_state(&id).unwrap().is_some());
        assert_eq!(child.home(), dir.path());
    }

    #[test]
    fn local_temp_is_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let instance = Instance::local_temp(dir.path()).unwrap();
        let home = instance.home().to_path_buf();
        assert!(home.starts_with(dir.path()));
        assert!(home.join("instance.yaml").exists());
        assert!(instance.is_temporary());
        drop(instance);
        assert!(!home.exists());
    }

    #[test]
    fn invalid_config_refuses_to_open() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("instance.yaml"),
            "coordinator:\n  max_concurrent_evaluations: 0\n",
        )
        .unwrap();
        assert!(Instance::open(dir.path()).is_err());
    }
}
