use anyhow::{Context, Result};
use instigate_core::instance::{Instance, InstanceRef};
use instigate_core::paths::HOME_ENV;
use std::path::{Path, PathBuf};

/// Where an instance home came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Home {
    /// `INSTIGATE_HOME`.
    Configured(PathBuf),
    /// Nothing configured; the current directory stands in.
    CurrentDir(PathBuf),
}

impl Home {
    pub fn path(&self) -> &Path {
        match self {
            Home::Configured(p) | Home::CurrentDir(p) => p,
        }
    }
}

/// An empty `INSTIGATE_HOME` counts as unset.
pub fn choose_home(env_home: Option<PathBuf>, cwd: &Path) -> Home {
    match env_home.filter(|p| !p.as_os_str().is_empty()) {
        Some(p) => Home::Configured(instigate_core::paths::resolve(cwd, &p)),
        None => Home::CurrentDir(cwd.to_path_buf()),
    }
}

fn env_home() -> Option<PathBuf> {
    std::env::var_os(HOME_ENV).map(PathBuf::from)
}

/// Open the long-lived instance used by `start` and the operator commands:
/// `INSTIGATE_HOME`, or the current directory with a warning.
pub fn open_persistent_instance() -> Result<Instance> {
    let cwd = std::env::current_dir()?;
    let home = choose_home(env_home(), &cwd);
    if let Home::CurrentDir(dir) = &home {
        tracing::warn!(
            "{HOME_ENV} is not set; instance storage will live in {}",
            dir.display()
        );
    }
    Instance::open(home.path())
        .with_context(|| format!("cannot open instance at {}", home.path().display()))
}

/// Open the instance for a service process (`api`, `daemon`). A serialized
/// `--instance-ref` wins; then `INSTIGATE_HOME`; otherwise a temporary home
/// under the current directory that is deleted on exit.
pub fn open_service_instance(instance_ref: Option<&str>) -> Result<Instance> {
    if let Some(json) = instance_ref {
        let instance_ref = InstanceRef::from_json(json).context("invalid --instance-ref")?;
        return Instance::from_ref(&instance_ref)
            .with_context(|| format!("cannot open instance at {}", instance_ref.home.display()));
    }
    let cwd = std::env::current_dir()?;
    match choose_home(env_home(), &cwd) {
        Home::Configured(home) => Instance::open(&home)
            .with_context(|| format!("cannot open instance at {}", home.display())),
        Home::CurrentDir(dir) => {
            let instance = Instance::local_temp(&dir)?;
            tracing::info!(
                home = %instance.home().display(),
                "{HOME_ENV} is not set; using a temporary instance that is removed on exit"
            );
            Ok(instance)
        }
    }
}
