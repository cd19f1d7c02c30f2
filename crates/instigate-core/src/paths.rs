use crate::error::{InstigateError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Instance home layout
// ---------------------------------------------------------------------------

pub const HOME_ENV: &str = "INSTIGATE_HOME";

pub const INSTANCE_FILE: &str = "instance.yaml";
pub const WORKSPACE_FILE: &str = "workspace.yaml";
pub const STORAGE_DIR: &str = "storage";
pub const DATABASE_FILE: &str = "storage/instigate.db";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn instance_config_path(home: &Path) -> PathBuf {
    home.join(INSTANCE_FILE)
}

pub fn workspace_path(home: &Path) -> PathBuf {
    home.join(WORKSPACE_FILE)
}

pub fn storage_dir(home: &Path) -> PathBuf {
    home.join(STORAGE_DIR)
}

pub fn default_database_path(home: &Path) -> PathBuf {
    home.join(DATABASE_FILE)
}

/// Resolve `path` against `base` unless it is already absolute.
pub fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

// ---------------------------------------------------------------------------
// Name validation
// ---------------------------------------------------------------------------

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_\-]*$").unwrap_or_else(|_| unreachable!())
    })
}

/// Validate a location, repository, job or instigator name.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 128 || !name_re().is_match(name) {
        return Err(InstigateError::InvalidName(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
