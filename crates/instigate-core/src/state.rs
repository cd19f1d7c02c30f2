use crate::definition::InstigatorId;
use crate::error::{InstigateError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstigatorStatus {
    Running,
    #[default]
    Stopped,
}

impl InstigatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstigatorStatus::Running => "RUNNING",
            InstigatorStatus::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for InstigatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstigatorStatus {
    type Err = InstigateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "RUNNING" => Ok(InstigatorStatus::Running),
            "STOPPED" => Ok(InstigatorStatus::Stopped),
            other => Err(InstigateError::Storage(format!(
                "unknown instigator status '{other}'"
            ))),
        }
    }
}

/// Mutable per-instigator state. The cursor only moves when a tick closes
/// or when an operator sets it explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstigatorState {
    pub id: InstigatorId,
    pub status: InstigatorStatus,
    pub cursor: Option<String>,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub status_changed_at: DateTime<Utc>,
}

impl InstigatorState {
    pub fn new(id: InstigatorId, status: InstigatorStatus, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status,
            cursor: None,
            last_evaluated_at: None,
            status_changed_at: now,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == InstigatorStatus::Running
    }
}
