//! Tick records and the tick state machine.
//!
//! ```text
//!            +--> SUCCESS
//! STARTED ---+--> FAILURE
//!            +--> SKIPPED
//! ```
//!
//! Terminal ticks never change again. Storage enforces the transition with a
//! compare-and-swap on `status = 'STARTED'`.

use crate::definition::InstigatorId;
use crate::error::{InstigateError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TickStatus {
    Started,
    Success,
    Failure,
    Skipped,
}

impl TickStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickStatus::Started => "STARTED",
            TickStatus::Success => "SUCCESS",
            TickStatus::Failure => "FAILURE",
            TickStatus::Skipped => "SKIPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TickStatus::Started)
    }

    pub fn can_transition_to(&self, next: TickStatus) -> bool {
        matches!(self, TickStatus::Started) && next.is_terminal()
    }
}

impl fmt::Display for TickStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TickStatus {
    type Err = InstigateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "STARTED" => Ok(TickStatus::Started),
            "SUCCESS" => Ok(TickStatus::Success),
            "FAILURE" => Ok(TickStatus::Failure),
            "SKIPPED" => Ok(TickStatus::Skipped),
            other => Err(InstigateError::Storage(format!(
                "unknown tick status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickErrorKind {
    /// The evaluation callback returned an error.
    Raised,
    /// The callback returned something that is not an evaluation result.
    Malformed,
    Timeout,
    Panicked,
    /// An accepted run request could not be launched.
    Dispatch,
    Storage,
    /// The tick was still STARTED when a reconciliation pass found it.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickError {
    pub message: String,
    pub kind: TickErrorKind,
}

impl TickError {
    pub fn new(kind: TickErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }
}

impl fmt::Display for TickError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub instigator: InstigatorId,
    pub sequence: u64,
    pub status: TickStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_keys: Vec<String>,
    #[serde(default)]
    pub run_ids: Vec<String>,
    pub skip_reason: Option<String>,
    pub error: Option<TickError>,
    pub cursor: Option<String>,
}

impl Tick {
    /// A fresh STARTED tick. `cursor` is the state cursor at open time.
    pub fn started(
        instigator: InstigatorId,
        sequence: u64,
        started_at: DateTime<Utc>,
        scheduled_for: Option<DateTime<Utc>>,
        cursor: Option<String>,
    ) -> Self {
        Self {
            instigator,
            sequence,
            status: TickStatus::Started,
            started_at,
            ended_at: None,
            scheduled_for,
            run_keys: Vec::new(),
            run_ids: Vec::new(),
            skip_reason: None,
            error: None,
            cursor,
        }
    }

    /// `location/repository/name#sequence`, used in logs and errors.
    pub fn label(&self) -> String {
        format!("{}#{}", self.instigator, self.sequence)
    }

    /// Apply a close to an in-memory copy. `committed_cursor` is the cursor the
    /// state holds after the close.
    pub fn apply_close(&mut self, close: &TickClose, committed_cursor: Option<String>) {
        self.status = close.status;
        self.ended_at = Some(close.ended_at);
        self.skip_reason = close.skip_reason.clone();
        self.error = close.error.clone();
        self.cursor = committed_cursor;
    }
}

/// Cursor handling for a tick close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorUpdate {
    /// Leave the committed cursor as it is.
    Keep,
    /// Overwrite the committed cursor.
    Set(Option<String>),
}

impl CursorUpdate {
    pub fn resolve(&self, previous: Option<String>) -> Option<String> {
        match self {
            CursorUpdate::Keep => previous,
            CursorUpdate::Set(c) => c.clone(),
        }
    }
}

/// Terminal transition for a STARTED tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickClose {
    pub status: TickStatus,
    pub ended_at: DateTime<Utc>,
    pub skip_reason: Option<String>,
    pub error: Option<TickError>,
    pub cursor: CursorUpdate,
}

impl TickClose {
    pub fn success(ended_at: DateTime<Utc>, cursor: CursorUpdate) -> Self {
        Self {
            status: TickStatus::Success,
            ended_at,
            skip_reason: None,
            error: None,
            cursor,
        }
    }

    /// FAILURE never touches the cursor.
    pub fn failure(ended_at: DateTime<Utc>, error: TickError) -> Self {
        Self {
            status: TickStatus::Failure,
            ended_at,
            skip_reason: None,
            error: Some(error),
            cursor: CursorUpdate::Keep,
        }
    }

    pub fn skipped(
        ended_at: DateTime<Utc>,
        reason: Option<String>,
        cursor: CursorUpdate,
    ) -> Self {
        Self {
            status: TickStatus::Skipped,
            ended_at,
            skip_reason: reason,
            error: None,
            cursor,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !TickStatus::Started.can_transition_to(self.status) {
            return Err(InstigateError::Storage(format!(
                "cannot close a tick as {}",
                self.status
            )));
        }
        if self.status == TickStatus::Failure && self.cursor != CursorUpdate::Keep {
            return Err(InstigateError::Storage(
                "a FAILURE tick cannot move the cursor".to_string(),
            ));
        }
        Ok(())
    }
}
