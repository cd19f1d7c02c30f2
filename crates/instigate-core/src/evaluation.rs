//! The evaluation protocol between the engine and instigator callbacks.

use crate::definition::{InstigatorId, InstigatorType};
use crate::tick::TickErrorKind;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

/// A proposal to launch one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub run_key: Option<String>,
    #[serde(default)]
    pub run_config: serde_json::Value,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Overrides the instigator's target job.
    #[serde(default)]
    pub job_name: Option<String>,
}

impl RunRequest {
    pub fn keyed(run_key: impl Into<String>) -> Self {
        Self {
            run_key: Some(run_key.into()),
            ..Self::default()
        }
    }

    pub fn with_run_config(mut self, run_config: serde_json::Value) -> Self {
        self.run_config = run_config;
        self
    }

    /// The run key, treating an empty string as absent.
    pub fn effective_run_key(&self) -> Option<&str> {
        self.run_key.as_deref().filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    #[serde(default)]
    pub run_requests: Vec<RunRequest>,
    /// `None` means "no new cursor".
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub skip_reason: Option<String>,
}

impl EvaluationResult {
    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            skip_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn requests(run_requests: Vec<RunRequest>) -> Self {
        Self {
            run_requests,
            ..Self::default()
        }
    }

    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }
}

/// Everything an evaluation callback is told about the tick it serves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
    pub instigator: InstigatorId,
    pub instigator_type: InstigatorType,
    pub job_name: String,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub cursor: Option<String>,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub evaluation_time: DateTime<Utc>,
}

/// Canonical cursor/run-key form of a schedule boundary.
pub fn format_scheduled_for(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ---------------------------------------------------------------------------
// EvaluationError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationErrorKind {
    Raised,
    Malformed,
    Timeout,
    Panicked,
}

impl From<EvaluationErrorKind> for TickErrorKind {
    fn from(kind: EvaluationErrorKind) -> Self {
        match kind {
            EvaluationErrorKind::Raised => TickErrorKind::Raised,
            EvaluationErrorKind::Malformed => TickErrorKind::Malformed,
            EvaluationErrorKind::Timeout => TickErrorKind::Timeout,
            EvaluationErrorKind::Panicked => TickErrorKind::Panicked,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct EvaluationError {
    pub kind: EvaluationErrorKind,
    pub message: String,
}

impl EvaluationError {
    pub fn raised(message: impl Into<String>) -> Self {
        Self {
            kind: EvaluationErrorKind::Raised,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            kind: EvaluationErrorKind::Malformed,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: EvaluationErrorKind::Timeout,
            message: message.into(),
        }
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self {
            kind: EvaluationErrorKind::Panicked,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluate
// ---------------------------------------------------------------------------

/// An instigator's evaluation callback. Implementations may block; the
/// engine always calls them off the async runtime.
pub trait Evaluate: Send + Sync {
    fn evaluate(&self, ctx: &EvaluationContext) -> Result<EvaluationResult, EvaluationError>;
}

/// Wraps a closure.
pub struct FnEvaluator<F> {
    f: F,
}

impl<F> FnEvaluator<F>
where
    F: Fn(&EvaluationContext) -> Result<EvaluationResult, EvaluationError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Evaluate for FnEvaluator<F>
where
    F: Fn(&EvaluationContext) -> Result<EvaluationResult, EvaluationError> + Send + Sync,
{
    fn evaluate(&self, ctx: &EvaluationContext) -> Result<EvaluationResult, EvaluationError> {
        (self.f)(ctx)
    }
}

/// Emits one run request per schedule boundary, keyed
/// `"{name}:{scheduled_for}"`.
#[derive(Debug, Clone, Default)]
pub struct StaticScheduleEvaluator {
    pub run_config: serde_json::Value,
    pub tags: BTreeMap<String, String>,
}

impl StaticScheduleEvaluator {
    pub fn new(run_config: serde_json::Value, tags: BTreeMap<String, String>) -> Self {
        Self { run_config, tags }
    }
}

impl Evaluate for StaticScheduleEvaluator {
    fn evaluate(&self, ctx: &EvaluationContext) -> Result<EvaluationResult, EvaluationError> {
        let Some(scheduled_for) = ctx.scheduled_for else {
            return Err(EvaluationError::malformed(
                "static schedule evaluator called without a scheduled time",
            ));
        };
        let stamp = format_scheduled_for(scheduled_for);
        let mut tags = self.tags.clone();
        tags.insert("instigate/schedule_name".into(), ctx.instigator.name.clone());
        tags.insert("instigate/scheduled_for".into(), stamp.clone());
        Ok(EvaluationResult::requests(vec![RunRequest {
            run_key: Some(format!("{}:{}", ctx.instigator.name, stamp)),
            run_config: self.run_config.clone(),
            tags,
            job_name: None,
        }]))
    }
}
