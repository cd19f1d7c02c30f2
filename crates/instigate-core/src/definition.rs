use crate::error::{InstigateError, Result};
use crate::evaluation::Evaluate;
use crate::paths::validate_name;
use crate::schedule::{Recurrence, MAX_CATCHUP_TICKS};
use crate::state::InstigatorStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// InstigatorId
// ---------------------------------------------------------------------------

/// Identity of a schedule or sensor: `location/repository/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstigatorId {
    pub location: String,
    pub repository: String,
    pub name: String,
}

impl InstigatorId {
    pub fn new(
        location: impl Into<String>,
        repository: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self> {
        let id = Self {
            location: location.into(),
            repository: repository.into(),
            name: name.into(),
        };
        validate_name(&id.location)?;
        validate_name(&id.repository)?;
        validate_name(&id.name)?;
        Ok(id)
    }

    /// Storage key, identical to the display form.
    pub fn key(&self) -> String {
        self.to_string()
    }

    pub fn parse(key: &str) -> Result<Self> {
        let mut parts = key.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(l), Some(r), Some(n)) => Self::new(l, r, n),
            _ => Err(InstigateError::InvalidName(key.to_string())),
        }
    }
}

impl fmt::Display for InstigatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.location, self.repository, self.name)
    }
}

// ---------------------------------------------------------------------------
// InstigatorKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstigatorType {
    Schedule,
    Sensor,
}

impl InstigatorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstigatorType::Schedule => "schedule",
            InstigatorType::Sensor => "sensor",
        }
    }
}

impl fmt::Display for InstigatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub cron: String,
    pub timezone: String,
    pub max_catchup_ticks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSpec {
    pub minimum_interval_seconds: u64,
}

impl SensorSpec {
    pub fn minimum_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.minimum_interval_seconds as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstigatorKind {
    Schedule(ScheduleSpec),
    Sensor(SensorSpec),
}

impl InstigatorKind {
    pub fn instigator_type(&self) -> InstigatorType {
        match self {
            InstigatorKind::Schedule(_) => InstigatorType::Schedule,
            InstigatorKind::Sensor(_) => InstigatorType::Sensor,
        }
    }
}

/// What happens to a returned cursor when the tick ends SKIPPED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipCursorPolicy {
    Retain,
    Advance,
}

impl SkipCursorPolicy {
    pub fn default_for(kind: InstigatorType) -> Self {
        match kind {
            InstigatorType::Schedule => SkipCursorPolicy::Advance,
            InstigatorType::Sensor => SkipCursorPolicy::Retain,
        }
    }
}

// ---------------------------------------------------------------------------
// InstigatorDefinition
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct InstigatorDefinition {
    pub id: InstigatorId,
    pub kind: InstigatorKind,
    pub job_name: String,
    pub default_status: InstigatorStatus,
    pub skip_cursor_policy: SkipCursorPolicy,
    pub evaluator: Arc<dyn Evaluate>,
}

impl InstigatorDefinition {
    /// Build a definition, checking names and (for schedules) the recurrence.
    pub fn new(
        id: InstigatorId,
        kind: InstigatorKind,
        job_name: impl Into<String>,
        evaluator: Arc<dyn Evaluate>,
    ) -> Result<Self> {
        let job_name = job_name.into();
        validate_name(&job_name)?;
        if let InstigatorKind::Schedule(spec) = &kind {
            Recurrence::parse(&spec.cron, &spec.timezone)?;
            if !(1..=MAX_CATCHUP_TICKS).contains(&spec.max_catchup_ticks) {
                return Err(InstigateError::InvalidDefinition(format!(
                    "{id}: max_catchup_ticks must be between 1 and {MAX_CATCHUP_TICKS}"
                )));
            }
        }
        let skip_cursor_policy = SkipCursorPolicy::default_for(kind.instigator_type());
        Ok(Self {
            id,
            kind,
            job_name,
            default_status: InstigatorStatus::Stopped,
            skip_cursor_policy,
            evaluator,
        })
    }

    pub fn with_default_status(mut self, status: InstigatorStatus) -> Self {
        self.default_status = status;
        self
    }

    pub fn with_skip_cursor_policy(mut self, policy: SkipCursorPolicy) -> Self {
        self.skip_cursor_policy = policy;
        self
    }

    pub fn instigator_type(&self) -> InstigatorType {
        self.kind.instigator_type()
    }

    /// Parsed recurrence for schedules, `None` for sensors.
    pub fn recurrence(&self) -> Result<Option<Recurrence>> {
        match &self.kind {
            InstigatorKind::Schedule(spec) => {
                Recurrence::parse(&spec.cron, &spec.timezone).map(Some)
            }
            InstigatorKind::Sensor(_) => Ok(None),
        }
    }
}

impl fmt::Debug for InstigatorDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstigatorDefinition")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("job_name", &self.job_name)
            .field("default_status", &self.default_status)
            .field("skip_cursor_policy", &self.skip_cursor_policy)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// JobDefinition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    #[serde(default)]
    pub default_run_config: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
