use crate::definition::InstigatorId;
use crate::error::Result;
use crate::storage::InstigatorStorage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Persisted proof that a run key was accepted for an instigator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunKeyRecord {
    pub instigator: InstigatorId,
    pub run_key: String,
    pub tick_sequence: u64,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupDecision {
    Accepted,
    Duplicate {
        first_tick: u64,
        accepted_at: DateTime<Utc>,
    },
}

impl DedupDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, DedupDecision::Accepted)
    }
}

/// Gatekeeper in front of the dispatch boundary: a keyed request passes at
/// most once per instigator, across restarts.
#[derive(Clone)]
pub struct RunKeyDeduplicator {
    storage: Arc<dyn InstigatorStorage>,
}

impl RunKeyDeduplicator {
    pub fn new(storage: Arc<dyn InstigatorStorage>) -> Self {
        Self { storage }
    }

    /// Record `run_key` for `tick_sequence` unless it was recorded before.
    /// Keyless requests are always accepted and leave no record.
    pub fn try_accept(
        &self,
        instigator: &InstigatorId,
        run_key: Option<&str>,
        tick_sequence: u64,
        now: DateTime<Utc>,
    ) -> Result<DedupDecision> {
        let Some(key) = run_key.filter(|k| !k.is_empty()) else {
            return Ok(DedupDecision::Accepted);
        };
        let decision = self
            .storage
            .accept_run_key(instigator, key, tick_sequence, now)?;
        if let DedupDecision::Duplicate { first_tick, .. } = &decision {
            tracing::info!(
                instigator = %instigator,
                tick = tick_sequence,
                run_key = key,
                first_tick,
                "skipping run request with previously accepted run key"
            );
        }
        Ok(decision)
    }
}
