use super::{truncate, InstigatorStorage, TickOpen};
use crate::dedup::{DedupDecision, RunKeyRecord};
use crate::definition::InstigatorId;
use crate::error::{InstigateError, Result};
use crate::state::{InstigatorState, InstigatorStatus};
use crate::tick::{Tick, TickClose, TickError, TickStatus};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    states: BTreeMap<InstigatorId, InstigatorState>,
    ticks: BTreeMap<InstigatorId, Vec<Tick>>,
    run_keys: HashMap<(InstigatorId, String), RunKeyRecord>,
    unavailable: bool,
}

impl Inner {
    fn started(&self, id: &InstigatorId) -> Option<&Tick> {
        self.ticks
            .get(id)
            .and_then(|ts| ts.iter().find(|t| t.status == TickStatus::Started))
    }

    fn tick_mut(&mut self, id: &InstigatorId, sequence: u64) -> Result<&mut Tick> {
        self.ticks
            .get_mut(id)
            .and_then(|ts| ts.iter_mut().find(|t| t.sequence == sequence))
            .ok_or_else(|| InstigateError::TickNotFound(format!("{id}#{sequence}")))
    }
}

/// Process-local storage for tests and embedders. `set_unavailable` makes
/// every call fail, simulating an unreachable store.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        match self.inner.lock() {
            Ok(mut inner) => inner.unavailable = unavailable,
            Err(poisoned) => poisoned.into_inner().unavailable = unavailable,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| InstigateError::Storage("memory storage lock poisoned".to_string()))?;
        if inner.unavailable {
            return Err(InstigateError::Storage("storage unavailable".to_string()));
        }
        Ok(inner)
    }
}

impl InstigatorStorage for MemoryStorage {
    fn ensure_state(
        &self,
        id: &InstigatorId,
        default_status: InstigatorStatus,
        now: DateTime<Utc>,
    ) -> Result<InstigatorState> {
        let mut inner = self.lock()?;
        let state = inner
            .states
            .entry(id.clone())
            .or_insert_with(|| InstigatorState::new(id.clone(), default_status, truncate(now)));
        Ok(state.clone())
    }

    fn get_state(&self, id: &InstigatorId) -> Result<Option<InstigatorState>> {
        Ok(self.lock()?.states.get(id).cloned())
    }

    fn all_states(&self) -> Result<Vec<InstigatorState>> {
        Ok(self.lock()?.states.values().cloned().collect())
    }

    fn set_status(
        &self,
        id: &InstigatorId,
        status: InstigatorStatus,
        now: DateTime<Utc>,
    ) -> Result<InstigatorState> {
        let mut inner = self.lock()?;
        let state = inner
            .states
            .get_mut(id)
            .ok_or_else(|| InstigateError::NotFound(id.key()))?;
        if state.status != status {
            state.status = status;
            state.status_changed_at = truncate(now);
        }
        Ok(state.clone())
    }

    fn set_cursor(&self, id: &InstigatorId, cursor: Option<&str>) -> Result<InstigatorState> {
        let mut inner = self.lock()?;
        if !inner.states.contains_key(id) {
            return Err(InstigateError::NotFound(id.key()));
        }
        if inner.started(id).is_some() {
            return Err(InstigateError::TickInProgress(id.key()));
        }
        let state = inner
            .states
            .get_mut(id)
            .ok_or_else(|| InstigateError::NotFound(id.key()))?;
        state.cursor = cursor.map(str::to_string);
        Ok(state.clone())
    }

    fn remove_state(&self, id: &InstigatorId) -> Result<bool> {
        Ok(self.lock()?.states.remove(id).is_some())
    }

    fn open_tick(
        &self,
        id: &InstigatorId,
        started_at: DateTime<Utc>,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<TickOpen> {
        let mut inner = self.lock()?;
        let cursor = inner
            .states
            .get(id)
            .ok_or_else(|| InstigateError::NotFound(id.key()))?
            .cursor
            .clone();
        if let Some(running) = inner.started(id) {
            return Ok(TickOpen::AlreadyStarted(running.clone()));
        }
        let ticks = inner.ticks.entry(id.clone()).or_default();
        let sequence = ticks.last().map_or(1, |t| t.sequence + 1);
        let tick = Tick::started(
            id.clone(),
            sequence,
            truncate(started_at),
            scheduled_for.map(truncate),
            cursor,
        );
        ticks.push(tick.clone());
        Ok(TickOpen::Opened(tick))
    }

    fn add_tick_run(&self, id: &InstigatorId, sequence: u64, run_id: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let tick = inner.tick_mut(id, sequence)?;
        if tick.status != TickStatus::Started {
            return Err(InstigateError::TickNotStarted(tick.label()));
        }
        tick.run_ids.push(run_id.to_string());
        Ok(())
    }

    fn close_tick(&self, id: &InstigatorId, sequence: u64, close: &TickClose) -> Result<Tick> {
        let mut inner = self.lock()?;
        {
            let tick = inner.tick_mut(id, sequence)?;
            if tick.status != TickStatus::Started {
                return Err(InstigateError::TickNotStarted(tick.label()));
            }
        }
        close.validate()?;
        let close = TickClose {
            ended_at: truncate(close.ended_at),
            ..close.clone()
        };

        let state_cursor = inner.states.get(id).map(|s| s.cursor.clone());
        let previous = match state_cursor {
            Some(cursor) => cursor,
            None => inner.tick_mut(id, sequence)?.cursor.clone(),
        };
        let committed = close.cursor.resolve(previous);

        let tick = inner.tick_mut(id, sequence)?;
        tick.apply_close(&close, committed.clone());
        let closed = tick.clone();

        if let Some(state) = inner.states.get_mut(id) {
            state.cursor = committed;
            state.last_evaluated_at = Some(closed.started_at);
        }
        Ok(closed)
    }

    fn get_tick(&self, id: &InstigatorId, sequence: u64) -> Result<Option<Tick>> {
        let inner = self.lock()?;
        Ok(inner
            .ticks
            .get(id)
            .and_then(|ts| ts.iter().find(|t| t.sequence == sequence))
            .cloned())
    }

    fn ticks(&self, id: &InstigatorId, limit: usize) -> Result<Vec<Tick>> {
        let inner = self.lock()?;
        Ok(inner
            .ticks
            .get(id)
            .map(|ts| ts.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn started_ticks(&self) -> Result<Vec<Tick>> {
        let inner = self.lock()?;
        Ok(inner
            .ticks
            .values()
            .flat_map(|ts| ts.iter().filter(|t| t.status == TickStatus::Started))
            .cloned()
            .collect())
    }

    fn fail_stale_ticks(
        &self,
        older_than: DateTime<Utc>,
        error: &TickError,
        now: DateTime<Utc>,
    ) -> Result<Vec<Tick>> {
        let mut inner = self.lock()?;
        let close = TickClose::failure(truncate(now), error.clone());
        let Inner { states, ticks, .. } = &mut *inner;
        let mut recovered = Vec::new();
        for (id, list) in ticks.iter_mut() {
            for tick in list
                .iter_mut()
                .filter(|t| t.status == TickStatus::Started && t.started_at < older_than)
            {
                let cursor = states
                    .get(id)
                    .map_or_else(|| tick.cursor.clone(), |s| s.cursor.clone());
                tick.apply_close(&close, cursor);
                recovered.push(tick.clone());
            }
        }
        Ok(recovered)
    }

    fn accept_run_key(
        &self,
        id: &InstigatorId,
        run_key: &str,
        tick_sequence: u64,
        now: DateTime<Utc>,
    ) -> Result<DedupDecision> {
        let mut inner = self.lock()?;
        let key = (id.clone(), run_key.to_string());
        if let Some(existing) = inner.run_keys.get(&key) {
            return Ok(DedupDecision::Duplicate {
                first_tick: existing.tick_sequence,
                accepted_at: existing.accepted_at,
            });
        }
        inner.run_keys.insert(
            key,
            RunKeyRecord {
                instigator: id.clone(),
                run_key: run_key.to_string(),
                tick_sequence,
                accepted_at: truncate(now),
            },
        );
        if let Ok(tick) = inner.tick_mut(id, tick_sequence) {
            if tick.status == TickStatus::Started {
                tick.run_keys.push(run_key.to_string());
            }
        }
        Ok(DedupDecision::Accepted)
    }

    fn run_key_record(&self, id: &InstigatorId, run_key: &str) -> Result<Option<RunKeyRecord>> {
        let inner = self.lock()?;
        Ok(inner
            .run_keys
            .get(&(id.clone(), run_key.to_string()))
            .cloned())
    }
}
