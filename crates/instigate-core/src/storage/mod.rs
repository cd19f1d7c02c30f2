//! Persistence of instigator state, ticks and accepted run keys.
//!
//! Every operation is atomic. `open_tick` is the mutual-exclusion boundary:
//! it checks for a STARTED tick and creates the next one in one step, so two
//! coordinators sharing a store can never both evaluate the same instigator.

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::dedup::{DedupDecision, RunKeyRecord};
use crate::definition::InstigatorId;
use crate::error::Result;
use crate::state::{InstigatorState, InstigatorStatus};
use crate::tick::{Tick, TickClose, TickError};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};

#[derive(Debug, Clone, PartialEq)]
pub enum TickOpen {
    Opened(Tick),
    /// Another evaluation holds the instigator; carries its tick.
    AlreadyStarted(Tick),
}

pub trait InstigatorStorage: Send + Sync {
    /// Create the state row with `default_status` if it does not exist.
    fn ensure_state(
        &self,
        id: &InstigatorId,
        default_status: InstigatorStatus,
        now: DateTime<Utc>,
    ) -> Result<InstigatorState>;

    fn get_state(&self, id: &InstigatorId) -> Result<Option<InstigatorState>>;

    fn all_states(&self) -> Result<Vec<InstigatorState>>;

    /// Change the status; `status_changed_at` only moves on a real change.
    fn set_status(
        &self,
        id: &InstigatorId,
        status: InstigatorStatus,
        now: DateTime<Utc>,
    ) -> Result<InstigatorState>;

    /// Operator override of the cursor. Refused with `TickInProgress` while a
    /// tick is STARTED.
    fn set_cursor(&self, id: &InstigatorId, cursor: Option<&str>) -> Result<InstigatorState>;

    /// Delete the state row. Tick history and run keys stay.
    fn remove_state(&self, id: &InstigatorId) -> Result<bool>;

    fn open_tick(
        &self,
        id: &InstigatorId,
        started_at: DateTime<Utc>,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<TickOpen>;

    fn add_tick_run(&self, id: &InstigatorId, sequence: u64, run_id: &str) -> Result<()>;

    /// Move a STARTED tick to a terminal status and commit the cursor in the
    /// same transaction.
    fn close_tick(&self, id: &InstigatorId, sequence: u64, close: &TickClose) -> Result<Tick>;

    fn get_tick(&self, id: &InstigatorId, sequence: u64) -> Result<Option<Tick>>;

    /// Newest first.
    fn ticks(&self, id: &InstigatorId, limit: usize) -> Result<Vec<Tick>>;

    fn started_ticks(&self) -> Result<Vec<Tick>>;

    /// Fail every STARTED tick that began before `older_than`. Cursors are
    /// left alone. Returns the ticks it closed.
    fn fail_stale_ticks(
        &self,
        older_than: DateTime<Utc>,
        error: &TickError,
        now: DateTime<Utc>,
    ) -> Result<Vec<Tick>>;

    /// Record `run_key` unless already present. Accepted keys are also
    /// appended to the tick's `run_keys`.
    fn accept_run_key(
        &self,
        id: &InstigatorId,
        run_key: &str,
        tick_sequence: u64,
        now: DateTime<Utc>,
    ) -> Result<DedupDecision>;

    fn run_key_record(&self, id: &InstigatorId, run_key: &str) -> Result<Option<RunKeyRecord>>;
}

/// Stored timestamps carry millisecond precision.
pub(crate) fn truncate(t: DateTime<Utc>) -> DateTime<Utc> {
    t.trunc_subsecs(3)
}

pub(crate) fn format_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| crate::InstigateError::Storage(format!("bad timestamp '{s}': {e}")))
}

// ---------------------------------------------------------------------------
// Shared behaviour tests, run against every implementation
// ---------------------------------------------------------------------------


/// Generates one `#[test]` per conformance check for a storage factory.
#[cfg(test)]
macro_rules! storage_conformance_tests {
    ($factory:expr) => {
        #[test]
        fn ensure_state_is_idempotent() {
            let (_guard, s) = $factory;
            crate::storage::conformance::ensure_state_is_idempotent(&*s);
        }

        #[test]
        fn status_changes_stamp_time() {
            let (_guard, s) = $factory;
            crate::storage::conformance::status_changes_stamp_time(&*s);
        }

        #[test]
        fn sequences_increase_and_one_started() {
            let (_guard, s) = $factory;
            crate::storage::conformance::sequences_increase_and_one_started(&*s);
        }

        #[test]
        fn open_tick_requires_state() {
            let (_guard, s) = $factory;
            crate::storage::conformance::open_tick_requires_state(&*s);
        }

        #[test]
        fn close_commits_cursor() {
            let (_guard, s) = $factory;
            crate::storage::conformance::close_commits_cursor(&*s);
        }

        #[test]
        fn failure_keeps_previous_cursor() {
            let (_guard, s) = $factory;
            crate::storage::conformance::failure_keeps_previous_cursor(&*s);
        }

        #[test]
        fn terminal_ticks_are_immutable() {
            let (_guard, s) = $factory;
            crate::storage::conformance::terminal_ticks_are_immutable(&*s);
        }

        #[test]
        fn set_cursor_refused_while_started() {
            let (_guard, s) = $factory;
            crate::storage::conformance::set_cursor_refused_while_started(&*s);
        }

        #[test]
        fn tick_records_runs_and_keys() {
            let (_guard, s) = $factory;
            crate::storage::conformance::tick_records_runs_and_keys(&*s);
        }

        #[test]
        fn ticks_newest_first_with_limit() {
            let (_guard, s) = $factory;
            crate::storage::conformance::ticks_newest_first_with_limit(&*s);
        }

        #[test]
        fn stale_ticks_fail_once() {
            let (_guard, s) = $factory;
            crate::storage::conformance::stale_ticks_fail_once(&*s);
        }

        #[test]
        fn remove_state_keeps_history() {
            let (_guard, s) = $factory;
            crate::storage::conformance::remove_state_keeps_history(&*s);
        }

        #[test]
        fn concurrent_open_yields_one_tick() {
            let (_guard, s) = $factory;
            crate::storage::conformance::concurrent_open_yields_one_tick(s);
        }
    };
}

#[cfg(test)]
pub(crate) use storage_conformance_tests;
