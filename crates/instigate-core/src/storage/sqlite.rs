use super::{format_ts, parse_ts, truncate, InstigatorStorage, TickOpen};
use crate::dedup::{DedupDecision, RunKeyRecord};
use crate::definition::InstigatorId;
use crate::error::{InstigateError, Result};
use crate::state::{InstigatorState, InstigatorStatus};
use crate::tick::{Tick, TickClose, TickError, TickStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS instigator_state (
    id                TEXT PRIMARY KEY,
    location          TEXT NOT NULL,
    repository        TEXT NOT NULL,
    name              TEXT NOT NULL,
    status            TEXT NOT NULL,
    cursor            TEXT,
    last_evaluated_at TEXT,
    status_changed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ticks (
    id            TEXT NOT NULL,
    sequence      INTEGER NOT NULL,
    status        TEXT NOT NULL,
    started_at    TEXT NOT NULL,
    ended_at      TEXT,
    scheduled_for TEXT,
    run_keys      TEXT NOT NULL DEFAULT '[]',
    run_ids       TEXT NOT NULL DEFAULT '[]',
    skip_reason   TEXT,
    error         TEXT,
    cursor        TEXT,
    PRIMARY KEY (id, sequence)
);

CREATE UNIQUE INDEX IF NOT EXISTS ticks_one_started
    ON ticks (id) WHERE status = 'STARTED';

CREATE TABLE IF NOT EXISTS run_keys (
    id            TEXT NOT NULL,
    run_key       TEXT NOT NULL,
    tick_sequence INTEGER NOT NULL,
    accepted_at   TEXT NOT NULL,
    PRIMARY KEY (id, run_key)
);
";

const TICK_COLUMNS: &str = "id, sequence, status, started_at, ended_at, scheduled_for, \
                            run_keys, run_ids, skip_reason, error, cursor";

const STATE_COLUMNS: &str = "id, status, cursor, last_evaluated_at, status_changed_at";

/// SQLite-backed storage. Several processes may open the same file; WAL mode
/// and immediate transactions serialize writers.
pub struct SqliteStorage {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::io::ensure_dir(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = %path.display(), "opened instigator storage");
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| InstigateError::Storage("sqlite connection lock poisoned".to_string()))
    }

    /// Run `f` inside an IMMEDIATE transaction and commit on success.
    fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

struct StateRow {
    id: String,
    status: String,
    cursor: Option<String>,
    last_evaluated_at: Option<String>,
    status_changed_at: String,
}

impl StateRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            cursor: row.get(2)?,
            last_evaluated_at: row.get(3)?,
            status_changed_at: row.get(4)?,
        })
    }

    fn into_state(self) -> Result<InstigatorState> {
        Ok(InstigatorState {
            id: InstigatorId::parse(&self.id)?,
            status: self.status.parse()?,
            cursor: self.cursor,
            last_evaluated_at: self.last_evaluated_at.as_deref().map(parse_ts).transpose()?,
            status_changed_at: parse_ts(&self.status_changed_at)?,
        })
    }
}

struct TickRow {
    id: String,
    sequence: i64,
    status: String,
    started_at: String,
    ended_at: Option<String>,
    scheduled_for: Option<String>,
    run_keys: String,
    run_ids: String,
    skip_reason: Option<String>,
    error: Option<String>,
    cursor: Option<String>,
}

impl TickRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            sequence: row.get(1)?,
            status: row.get(2)?,
            started_at: row.get(3)?,
            ended_at: row.get(4)?,
            scheduled_for: row.get(5)?,
            run_keys: row.get(6)?,
            run_ids: row.get(7)?,
            skip_reason: row.get(8)?,
            error: row.get(9)?,
            cursor: row.get(10)?,
        })
    }

    fn into_tick(self) -> Result<Tick> {
        Ok(Tick {
            instigator: InstigatorId::parse(&self.id)?,
            sequence: self.sequence as u64,
            status: self.status.parse()?,
            started_at: parse_ts(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_ts).transpose()?,
            scheduled_for: self.scheduled_for.as_deref().map(parse_ts).transpose()?,
            run_keys: serde_json::from_str(&self.run_keys)?,
            run_ids: serde_json::from_str(&self.run_ids)?,
            skip_reason: self.skip_reason,
            error: self
                .error
                .as_deref()
                .map(serde_json::from_str::<TickError>)
                .transpose()?,
            cursor: self.cursor,
        })
    }
}

fn query_ticks(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Tick>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(args, TickRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(TickRow::into_tick).collect()
}

fn load_tick(conn: &Connection, id: &InstigatorId, sequence: u64) -> Result<Option<Tick>> {
    let sql = format!("SELECT {TICK_COLUMNS} FROM ticks WHERE id = ?1 AND sequence = ?2");
    let row = conn
        .query_row(&sql, params![id.key(), sequence as i64], TickRow::from_row)
        .optional()?;
    row.map(TickRow::into_tick).transpose()
}

fn load_started(conn: &Connection, id: &InstigatorId) -> Result<Option<Tick>> {
    let sql = format!("SELECT {TICK_COLUMNS} FROM ticks WHERE id = ?1 AND status = 'STARTED'");
    let row = conn
        .query_row(&sql, params![id.key()], TickRow::from_row)
        .optional()?;
    row.map(TickRow::into_tick).transpose()
}

fn load_state(conn: &Connection, id: &InstigatorId) -> Result<Option<InstigatorState>> {
    let sql = format!("SELECT {STATE_COLUMNS} FROM instigator_state WHERE id = ?1");
    let row = conn
        .query_row(&sql, params![id.key()], StateRow::from_row)
        .optional()?;
    row.map(StateRow::into_state).transpose()
}

fn require_state(conn: &Connection, id: &InstigatorId) -> Result<InstigatorState> {
    load_state(conn, id)?.ok_or_else(|| InstigateError::NotFound(id.key()))
}

/// Apply a terminal transition to a STARTED tick. The caller supplies the
/// cursor the tick records.
fn finish_tick(
    conn: &Connection,
    tick: &mut Tick,
    close: &TickClose,
    committed: Option<String>,
) -> Result<()> {
    let error = close.error.as_ref().map(serde_json::to_string).transpose()?;
    let changed = conn.execute(
        "UPDATE ticks SET status = ?3, ended_at = ?4, skip_reason = ?5, error = ?6, cursor = ?7
         WHERE id = ?1 AND sequence = ?2 AND status = 'STARTED'",
        params![
            tick.instigator.key(),
            tick.sequence as i64,
            close.status.as_str(),
            format_ts(close.ended_at),
            close.skip_reason,
            error,
            committed,
        ],
    )?;
    if changed != 1 {
        return Err(InstigateError::TickNotStarted(tick.label()));
    }
    tick.apply_close(close, committed);
    Ok(())
}

// ---------------------------------------------------------------------------
// InstigatorStorage
// ---------------------------------------------------------------------------

impl InstigatorStorage for SqliteStorage {
    fn ensure_state(
        &self,
        id: &InstigatorId,
        default_status: InstigatorStatus,
        now: DateTime<Utc>,
    ) -> Result<InstigatorState> {
        self.write(|tx| {
            tx.execute(
                "INSERT INTO instigator_state
                     (id, location, repository, name, status, status_changed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (id) DO NOTHING",
                params![
                    id.key(),
                    id.location,
                    id.repository,
                    id.name,
                    default_status.as_str(),
                    format_ts(now),
                ],
            )?;
            require_state(tx, id)
        })
    }

    fn get_state(&self, id: &InstigatorId) -> Result<Option<InstigatorState>> {
        let conn = self.lock()?;
        load_state(&conn, id)
    }

    fn all_states(&self) -> Result<Vec<InstigatorState>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {STATE_COLUMNS} FROM instigator_state ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], StateRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(StateRow::into_state).collect()
    }

    fn set_status(
        &self,
        id: &InstigatorId,
        status: InstigatorStatus,
        now: DateTime<Utc>,
    ) -> Result<InstigatorState> {
        self.write(|tx| {
            let state = require_state(tx, id)?;
            if state.status == status {
                return Ok(state);
            }
            tx.execute(
                "UPDATE instigator_state SET status = ?2, status_changed_at = ?3 WHERE id = ?1",
                params![id.key(), status.as_str(), format_ts(now)],
            )?;
            require_state(tx, id)
        })
    }

    fn set_cursor(&self, id: &InstigatorId, cursor: Option<&str>) -> Result<InstigatorState> {
        self.write(|tx| {
            require_state(tx, id)?;
            if load_started(tx, id)?.is_some() {
                return Err(InstigateError::TickInProgress(id.key()));
            }
            tx.execute(
                "UPDATE instigator_state SET cursor = ?2 WHERE id = ?1",
                params![id.key(), cursor],
            )?;
            require_state(tx, id)
        })
    }

    fn remove_state(&self, id: &InstigatorId) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM instigator_state WHERE id = ?1",
            params![id.key()],
        )?;
        Ok(n > 0)
    }

    fn open_tick(
        &self,
        id: &InstigatorId,
        started_at: DateTime<Utc>,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<TickOpen> {
        self.write(|tx| {
            let state = require_state(tx, id)?;
            if let Some(running) = load_started(tx, id)? {
                return Ok(TickOpen::AlreadyStarted(running));
            }
            let last: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence), 0) FROM ticks WHERE id = ?1",
                params![id.key()],
                |row| row.get(0),
            )?;
            let tick = Tick::started(
                id.clone(),
                last as u64 + 1,
                truncate(started_at),
                scheduled_for.map(truncate),
                state.cursor,
            );
            tx.execute(
                "INSERT INTO ticks (id, sequence, status, started_at, scheduled_for, cursor)
                 VALUES (?1, ?2, 'STARTED', ?3, ?4, ?5)",
                params![
                    id.key(),
                    tick.sequence as i64,
                    format_ts(tick.started_at),
                    tick.scheduled_for.map(format_ts),
                    tick.cursor,
                ],
            )?;
            Ok(TickOpen::Opened(tick))
        })
    }

    fn add_tick_run(&self, id: &InstigatorId, sequence: u64, run_id: &str) -> Result<()> {
        self.write(|tx| {
            let mut tick = load_tick(tx, id, sequence)?
                .ok_or_else(|| InstigateError::TickNotFound(format!("{id}#{sequence}")))?;
            if tick.status != TickStatus::Started {
                return Err(InstigateError::TickNotStarted(tick.label()));
            }
            tick.run_ids.push(run_id.to_string());
            tx.execute(
                "UPDATE ticks SET run_ids = ?3 WHERE id = ?1 AND sequence = ?2",
                params![id.key(), sequence as i64, serde_json::to_string(&tick.run_ids)?],
            )?;
            Ok(())
        })
    }

    fn close_tick(&self, id: &InstigatorId, sequence: u64, close: &TickClose) -> Result<Tick> {
        self.write(|tx| {
            let mut tick = load_tick(tx, id, sequence)?
                .ok_or_else(|| InstigateError::TickNotFound(format!("{id}#{sequence}")))?;
            if tick.status != TickStatus::Started {
                return Err(InstigateError::TickNotStarted(tick.label()));
            }
            close.validate()?;
            let close = TickClose {
                ended_at: truncate(close.ended_at),
                ..close.clone()
            };

            let state = load_state(tx, id)?;
            let previous = match &state {
                Some(s) => s.cursor.clone(),
                None => tick.cursor.clone(),
            };
            let committed = close.cursor.resolve(previous);
            finish_tick(tx, &mut tick, &close, committed.clone())?;

            if state.is_some() {
                tx.execute(
                    "UPDATE instigator_state SET cursor = ?2, last_evaluated_at = ?3 WHERE id = ?1",
                    params![id.key(), committed, format_ts(tick.started_at)],
                )?;
            }
            Ok(tick)
        })
    }

    fn get_tick(&self, id: &InstigatorId, sequence: u64) -> Result<Option<Tick>> {
        let conn = self.lock()?;
        load_tick(&conn, id, sequence)
    }

    fn ticks(&self, id: &InstigatorId, limit: usize) -> Result<Vec<Tick>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {TICK_COLUMNS} FROM ticks WHERE id = ?1 ORDER BY sequence DESC LIMIT ?2"
        );
        query_ticks(&conn, &sql, params![id.key(), limit as i64])
    }

    fn started_ticks(&self) -> Result<Vec<Tick>> {
        let conn = self.lock()?;
        let sql =
            format!("SELECT {TICK_COLUMNS} FROM ticks WHERE status = 'STARTED' ORDER BY id");
        query_ticks(&conn, &sql, [])
    }

    fn fail_stale_ticks(
        &self,
        older_than: DateTime<Utc>,
        error: &TickError,
        now: DateTime<Utc>,
    ) -> Result<Vec<Tick>> {
        self.write(|tx| {
            let sql =
                format!("SELECT {TICK_COLUMNS} FROM ticks WHERE status = 'STARTED' ORDER BY id");
            let close = TickClose::failure(truncate(now), error.clone());
            let mut recovered = Vec::new();
            for mut tick in query_ticks(tx, &sql, [])? {
                if tick.started_at >= older_than {
                    continue;
                }
                let cursor = match load_state(tx, &tick.instigator)? {
                    Some(state) => state.cursor,
                    None => tick.cursor.clone(),
                };
                finish_tick(tx, &mut tick, &close, cursor)?;
                recovered.push(tick);
            }
            Ok(recovered)
        })
    }

    fn accept_run_key(
        &self,
        id: &InstigatorId,
        run_key: &str,
        tick_sequence: u64,
        now: DateTime<Utc>,
    ) -> Result<DedupDecision> {
        self.write(|tx| {
            let inserted = tx.execute(
                "INSERT INTO run_keys (id, run_key, tick_sequence, accepted_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (id, run_key) DO NOTHING",
                params![id.key(), run_key, tick_sequence as i64, format_ts(now)],
            )?;
            if inserted == 0 {
                let (first_tick, accepted_at): (i64, String) = tx.query_row(
                    "SELECT tick_sequence, accepted_at FROM run_keys WHERE id = ?1 AND run_key = ?2",
                    params![id.key(), run_key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                return Ok(DedupDecision::Duplicate {
                    first_tick: first_tick as u64,
                    accepted_at: parse_ts(&accepted_at)?,
                });
            }
            if let Some(mut tick) = load_tick(tx, id, tick_sequence)? {
                if tick.status == TickStatus::Started {
                    tick.run_keys.push(run_key.to_string());
                    tx.execute(
                        "UPDATE ticks SET run_keys = ?3 WHERE id = ?1 AND sequence = ?2",
                        params![
                            id.key(),
                            tick_sequence as i64,
                            serde_json::to_string(&tick.run_keys)?
                        ],
                    )?;
                }
            }
            Ok(DedupDecision::Accepted)
        })
    }

    fn run_key_record(&self, id: &InstigatorId, run_key: &str) -> Result<Option<RunKeyRecord>> {
        let conn = self.lock()?;
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT tick_sequence, accepted_at FROM run_keys WHERE id = ?1 AND run_key = ?2",
                params![id.key(), run_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(seq, at)| {
            Ok(RunKeyRecord {
                instigator: id.clone(),
                run_key: run_key.to_string(),
                tick_sequence: seq as u64,
                accepted_at: parse_ts(&at)?,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tick::CursorUpdate;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open() -> (TempDir, Arc<dyn InstigatorStorage>) {
        let dir = TempDir::new().unwrap();
        let storage = SqliteStorage::open(&dir.path().join("storage/instigate.db")).unwrap();
        (dir, Arc::new(storage))
    }

    crate::storage::storage_conformance_tests!(open());

    #[test]
    fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("instigate.db");
        let id = InstigatorId::new("etl", "repo", "a").unwrap();
        {
            let s = SqliteStorage::open(&path).unwrap();
            s.ensure_state(&id, InstigatorStatus::Running, Utc::now()).unwrap();
            let TickOpen::Opened(t) = s.open_tick(&id, Utc::now(), None).unwrap() else {
                panic!("expected open");
            };
            s.close_tick(
                &id,
                t.sequence,
                &TickClose::success(Utc::now(), CursorUpdate::Set(Some("9".into()))),
            )
            .unwrap();
        }
        let s = SqliteStorage::open(&path).unwrap();
        assert_eq!(s.get_state(&id).unwrap().unwrap().cursor.as_deref(), Some("9"));
        assert_eq!(s.ticks(&id, 10).unwrap().len(), 1);
    }

    #[test]
    fn two_handles_share_mutual_exclusion() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("instigate.db");
        let a = SqliteStorage::open(&path).unwrap();
        let b = SqliteStorage::open(&path).unwrap();
        let id = InstigatorId::new("etl", "repo", "a").unwrap();
        a.ensure_state(&id, InstigatorStatus::Running, Utc::now()).unwrap();

        assert!(matches!(
            a.open_tick(&id, Utc::now(), None).unwrap(),
            TickOpen::Opened(_)
        ));
        assert!(matches!(
            b.open_tick(&id, Utc::now(), None).unwrap(),
            TickOpen::AlreadyStarted(_)
        ));
    }

    #[test]
    fn partial_index_rejects_second_started_row() {
        let dir = TempDir::new().unwrap();
        let s = SqliteStorage::open(&dir.path().join("raw.db")).unwrap();
        let conn = s.lock().unwrap();
        conn.execute(
            "INSERT INTO ticks (id, sequence, status, started_at) VALUES ('x', 1, 'STARTED', 't')",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO ticks (id, sequence, status, started_at) VALUES ('x', 2, 'STARTED', 't')",
            [],
        );
        assert!(dup.is_err());
        conn.execute(
            "INSERT INTO ticks (id, sequence, status, started_at) VALUES ('x', 3, 'SUCCESS', 't')",
            [],
        )
        .unwrap();
    }
}
