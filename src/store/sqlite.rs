//! SQLite-backed Allocation Store
//! Optimized for multi-year counselling logs (millions of rank×round rows)
//!
//! Key optimizations:
//! - WAL mode for concurrent reads during imports
//! - Prepared statement caching
//! - Batch inserts in a single transaction
//! - Covering indexes for the partition/round/rank and seat access paths
//! - Blocking SQLite calls moved off the async runtime with `spawn_blocking`
//! - Rank IN-lists chunked below SQLite's bound-parameter limit

use super::{sort_records, AllocationFilter, AllocationStore, SeatAggregate};
use crate::error::StoreError;
use crate::models::{AllocationRecord, RawAllocationRow, RecordKey, SeatKey, VerificationStatus};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, InterruptHandle, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Ranks per IN-list chunk.
const RANK_CHUNK: usize = 500;

/// Rows per transaction during JSON-lines import.
const IMPORT_BATCH: usize = 1_000;

const SCHEMA_SQL: &str = r#"
-- Enable WAL mode for better concurrent access
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;  -- 64MB cache
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS allocations (
    record_id TEXT PRIMARY KEY,
    rank INTEGER NOT NULL,
    year INTEGER NOT NULL,
    category TEXT NOT NULL,
    quota TEXT NOT NULL,
    round INTEGER NOT NULL,
    source_id TEXT NOT NULL,
    level_id TEXT NOT NULL,
    college_id TEXT,
    course_id TEXT,
    allocation_status TEXT NOT NULL,
    is_upgrade INTEGER NOT NULL DEFAULT 0,
    previous_college_id TEXT,
    previous_course_id TEXT,
    upgrade_type TEXT NOT NULL DEFAULT 'NONE',
    data_source TEXT NOT NULL,
    verification_status TEXT NOT NULL DEFAULT 'UNVERIFIED',
    college_name TEXT,
    course_name TEXT,
    state TEXT,
    imported_at TEXT NOT NULL
) WITHOUT ROWID;

-- One record per rank key and round
CREATE UNIQUE INDEX IF NOT EXISTS idx_alloc_rank_key
    ON allocations(year, source_id, level_id, category, quota, rank, round);

-- Population scans: everything allotted in one round of a partition
CREATE INDEX IF NOT EXISTS idx_alloc_partition_round
    ON allocations(year, source_id, level_id, round, category, quota, rank, college_id, course_id);

-- Seat scans: occupants of one college+course
CREATE INDEX IF NOT EXISTS idx_alloc_seat
    ON allocations(year, source_id, level_id, college_id, course_id, round, rank);
"#;

const SELECT_COLUMNS: &str = "rank, year, category, quota, round, source_id, level_id, \
     college_id, course_id, allocation_status, is_upgrade, previous_college_id, \
     previous_course_id, upgrade_type, data_source, verification_status, \
     college_name, course_name, state";

/// Result of a bulk JSON-lines import.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportSummary {
    pub lines_read: usize,
    pub records_written: usize,
    pub blank_lines: usize,
}

/// Row counts for operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_records: u64,
    pub allotted_records: u64,
    pub verified_records: u64,
    /// (year, source_id, level_id, rows)
    pub partitions: Vec<(u16, String, String, u64)>,
}

pub struct SqliteAllocationStore {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Pending,
    Running,
    Done,
    Cancelled,
}

/// Held by the awaiting side of one blocking call. Dropping it before the call finishes
/// (a deadline firing) cancels a queued call and interrupts a running one, so the
/// connection lock is released promptly.
struct CancelOnDrop {
    state: Arc<Mutex<CallState>>,
    interrupt: Arc<InterruptHandle>,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        match *state {
            CallState::Pending => *state = CallState::Cancelled,
            // State lock is held, so the statement cannot finish and hand the
            // connection to another caller before the interrupt lands.
            CallState::Running => {
                debug!("interrupting abandoned store query");
                self.interrupt.interrupt();
            }
            CallState::Done | CallState::Cancelled => {}
        }
    }
}

impl SqliteAllocationStore {
    /// Open (or create) the database and apply the schema.
    pub fn new(db_path: &str) -> Result<Self, StoreError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags).map_err(|e| {
            StoreError::Unavailable(format!("failed to open database at {}: {}", db_path, e))
        })?;

        conn.execute_batch(SCHEMA_SQL)?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            debug!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM allocations", [], |row| row.get(0))
            .unwrap_or(0);
        info!(db_path, records = count, "allocation store opened");

        Ok(Self {
            interrupt: Arc::new(conn.get_interrupt_handle()),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let state = Arc::new(Mutex::new(CallState::Pending));
        let _cancel = CancelOnDrop {
            state: Arc::clone(&state),
            interrupt: Arc::clone(&self.interrupt),
        };
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            {
                let mut state = state.lock();
                if *state == CallState::Cancelled {
                    return Err(StoreError::Unavailable("query abandoned before start".into()));
                }
                *state = CallState::Running;
            }
            let result = f(&guard);
            *state.lock() = CallState::Done;
            result
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store worker failed: {}", e)))?
    }

    /// Insert or replace records in a single transaction.
    pub fn insert_batch(&self, records: &[AllocationRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        for record in records {
            record.validate()?;
        }

        let imported_at = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut written = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO allocations
                 (record_id, rank, year, category, quota, round, source_id, level_id,
                  college_id, course_id, allocation_status, is_upgrade, previous_college_id,
                  previous_course_id, upgrade_type, data_source, verification_status,
                  college_name, course_name, state, imported_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                         ?16, ?17, ?18, ?19, ?20, ?21)",
            )?;
            for r in records {
                written += stmt.execute(params![
                    record_id(&r.key()),
                    r.rank,
                    r.year,
                    r.category,
                    r.quota,
                    r.round.as_db(),
                    r.source_id,
                    r.level_id,
                    r.college_id(),
                    r.course_id(),
                    r.allocation_status.as_str(),
                    r.is_upgrade,
                    r.previous_seat.as_ref().map(|s| s.college_id.as_str()),
                    r.previous_seat.as_ref().map(|s| s.course_id.as_str()),
                    r.upgrade_type.as_str(),
                    r.data_source,
                    r.verification_status.as_str(),
                    r.college_name,
                    r.course_name,
                    r.state,
                    imported_at,
                ])?;
            }
        }
        tx.commit()?;

        debug!("📦 Batch wrote {} allocation records", written);
        Ok(written)
    }

    /// Delete one record. Returns whether a row existed.
    pub fn delete_record(&self, key: &RecordKey) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM allocations WHERE record_id = ?1",
            params![record_id(key)],
        )?;
        Ok(deleted > 0)
    }

    /// Mark a record verified/disputed. Returns whether a row existed.
    pub fn set_verification_status(
        &self,
        key: &RecordKey,
        status: VerificationStatus,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE allocations SET verification_status = ?1 WHERE record_id = ?2",
            params![status.as_str(), record_id(key)],
        )?;
        Ok(updated > 0)
    }

    /// Bulk import: one JSON object per line. A malformed line aborts the import of its
    /// batch and reports the line number; earlier batches stay committed.
    pub fn import_json_lines(&self, path: impl AsRef<Path>) -> Result<ImportSummary, StoreError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            StoreError::Unavailable(format!("cannot open {}: {}", path.display(), e))
        })?;
        let reader = BufReader::new(file);

        let started = Instant::now();
        let mut summary = ImportSummary::default();
        let mut batch: Vec<AllocationRecord> = Vec::with_capacity(IMPORT_BATCH);

        for (idx, line) in reader.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.map_err(|e| StoreError::Unavailable(e.to_string()))?;
            summary.lines_read += 1;
            if line.trim().is_empty() {
                summary.blank_lines += 1;
                continue;
            }

            let raw: RawAllocationRow =
                serde_json::from_str(&line).map_err(|e| StoreError::MalformedRow {
                    field: format!("line {}", line_no),
                    reason: e.to_string(),
                })?;
            let record = raw.validate().map_err(|e| match e {
                StoreError::MalformedRow { field, reason } => StoreError::MalformedRow {
                    field: format!("line {}: {}", line_no, field),
                    reason,
                },
                other => other,
            })?;
            batch.push(record);

            if batch.len() >= IMPORT_BATCH {
                summary.records_written += self.insert_batch(&batch)?;
                batch.clear();
            }
        }
        summary.records_written += self.insert_batch(&batch)?;

        info!(
            path = %path.display(),
            records = summary.records_written,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "allocation import finished"
        );
        Ok(summary)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn.lock();

        let total_records: i64 =
            conn.query_row("SELECT COUNT(*) FROM allocations", [], |row| row.get(0))?;
        let allotted_records: i64 = conn.query_row(
            "SELECT COUNT(*) FROM allocations WHERE college_id IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        let verified_records: i64 = conn.query_row(
            "SELECT COUNT(*) FROM allocations WHERE verification_status = 'VERIFIED'",
            [],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT year, source_id, level_id, COUNT(*)
             FROM allocations
             GROUP BY year, source_id, level_id
             ORDER BY year DESC, source_id, level_id",
        )?;
        let partitions = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, u16>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)? as u64,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(StoreStats {
            total_records: total_records as u64,
            allotted_records: allotted_records as u64,
            verified_records: verified_records as u64,
            partitions,
        })
    }

    pub fn len(&self) -> usize {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM allocations", [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap_or(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn row_to_raw(row: &rusqlite::Row) -> rusqlite::Result<RawAllocationRow> {
        let round: i64 = row.get(4)?;
        Ok(RawAllocationRow {
            rank: row.get(0)?,
            year: row.get(1)?,
            category: row.get(2)?,
            quota: row.get(3)?,
            round: round.to_string(),
            source_id: row.get(5)?,
            level_id: row.get(6)?,
            college_id: row.get(7)?,
            course_id: row.get(8)?,
            allocation_status: row.get(9)?,
            is_upgrade: row.get(10)?,
            previous_college_id: row.get(11)?,
            previous_course_id: row.get(12)?,
            upgrade_type: row.get(13)?,
            data_source: row.get(14)?,
            verification_status: row.get(15)?,
            college_name: row.get(16)?,
            course_name: row.get(17)?,
            state: row.get(18)?,
        })
    }
}

fn record_id(key: &RecordKey) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.canonical().as_bytes()).to_string()
}

/// WHERE clause for every predicate except the rank IN-list.
fn base_clause(filter: &AllocationFilter) -> (String, Vec<Value>) {
    let mut clauses: Vec<&'static str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(year) = filter.year {
        clauses.push("year = ?");
        values.push(Value::Integer(year as i64));
    }
    let text_eq: [(&'static str, &Option<String>); 6] = [
        ("source_id = ?", &filter.source_id),
        ("level_id = ?", &filter.level_id),
        ("category = ?", &filter.category),
        ("quota = ?", &filter.quota),
        ("college_id = ?", &filter.college_id),
        ("course_id = ?", &filter.course_id),
    ];
    for (clause, value) in text_eq {
        if let Some(v) = value {
            clauses.push(clause);
            values.push(Value::Text(v.clone()));
        }
    }
    if let Some(round) = filter.round {
        clauses.push("round = ?");
        values.push(Value::Integer(round.as_db()));
    }
    if let Some(rank) = filter.rank {
        clauses.push("rank = ?");
        values.push(Value::Integer(rank as i64));
    }
    if let Some((lo, hi)) = filter.rank_range {
        clauses.push("rank BETWEEN ? AND ?");
        values.push(Value::Integer(lo as i64));
        values.push(Value::Integer(hi as i64));
    }
    if filter.allotted_only {
        clauses.push("college_id IS NOT NULL AND course_id IS NOT NULL");
    }

    let sql = if clauses.is_empty() {
        "1 = 1".to_string()
    } else {
        clauses.join(" AND ")
    };
    (sql, values)
}

/// Expand the filter into one (where, params) pair per rank chunk.
fn chunked_clauses(filter: &AllocationFilter) -> Vec<(String, Vec<Value>)> {
    let (base_sql, base_values) = base_clause(filter);
    match &filter.ranks {
        None => vec![(base_sql, base_values)],
        Some(ranks) => ranks
            .chunks(RANK_CHUNK)
            .map(|chunk| {
                let placeholders = std::iter::repeat("?")
                    .take(chunk.len())
                    .collect::<Vec<_>>()
                    .join(",");
                let sql = format!("{} AND rank IN ({})", base_sql, placeholders);
                let mut values = base_values.clone();
                values.extend(chunk.iter().map(|&r| Value::Integer(r as i64)));
                (sql, values)
            })
            .collect(),
    }
}

fn select_blocking(
    conn: &Connection,
    filter: &AllocationFilter,
) -> Result<Vec<AllocationRecord>, StoreError> {
    let mut out = Vec::new();
    for (where_sql, values) in chunked_clauses(filter) {
        let sql = format!(
            "SELECT {} FROM allocations WHERE {} ORDER BY rank, category, quota, round",
            SELECT_COLUMNS, where_sql
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(params_from_iter(values.iter()))?;
        while let Some(row) = rows.next()? {
            let raw = SqliteAllocationStore::row_to_raw(row)?;
            out.push(raw.validate()?);
        }
    }
    if filter.ranks.as_ref().is_some_and(|r| r.len() > RANK_CHUNK) {
        sort_records(&mut out);
    }
    Ok(out)
}

fn aggregate_blocking(
    conn: &Connection,
    filter: &AllocationFilter,
) -> Result<Vec<SeatAggregate>, StoreError> {
    let mut groups: BTreeMap<SeatKey, SeatAggregate> = BTreeMap::new();
    for (where_sql, values) in chunked_clauses(filter) {
        let sql = format!(
            "SELECT college_id, course_id, COUNT(*), MIN(rank), MAX(rank)
             FROM allocations
             WHERE {} AND college_id IS NOT NULL AND course_id IS NOT NULL
             GROUP BY college_id, course_id",
            where_sql
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
            Ok((
                SeatKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                row.get::<_, i64>(2)? as u64,
                row.get::<_, u32>(3)?,
                row.get::<_, u32>(4)?,
            ))
        })?;
        for row in rows {
            let (seat, count, min_rank, max_rank) = row?;
            groups
                .entry(seat.clone())
                .and_modify(|agg| {
                    agg.student_count += count;
                    agg.min_rank = agg.min_rank.min(min_rank);
                    agg.max_rank = agg.max_rank.max(max_rank);
                })
                .or_insert(SeatAggregate {
                    seat,
                    student_count: count,
                    min_rank,
                    max_rank,
                });
        }
    }
    Ok(groups.into_values().collect())
}

#[async_trait]
impl AllocationStore for SqliteAllocationStore {
    async fn select_allocations(
        &self,
        filter: &AllocationFilter,
    ) -> Result<Vec<AllocationRecord>, StoreError> {
        if filter.ranks.as_ref().is_some_and(|r| r.is_empty()) {
            return Ok(Vec::new());
        }
        let filter = filter.clone();
        let started = Instant::now();
        let rows = self
            .with_conn(move |conn| select_blocking(conn, &filter))
            .await?;
        debug!(
            rows = rows.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "select_allocations"
        );
        Ok(rows)
    }

    async fn aggregate_seats(
        &self,
        filter: &AllocationFilter,
    ) -> Result<Vec<SeatAggregate>, StoreError> {
        if filter.ranks.as_ref().is_some_and(|r| r.is_empty()) {
            return Ok(Vec::new());
        }
        let filter = filter.clone();
        let started = Instant::now();
        let groups = self
            .with_conn(move |conn| aggregate_blocking(conn, &filter))
            .await?;
        debug!(
            groups = groups.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "aggregate_seats"
        );
        Ok(groups)
    }
}

impl std::fmt::Debug for SqliteAllocationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteAllocationStore").finish_non_exhaustive()
    }
}
