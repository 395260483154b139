//! Store gateway: narrow read/write interface to the message store
//!
//! SQLite implementation with rusqlite plus the schema migration loader.
//!
//! Session policy: every task cycle calls `open_session()` and works on a
//! fresh connection, dropped at the end of the cycle. Long-lived cursors
//! were observed to return stale results, so no connection is reused
//! across cycles.

use super::error::StoreError;
use super::types::{
    from_millis, to_millis, BioSnapshot, HistoryRow, RawRecord, ScoreRecord, WriteAck,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OpenFlags};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// Opens one store session per task cycle
#[async_trait]
pub trait StoreGateway: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn StoreSession>, StoreError>;
}

/// Operations available within one task cycle
#[async_trait]
pub trait StoreSession: Send {
    /// Messages with an unset score written in `[now - lookback, now)`, oldest first
    async fn fetch_pending(
        &mut self,
        now: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<Vec<RawRecord>, StoreError>;

    /// Latest bio snapshot per patient captured in `[now - lookback_days, now]`
    async fn fetch_bio_snapshots(
        &mut self,
        now: DateTime<Utc>,
        lookback_days: u32,
    ) -> Result<HashMap<String, BioSnapshot>, StoreError>;

    /// Update scores matched by `(patient_id, written_at)`, one commit per batch
    ///
    /// Per-row failures do not abort the batch: remaining rows are still
    /// applied, the transaction is committed, and `StoreError::PartialWrite`
    /// is returned.
    async fn write_scores(&mut self, records: &[ScoreRecord]) -> Result<WriteAck, StoreError>;

    /// Scored messages written in `[now - lookback, now)`, oldest first
    async fn read_recent_for_report(
        &mut self,
        now: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<Vec<HistoryRow>, StoreError>;
}

/// Apply every `*.sql` file in `schema_dir`, in file-name order
///
/// Files must be idempotent (`IF NOT EXISTS`). All files run in one
/// transaction, so a broken file leaves the database as it was. Returns the
/// number of files applied.
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &Path) -> Result<usize, StoreError> {
    let entries = fs::read_dir(schema_dir).map_err(|e| {
        StoreError::Schema(format!("cannot read schema dir {}: {}", schema_dir.display(), e))
    })?;

    let mut scripts: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "sql"))
        .collect();
    scripts.sort();

    conn.pragma_update(None, "journal_mode", "WAL")?;

    let tx = conn.transaction()?;
    for script in &scripts {
        let sql = fs::read_to_string(script)?;
        tx.execute_batch(&sql).map_err(|e| {
            StoreError::Schema(format!("{} failed: {}", script.display(), e))
        })?;
        log::debug!("   ├─ Applied {}", script.display());
    }
    tx.commit()?;

    log::info!(
        "✅ Schema ready ({} files from {})",
        scripts.len(),
        schema_dir.display()
    );
    Ok(scripts.len())
}

/// SQLite-backed store gateway
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Create a gateway for an existing database
    ///
    /// Note: Does NOT create the schema. Run `run_schema_migrations` first.
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

#[async_trait]
impl StoreGateway for SqliteStore {
    async fn open_session(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        Ok(Box::new(SqliteSession { conn }))
    }
}

/// One cycle's connection
pub struct SqliteSession {
    conn: Connection,
}

impl SqliteSession {
    fn fetch_pending_sync(
        &self,
        now: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<Vec<RawRecord>, StoreError> {
        let upper = to_millis(&now);
        let lower = to_millis(&(now - lookback));

        let mut stmt = self.conn.prepare(
            "SELECT id, patient_id, text, written_at_ms FROM messages
             WHERE written_at_ms >= ?1 AND written_at_ms < ?2
               AND (score IS NULL OR score = 0)
             ORDER BY written_at_ms ASC, id ASC",
        )?;

        let rows = stmt.query_map(params![lower, upper], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (record_id, patient_id, text, written_at_ms) = row?;
            let written_at = from_millis(written_at_ms).ok_or_else(|| {
                StoreError::InvalidRow(format!(
                    "message {} has invalid written_at_ms {}",
                    record_id, written_at_ms
                ))
            })?;
            records.push(RawRecord {
                record_id,
                patient_id,
                text,
                written_at,
            });
        }

        Ok(records)
    }

    fn fetch_bio_snapshots_sync(
        &self,
        now: DateTime<Utc>,
        lookback_days: u32,
    ) -> Result<HashMap<String, BioSnapshot>, StoreError> {
        let upper = to_millis(&now);
        let lower = to_millis(&(now - Duration::days(lookback_days as i64)));

        let mut stmt = self.conn.prepare(
            "SELECT patient_id, parameter_name, value, captured_at_ms FROM bio_measurements
             WHERE captured_at_ms >= ?1 AND captured_at_ms <= ?2
             ORDER BY captured_at_ms ASC, id ASC",
        )?;

        let rows = stmt.query_map(params![lower, upper], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut measurements = Vec::new();
        for row in rows {
            let (patient_id, name, value, captured_at_ms) = row?;
            let captured_at = from_millis(captured_at_ms).ok_or_else(|| {
                StoreError::InvalidRow(format!(
                    "bio measurement for {} has invalid captured_at_ms {}",
                    patient_id, captured_at_ms
                ))
            })?;
            measurements.push((patient_id, name, value, captured_at));
        }

        Ok(latest_snapshots(measurements))
    }

    fn write_scores_sync(&mut self, records: &[ScoreRecord]) -> Result<WriteAck, StoreError> {
        let tx = self.conn.transaction()?;

        let mut ack = WriteAck::default();
        let mut failed = 0usize;
        let mut first_error: Option<String> = None;

        {
            let mut stmt = tx.prepare(
                "UPDATE messages SET score = ?1
                 WHERE patient_id = ?2 AND written_at_ms = ?3",
            )?;

            for record in records {
                match stmt.execute(params![
                    record.score,
                    record.patient_id,
                    to_millis(&record.written_at)
                ]) {
                    Ok(0) => {
                        ack.unmatched += 1;
                        log::warn!(
                            "⚠️  No message row for ({}, {})",
                            record.patient_id,
                            record.written_at
                        );
                    }
                    Ok(n) => {
                        if n > 1 {
                            log::warn!(
                                "⚠️  {} message rows share key ({}, {})",
                                n,
                                record.patient_id,
                                record.written_at
                            );
                        }
                        ack.rows_updated += n;
                    }
                    Err(e) => {
                        failed += 1;
                        first_error.get_or_insert_with(|| e.to_string());
                    }
                }
            }
        }

        // Committed even when some rows failed: applied rows are kept
        tx.commit()?;

        match first_error {
            Some(first_error) => Err(StoreError::PartialWrite {
                failed,
                total: records.len(),
                first_error,
            }),
            None => Ok(ack),
        }
    }

    fn read_recent_sync(
        &self,
        now: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<Vec<HistoryRow>, StoreError> {
        let upper = to_millis(&now);
        let lower = to_millis(&(now - lookback));

        let mut stmt = self.conn.prepare(
            "SELECT patient_id, text, written_at_ms, score FROM messages
             WHERE written_at_ms >= ?1 AND written_at_ms < ?2
               AND score IS NOT NULL AND score != 0
             ORDER BY written_at_ms ASC, id ASC",
        )?;

        let rows = stmt.query_map(params![lower, upper], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, f64>(3)?,
            ))
        })?;

        let mut history = Vec::new();
        for row in rows {
            let (patient_id, text, written_at_ms, score) = row?;
            let written_at = from_millis(written_at_ms).ok_or_else(|| {
                StoreError::InvalidRow(format!("invalid written_at_ms {}", written_at_ms))
            })?;
            history.push(HistoryRow {
                patient_id,
                text,
                written_at,
                score,
            });
        }

        Ok(history)
    }
}

#[async_trait]
impl StoreSession for SqliteSession {
    async fn fetch_pending(
        &mut self,
        now: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<Vec<RawRecord>, StoreError> {
        self.fetch_pending_sync(now, lookback)
    }

    async fn fetch_bio_snapshots(
        &mut self,
        now: DateTime<Utc>,
        lookback_days: u32,
    ) -> Result<HashMap<String, BioSnapshot>, StoreError> {
        self.fetch_bio_snapshots_sync(now, lookback_days)
    }

    async fn write_scores(&mut self, records: &[ScoreRecord]) -> Result<WriteAck, StoreError> {
        self.write_scores_sync(records)
    }

    async fn read_recent_for_report(
        &mut self,
        now: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<Vec<HistoryRow>, StoreError> {
        self.read_recent_sync(now, lookback)
    }
}

/// Group measurements into one snapshot per patient
///
/// A snapshot is every parameter sharing the patient's latest capture time;
/// measurements from earlier captures are discarded. Input order does not matter.
pub fn latest_snapshots(
    measurements: Vec<(String, String, f64, DateTime<Utc>)>,
) -> HashMap<String, BioSnapshot> {
    let mut snapshots: HashMap<String, BioSnapshot> = HashMap::new();

    for (patient_id, name, value, captured_at) in measurements {
        match snapshots.get_mut(&patient_id) {
            Some(snapshot) if captured_at < snapshot.captured_at => {}
            Some(snapshot) if captured_at == snapshot.captured_at => {
                snapshot.parameters.insert(name, value);
            }
            _ => {
                let mut parameters = BTreeMap::new();
                parameters.insert(name, value);
                snapshots.insert(
                    patient_id.clone(),
                    BioSnapshot {
                        patient_id,
                        parameters,
                        captured_at,
                    },
                );
            }
        }
    }

    snapshots
}
