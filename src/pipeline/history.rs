//! Score history export
//!
//! Writes every scored message of the last `HISTORY_LOOKBACK_DAYS` to
//! `score_history.csv` in the update directory. The file is written next to
//! its destination and renamed into place, so readers never see a half-written
//! export.

use super::db::StoreGateway;
use super::error::PipelineError;
use super::scheduler::PeriodicTask;
use super::types::{Clock, HistoryRow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const HISTORY_FILE_NAME: &str = "score_history.csv";
pub const HISTORY_HEADER: &str = "patient_id,text_message,time,score";
const TIME_FORMAT: &str = "%m/%d/%Y_%H:%M:%S";

/// Read recent scored rows and write the CSV export
///
/// Returns the number of rows written.
pub async fn export_history(
    store: &dyn StoreGateway,
    output_dir: &Path,
    now: DateTime<Utc>,
    lookback_days: u32,
) -> Result<usize, PipelineError> {
    let mut session = store.open_session().await?;
    let rows = session
        .read_recent_for_report(now, chrono::Duration::days(i64::from(lookback_days)))
        .await?;
    drop(session);

    fs::create_dir_all(output_dir)?;
    let path = output_dir.join(HISTORY_FILE_NAME);
    write_history_csv(&path, &rows)?;

    log::info!("📊 Exported {} scored messages to {}", rows.len(), path.display());
    Ok(rows.len())
}

/// Write `rows` to `path` via a temporary sibling file
pub fn write_history_csv(path: &Path, rows: &[HistoryRow]) -> io::Result<()> {
    let tmp = tmp_path(path);

    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        writeln!(writer, "{}", HISTORY_HEADER)?;
        for row in rows {
            writeln!(writer, "{}", format_row(row))?;
        }
        writer.flush()?;
    }

    fs::rename(&tmp, path)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn format_row(row: &HistoryRow) -> String {
    format!(
        "{},{},{},{}",
        csv_field(&row.patient_id),
        quoted(&row.text),
        row.written_at.format(TIME_FORMAT),
        row.score
    )
}

fn quoted(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| *c != '\n' && *c != '\r')
        .collect();
    format!("\"{}\"", cleaned.replace('"', "\"\""))
}

/// Quote only when the value would break the row
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        quoted(value)
    } else {
        value.to_string()
    }
}

/// Periodic history export
pub struct HistoryDumpTask {
    store: Arc<dyn StoreGateway>,
    output_dir: PathBuf,
    lookback_days: u32,
    interval: Duration,
    clock: Clock,
}

impl HistoryDumpTask {
    pub fn new(
        store: Arc<dyn StoreGateway>,
        output_dir: impl Into<PathBuf>,
        lookback_days: u32,
        interval: Duration,
        clock: Clock,
    ) -> Self {
        Self {
            store,
            output_dir: output_dir.into(),
            lookback_days,
            interval,
            clock,
        }
    }
}

#[async_trait]
impl PeriodicTask for HistoryDumpTask {
    fn name(&self) -> &'static str {
        "history-dump"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&mut self) -> Result<(), PipelineError> {
        let now = (self.clock)();
        export_history(self.store.as_ref(), &self.output_dir, now, self.lookback_days).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::{run_schema_migrations, SqliteStore};
    use crate::pipeline::types::to_millis;
    use chrono::TimeZone;
    use rusqlite::{params, Connection};
    use tempfile::{tempdir, NamedTempFile};

    fn row(patient: &str, text: &str, score: f64) -> HistoryRow {
        HistoryRow {
            patient_id: patient.to_string(),
            text: text.to_string(),
            written_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, 5, 7).unwrap(),
            score,
        }
    }

    #[test]
    fn test_format_row_escapes_text() {
        let line = format_row(&row("P1", "he said \"ouch\"\nthen left", 3.0));
        assert_eq!(line, "P1,\"he said \"\"ouch\"\"then left\",03/01/2024_09:05:07,3");
    }

    #[test]
    fn test_csv_field_quotes_only_when_needed() {
        assert_eq!(csv_field("P1"), "P1");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
    }

    #[test]
    fn test_write_history_csv_replaces_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(HISTORY_FILE_NAME);
        fs::write(&path, "stale").unwrap();

        write_history_csv(&path, &[row("P1", "ok", 1.0), row("P2", "help", 4.0)]).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HISTORY_HEADER);
        assert!(lines[2].starts_with("P2,\"help\","));
        assert!(!tmp_path(&path).exists());
    }

    #[tokio::test]
    async fn test_history_task_exports_scored_rows() {
        let db = NamedTempFile::new().unwrap();
        let mut conn = Connection::open(db.path()).unwrap();
        run_schema_migrations(&mut conn, Path::new("sql")).unwrap();

        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let inserts = [
            ("P1", "recent scored", now - chrono::Duration::days(1), Some(2.0)),
            ("P2", "recent unscored", now - chrono::Duration::days(1), None),
            ("P3", "too old", now - chrono::Duration::days(40), Some(4.0)),
        ];
        for (patient, text, at, score) in inserts {
            conn.execute(
                "INSERT INTO messages (patient_id, text, written_at_ms, score) VALUES (?1, ?2, ?3, ?4)",
                params![patient, text, to_millis(&at), score],
            )
            .unwrap();
        }
        drop(conn);

        let out = tempdir().unwrap();
        let mut task = HistoryDumpTask::new(
            Arc::new(SqliteStore::new(db.path())),
            out.path().join("updates"),
            30,
            Duration::from_secs(3600),
            Arc::new(move || now),
        );
        task.run_once().await.unwrap();

        let content = fs::read_to_string(out.path().join("updates").join(HISTORY_FILE_NAME)).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("P1,\"recent scored\",03/09/2024_12:00:00,2"));
    }
}
