//! Pipeline configuration from environment variables

use super::error::ConfigError;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default capacity of each bounded queue (batches)
pub const DEFAULT_MAX_QUEUE: usize = 100;

/// Configuration for the scoring pipeline runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: PathBuf,

    /// Directory containing idempotent `.sql` schema files
    pub schema_dir: PathBuf,

    /// Base service log file (rotated copies get a timestamp suffix)
    pub log_file: PathBuf,

    /// Mirror log records to stderr as well as the log file
    pub log_to_stderr: bool,

    /// Currently-loaded model artifact
    pub model_path: PathBuf,

    /// Hot-reload drop directory, also receives the history CSV
    pub update_dir: PathBuf,

    /// Extension (without dot) marking a reload candidate
    pub reload_extension: String,

    /// Capacity of the pending and scored queues
    pub max_queue: usize,

    pub read_interval_secs: u64,
    pub score_interval_secs: u64,
    pub write_interval_secs: u64,
    pub reload_check_interval_secs: u64,
    pub log_rotate_interval_secs: u64,
    pub history_dump_interval_secs: u64,

    /// Register the history-dump task
    pub enable_history_dump: bool,

    /// Ingestion window; must exceed the read interval
    pub ingest_lookback_secs: u64,

    /// Window for bio measurement snapshots
    pub bio_lookback_days: u32,

    /// Window for the history export
    pub history_lookback_days: u32,

    /// How often the main run loop polls the pause flag
    pub reload_poll_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/triage.db"),
            schema_dir: PathBuf::from("sql"),
            log_file: PathBuf::from("logs/triage_service.log"),
            log_to_stderr: false,
            model_path: PathBuf::from("data/model.json"),
            update_dir: PathBuf::from("updates"),
            reload_extension: "upd".to_string(),
            max_queue: DEFAULT_MAX_QUEUE,
            read_interval_secs: 2,
            score_interval_secs: 1,
            write_interval_secs: 1,
            reload_check_interval_secs: 30,
            log_rotate_interval_secs: 24 * 60 * 60,
            history_dump_interval_secs: 60 * 60,
            enable_history_dump: true,
            ingest_lookback_secs: 3,
            bio_lookback_days: 7,
            history_lookback_days: 30,
            reload_poll_ms: 500,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `TRIAGE_DB_PATH` (default: data/triage.db)
    /// - `TRIAGE_SCHEMA_DIR` (default: sql)
    /// - `TRIAGE_LOG_FILE` (default: logs/triage_service.log)
    /// - `TRIAGE_LOG_STDERR` (default: false)
    /// - `TRIAGE_MODEL_PATH` (default: data/model.json)
    /// - `TRIAGE_UPDATE_DIR` (default: updates)
    /// - `TRIAGE_RELOAD_EXTENSION` (default: upd)
    /// - `TRIAGE_MAX_QUEUE` (default: 100)
    /// - `READ_INTERVAL_SECS` (default: 2)
    /// - `SCORE_INTERVAL_SECS` (default: 1)
    /// - `WRITE_INTERVAL_SECS` (default: 1)
    /// - `RELOAD_CHECK_INTERVAL_SECS` (default: 30)
    /// - `LOG_ROTATE_INTERVAL_SECS` (default: 86400)
    /// - `HISTORY_DUMP_INTERVAL_SECS` (default: 3600)
    /// - `ENABLE_HISTORY_DUMP` (default: true)
    /// - `INGEST_LOOKBACK_SECS` (default: 3)
    /// - `BIO_LOOKBACK_DAYS` (default: 7)
    /// - `HISTORY_LOOKBACK_DAYS` (default: 30)
    /// - `RELOAD_POLL_MS` (default: 500)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup
    ///
    /// Unparseable values fall back to the default, matching `from_env`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let path = |key: &str, default: PathBuf| lookup(key).map(PathBuf::from).unwrap_or(default);

        Self {
            db_path: path("TRIAGE_DB_PATH", defaults.db_path),
            schema_dir: path("TRIAGE_SCHEMA_DIR", defaults.schema_dir),
            log_file: path("TRIAGE_LOG_FILE", defaults.log_file),
            log_to_stderr: parse_or(&lookup, "TRIAGE_LOG_STDERR", defaults.log_to_stderr),
            model_path: path("TRIAGE_MODEL_PATH", defaults.model_path),
            update_dir: path("TRIAGE_UPDATE_DIR", defaults.update_dir),
            reload_extension: lookup("TRIAGE_RELOAD_EXTENSION")
                .map(|ext| ext.trim_start_matches('.').to_string())
                .unwrap_or(defaults.reload_extension),
            max_queue: parse_or(&lookup, "TRIAGE_MAX_QUEUE", defaults.max_queue),
            read_interval_secs: parse_or(&lookup, "READ_INTERVAL_SECS", defaults.read_interval_secs),
            score_interval_secs: parse_or(&lookup, "SCORE_INTERVAL_SECS", defaults.score_interval_secs),
            write_interval_secs: parse_or(&lookup, "WRITE_INTERVAL_SECS", defaults.write_interval_secs),
            reload_check_interval_secs: parse_or(
                &lookup,
                "RELOAD_CHECK_INTERVAL_SECS",
                defaults.reload_check_interval_secs,
            ),
            log_rotate_interval_secs: parse_or(
                &lookup,
                "LOG_ROTATE_INTERVAL_SECS",
                defaults.log_rotate_interval_secs,
            ),
            history_dump_interval_secs: parse_or(
                &lookup,
                "HISTORY_DUMP_INTERVAL_SECS",
                defaults.history_dump_interval_secs,
            ),
            enable_history_dump: parse_or(&lookup, "ENABLE_HISTORY_DUMP", defaults.enable_history_dump),
            ingest_lookback_secs: parse_or(&lookup, "INGEST_LOOKBACK_SECS", defaults.ingest_lookback_secs),
            bio_lookback_days: parse_or(&lookup, "BIO_LOOKBACK_DAYS", defaults.bio_lookback_days),
            history_lookback_days: parse_or(
                &lookup,
                "HISTORY_LOOKBACK_DAYS",
                defaults.history_lookback_days,
            ),
            reload_poll_ms: parse_or(&lookup, "RELOAD_POLL_MS", defaults.reload_poll_ms),
        }
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue == 0 {
            return Err(ConfigError::InvalidValue(
                "TRIAGE_MAX_QUEUE must be at least 1".to_string(),
            ));
        }

        let intervals = [
            ("READ_INTERVAL_SECS", self.read_interval_secs),
            ("SCORE_INTERVAL_SECS", self.score_interval_secs),
            ("WRITE_INTERVAL_SECS", self.write_interval_secs),
            ("RELOAD_CHECK_INTERVAL_SECS", self.reload_check_interval_secs),
            ("LOG_ROTATE_INTERVAL_SECS", self.log_rotate_interval_secs),
            ("HISTORY_DUMP_INTERVAL_SECS", self.history_dump_interval_secs),
            ("RELOAD_POLL_MS", self.reload_poll_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::InvalidValue(format!("{} must be greater than 0", name)));
            }
        }

        // Window must overlap consecutive ticks or messages slip between cycles
        if self.ingest_lookback_secs <= self.read_interval_secs {
            return Err(ConfigError::InvalidValue(format!(
                "INGEST_LOOKBACK_SECS ({}) must exceed READ_INTERVAL_SECS ({})",
                self.ingest_lookback_secs, self.read_interval_secs
            )));
        }

        if self.reload_extension.is_empty() {
            return Err(ConfigError::InvalidValue(
                "TRIAGE_RELOAD_EXTENSION cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn ingest_lookback(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ingest_lookback_secs as i64)
    }

    pub fn reload_poll(&self) -> Duration {
        Duration::from_millis(self.reload_poll_ms)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => match raw.trim().to_lowercase().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Invalid {} '{}', using default", key, raw);
                default
            }
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::from_lookup(lookup_from(&[]));

        assert_eq!(config.db_path, PathBuf::from("data/triage.db"));
        assert_eq!(config.max_queue, 100);
        assert_eq!(config.read_interval_secs, 2);
        assert_eq!(config.score_interval_secs, 1);
        assert_eq!(config.write_interval_secs, 1);
        assert_eq!(config.log_rotate_interval_secs, 86_400);
        assert_eq!(config.ingest_lookback_secs, 3);
        assert_eq!(config.reload_extension, "upd");
        assert!(config.enable_history_dump);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_custom_config() {
        let config = PipelineConfig::from_lookup(lookup_from(&[
            ("TRIAGE_DB_PATH", "/tmp/test.db"),
            ("TRIAGE_MAX_QUEUE", "5"),
            ("READ_INTERVAL_SECS", "10"),
            ("INGEST_LOOKBACK_SECS", "15"),
            ("ENABLE_HISTORY_DUMP", "FALSE"),
            ("TRIAGE_RELOAD_EXTENSION", ".weights"),
        ]));

        assert_eq!(config.db_path, PathBuf::from("/tmp/test.db"));
        assert_eq!(config.max_queue, 5);
        assert_eq!(config.read_interval_secs, 10);
        assert_eq!(config.ingest_lookback_secs, 15);
        assert!(!config.enable_history_dump);
        assert_eq!(config.reload_extension, "weights");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_value_falls_back_to_default() {
        let config = PipelineConfig::from_lookup(lookup_from(&[("TRIAGE_MAX_QUEUE", "lots")]));
        assert_eq!(config.max_queue, DEFAULT_MAX_QUEUE);
    }

    #[test]
    fn test_lookback_must_exceed_read_interval() {
        let config = PipelineConfig::from_lookup(lookup_from(&[
            ("READ_INTERVAL_SECS", "5"),
            ("INGEST_LOOKBACK_SECS", "5"),
        ]));

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("INGEST_LOOKBACK_SECS"));
    }

    #[test]
    fn test_zero_queue_rejected() {
        let config = PipelineConfig {
            max_queue: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
