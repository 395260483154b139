//! Failure recorder: service log file, error-triggered freeze, routine rotation
//!
//! All log output goes through one shared `LogFile`. When a task fails, the
//! error is appended, the file is flushed and closed, renamed to
//! `<base>.<unix-ts>_err` so the evidence survives the daily clear, and a
//! fresh log is opened. The routine rotation task clears the log on a daily
//! cadence. Both paths and the log sink take the same lock, so rotations
//! never interleave with each other or with a half-written record.

use super::error::PipelineError;
use super::scheduler::PeriodicTask;
use async_trait::async_trait;
use chrono::Utc;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

struct LogFile {
    base_path: PathBuf,
    writer: Option<BufWriter<File>>,
    mirror_stderr: bool,
}

impl LogFile {
    fn open_writer(path: &Path, truncate: bool) -> io::Result<BufWriter<File>> {
        let mut options = OpenOptions::new();
        options.create(true);
        if truncate {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        Ok(BufWriter::new(options.open(path)?))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.mirror_stderr {
            let _ = io::stderr().write_all(buf);
        }
        match self.writer.as_mut() {
            Some(writer) => writer.write_all(buf),
            None => Ok(()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }

    /// Flush and close the current file
    fn close(&mut self) -> io::Result<()> {
        let result = self.flush();
        self.writer = None;
        result
    }
}

/// Shared handle to the service log
#[derive(Clone)]
pub struct FailureRecorder {
    inner: Arc<Mutex<LogFile>>,
}

impl FailureRecorder {
    /// Open (or create) the base log file in append mode
    pub fn open(base_path: impl Into<PathBuf>, mirror_stderr: bool) -> io::Result<Self> {
        let base_path = base_path.into();
        if let Some(parent) = base_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let writer = LogFile::open_writer(&base_path, false)?;

        Ok(Self {
            inner: Arc::new(Mutex::new(LogFile {
                base_path,
                writer: Some(writer),
                mirror_stderr,
            })),
        })
    }

    pub fn base_path(&self) -> PathBuf {
        self.lock().base_path.clone()
    }

    /// Writer handed to the logging backend
    pub fn sink(&self) -> LogSink {
        LogSink {
            inner: self.inner.clone(),
        }
    }

    /// Install `env_logger` writing every record into this log
    ///
    /// `RUST_LOG` overrides `default_filter`.
    pub fn install_logger(&self, default_filter: &str) -> Result<(), log::SetLoggerError> {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
            .target(env_logger::Target::Pipe(Box::new(self.sink())))
            .write_style(env_logger::WriteStyle::Never)
            .try_init()
    }

    /// Append a failure and freeze the log under a timestamped name
    ///
    /// Returns the path of the frozen log. A rename failure means the
    /// recorder itself is compromised and is reported as `FatalIo`.
    pub fn record_failure(&self, task: &str, error: &PipelineError) -> Result<PathBuf, PipelineError> {
        let mut log = self.lock();

        let line = format!(
            "[{} ERROR {}] {}: {}\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            task,
            error.kind(),
            error
        );
        let base_path = log.base_path.clone();
        let fatal = |source: io::Error| PipelineError::FatalIo {
            path: base_path.clone(),
            source,
        };

        log.write_all(line.as_bytes()).map_err(fatal)?;
        log.close().map_err(fatal)?;

        let frozen = frozen_log_path(&log.base_path, Utc::now().timestamp());
        if let Err(source) = fs::rename(&log.base_path, &frozen) {
            // Base file still holds the evidence: keep appending to it
            log.writer = LogFile::open_writer(&log.base_path, false).ok();
            return Err(fatal(source));
        }

        log.writer = Some(LogFile::open_writer(&log.base_path, true).map_err(fatal)?);
        Ok(frozen)
    }

    /// Clear the log and start over on the same path
    pub fn rotate_routine(&self) -> Result<(), PipelineError> {
        let mut log = self.lock();
        let base_path = log.base_path.clone();
        let fatal = |source: io::Error| PipelineError::FatalIo {
            path: base_path.clone(),
            source,
        };

        log.close().map_err(fatal)?;
        log.writer = Some(LogFile::open_writer(&log.base_path, true).map_err(fatal)?);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, LogFile> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `Write` adapter used as the env_logger target
pub struct LogSink {
    inner: Arc<Mutex<LogFile>>,
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut log = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        log.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

/// `<base>.<ts>_err`, or `<base>.<ts>-<n>_err` if that name is taken
fn frozen_log_path(base: &Path, unix_ts: i64) -> PathBuf {
    let with_suffix = |suffix: String| {
        let mut name = OsString::from(base.as_os_str());
        name.push(suffix);
        PathBuf::from(name)
    };

    let candidate = with_suffix(format!(".{}_err", unix_ts));
    if !candidate.exists() {
        return candidate;
    }

    (1u32..)
        .map(|n| with_suffix(format!(".{}-{}_err", unix_ts, n)))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

/// Daily routine rotation
pub struct LogRotationTask {
    recorder: FailureRecorder,
    interval: Duration,
}

impl LogRotationTask {
    pub fn new(recorder: FailureRecorder, interval: Duration) -> Self {
        Self { recorder, interval }
    }
}

#[async_trait]
impl PeriodicTask for LogRotationTask {
    fn name(&self) -> &'static str {
        "log-rotate"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&mut self) -> Result<(), PipelineError> {
        self.recorder.rotate_routine()?;
        log::info!("🧹 Service log cleared");
        Ok(())
    }
}
