//! Core data structures moved through the scoring pipeline
//!
//! Data flows one way:
//! `RawRecord` (store) → `WorkItem` (pending queue) → `ScoreRecord` (scored queue) → store

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Wall-clock source for tasks that read "now" each tick
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Unscored patient message as read from the store
///
/// Produced once by the ingestion task, consumed once when building a `WorkItem`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Store row id
    pub record_id: i64,

    /// Patient identifier
    pub patient_id: String,

    /// Message body
    pub text: String,

    /// When the patient wrote the message
    pub written_at: DateTime<Utc>,
}

/// Latest set of biological measurements for one patient
///
/// One per patient per ingestion cycle. Absent when no measurement
/// falls inside the bio lookback window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BioSnapshot {
    pub patient_id: String,

    /// Parameter name → measured value
    pub parameters: BTreeMap<String, f64>,

    pub captured_at: DateTime<Utc>,
}

/// Unit of work placed on the pending queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub text: String,
    pub patient_id: String,
    pub bio: Option<BioSnapshot>,
    pub written_at: DateTime<Utc>,
}

/// Ordered group of work items, in the order the store returned them
pub type Batch = Vec<WorkItem>;

/// Inference output for one message
///
/// `(patient_id, written_at)` is the key used to match the score back
/// to the originating message row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub patient_id: String,
    pub written_at: DateTime<Utc>,
    pub score: f64,
}

/// Ordered group of score records, index-aligned with the batch that produced it
pub type ScoredBatch = Vec<ScoreRecord>;

/// Scored message row used by the history export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub patient_id: String,
    pub text: String,
    pub written_at: DateTime<Utc>,
    pub score: f64,
}

/// Acknowledgement of a committed score batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteAck {
    /// Rows whose score column was updated
    pub rows_updated: usize,

    /// Records that matched no message row
    pub unmatched: usize,
}

/// Convert a timestamp to the integer milliseconds stored in SQLite
pub fn to_millis(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Convert stored integer milliseconds back to a UTC timestamp
///
/// Returns `None` for values outside chrono's representable range.
pub fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}
