//! # Message Triage Pipeline
//!
//! Periodically scores patient text messages with a pluggable inference
//! engine and writes the scores back to the store.
//!
//! ## Architecture
//!
//! ```text
//! store ──read──▶ pending queue ──score──▶ scored queue ──write──▶ store
//!                                   ▲
//!                          model slot (hot reload)
//! ```
//!
//! 1. `ingestion` pulls unscored messages in a short lookback window and
//!    attaches each patient's latest bio snapshot
//! 2. `scoring` pops one batch per tick and runs the engine on it
//! 3. `persistence` writes one scored batch per tick back to the store
//! 4. `reload` swaps in a new model artifact while the pipeline is paused
//! 5. `recorder` keeps the service log and freezes it on every failure
//!
//! Tasks never call into each other: they only share the two bounded
//! queues and `PipelineState`.
//!
//! ## Module Organization
//!
//! - `types` - Data flowing through the queues (WorkItem, ScoreRecord, ...)
//! - `error` - Error taxonomy and fatal/non-fatal classification
//! - `config` - Environment configuration
//! - `db` - Store gateway trait, SQLite implementation, migrations
//! - `queue` - Bounded FIFO queue halves
//! - `state` - Shared pause flag and model version
//! - `inference` - Engine/loader traits and the model slot
//! - `model` - JSON dense text model
//! - `scheduler` - Fixed-delay periodic task runner
//! - `ingestion`, `scoring`, `persistence`, `reload`, `history` - Periodic tasks
//! - `recorder` - Service log and failure recorder
//! - `runtime` - Wiring and the main reload loop

pub mod types;
pub mod error;
pub mod config;
pub mod db;
pub mod queue;
pub mod state;
pub mod inference;
pub mod model;
pub mod scheduler;
pub mod ingestion;
pub mod scoring;
pub mod persistence;
pub mod reload;
pub mod recorder;
pub mod history;
pub mod runtime;

// Re-export commonly used types
pub use types::{Batch, BioSnapshot, HistoryRow, RawRecord, ScoreRecord, ScoredBatch, WorkItem, WriteAck};
pub use error::{ConfigError, InferenceError, PipelineError, StoreError};
pub use config::PipelineConfig;
pub use db::{StoreGateway, StoreSession, SqliteStore};
pub use inference::{InferenceEngine, ModelLoader, ModelSlot};
pub use model::{DenseModelLoader, DenseTextModel};
pub use recorder::FailureRecorder;
pub use runtime::PipelineRuntime;
pub use state::PipelineState;
