//! Ingestion task: pull unscored messages from the store into the pending queue
//!
//! Each tick:
//! 1. Skip entirely while the pipeline is paused
//! 2. Read unscored messages written in `[now - lookback, now)` on a fresh session
//! 3. If any, read the latest bio snapshot per patient
//! 4. Assemble one batch in store order and push it, waiting if the queue is full
//!
//! A failed read aborts the cycle before anything is pushed: either the whole
//! batch reaches the queue or nothing does.

use super::db::StoreGateway;
use super::error::PipelineError;
use super::queue::QueueProducer;
use super::scheduler::PeriodicTask;
use super::state::PipelineState;
use super::types::{Batch, BioSnapshot, Clock, RawRecord, WorkItem};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub struct IngestionTask {
    store: Arc<dyn StoreGateway>,
    state: Arc<PipelineState>,
    pending: QueueProducer<Batch>,
    lookback: chrono::Duration,
    bio_lookback_days: u32,
    interval: Duration,
    clock: Clock,
}

impl IngestionTask {
    pub fn new(
        store: Arc<dyn StoreGateway>,
        state: Arc<PipelineState>,
        pending: QueueProducer<Batch>,
        lookback: chrono::Duration,
        bio_lookback_days: u32,
        interval: Duration,
        clock: Clock,
    ) -> Self {
        Self {
            store,
            state,
            pending,
            lookback,
            bio_lookback_days,
            interval,
            clock,
        }
    }

    /// Read one batch for the window ending at `now`
    ///
    /// Returns `Ok(None)` when no message is pending.
    pub async fn read_batch(&self, now: DateTime<Utc>) -> Result<Option<Batch>, PipelineError> {
        let mut session = self.store.open_session().await?;

        let records = session.fetch_pending(now, self.lookback).await?;
        if records.is_empty() {
            return Ok(None);
        }

        log::info!("📥 Found {} messages to process", records.len());

        let snapshots = session
            .fetch_bio_snapshots(now, self.bio_lookback_days)
            .await?;

        Ok(Some(build_batch(records, &snapshots)))
    }
}

#[async_trait]
impl PeriodicTask for IngestionTask {
    fn name(&self) -> &'static str {
        "read"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&mut self) -> Result<(), PipelineError> {
        if self.state.is_paused() {
            log::debug!("⏸️  Ingestion paused");
            return Ok(());
        }

        let now = (self.clock)();
        let Some(batch) = self.read_batch(now).await? else {
            return Ok(());
        };

        let size = batch.len();
        if self.pending.push(batch).await.is_err() {
            log::warn!("⚠️  Pending queue closed, dropping batch of {}", size);
            return Ok(());
        }

        log::debug!(
            "✅ Queued batch of {} | pending: {}/{}",
            size,
            self.pending.len(),
            self.pending.capacity()
        );
        Ok(())
    }
}

/// Attach each message's patient snapshot, preserving message order
pub fn build_batch(records: Vec<RawRecord>, snapshots: &HashMap<String, BioSnapshot>) -> Batch {
    records
        .into_iter()
        .map(|record| WorkItem {
            bio: snapshots.get(&record.patient_id).cloned(),
            text: record.text,
            patient_id: record.patient_id,
            written_at: record.written_at,
        })
        .collect()
}
