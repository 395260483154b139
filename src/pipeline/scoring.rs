//! Scoring task: pending batch → inference engine → scored queue
//!
//! At most one batch per tick. The engine runs on tokio's blocking pool while
//! the task holds a read guard on the model slot, so a reload can never swap
//! the engine out from under an in-flight call.

use super::error::{InferenceError, PipelineError};
use super::inference::{validate_scores, ModelSlot};
use super::queue::{QueueConsumer, QueueProducer};
use super::scheduler::PeriodicTask;
use super::state::PipelineState;
use super::types::{Batch, ScoreRecord, ScoredBatch, WorkItem};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub struct ScoringTask {
    state: Arc<PipelineState>,
    slot: ModelSlot,
    pending: QueueConsumer<Batch>,
    scored: QueueProducer<ScoredBatch>,
    interval: Duration,
}

impl ScoringTask {
    pub fn new(
        state: Arc<PipelineState>,
        slot: ModelSlot,
        pending: QueueConsumer<Batch>,
        scored: QueueProducer<ScoredBatch>,
        interval: Duration,
    ) -> Self {
        Self {
            state,
            slot,
            pending,
            scored,
            interval,
        }
    }
}

#[async_trait]
impl PeriodicTask for ScoringTask {
    fn name(&self) -> &'static str {
        "score"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&mut self) -> Result<(), PipelineError> {
        if self.state.is_paused() {
            return Ok(());
        }

        let model = self.slot.read_owned().await;
        let expected_version = self.state.current_model_version();
        if model.version != expected_version {
            // Reload in progress: leave the batch queued until the new engine is installed
            log::debug!(
                "⏳ Waiting for model v{} (loaded: v{})",
                expected_version,
                model.version
            );
            return Ok(());
        }

        let batch = match self.pending.try_pop() {
            Ok(Some(batch)) => batch,
            Ok(None) => return Ok(()),
            Err(e) => {
                log::warn!("⚠️  {}", e);
                return Ok(());
            }
        };

        if batch.is_empty() {
            return Ok(());
        }

        let size = batch.len();
        let (batch, result) = tokio::task::spawn_blocking(move || {
            let result = model.engine.score(&batch);
            // Guard dropped here, after the engine returns
            drop(model);
            (batch, result)
        })
        .await
        .map_err(|e| InferenceError::Worker(e.to_string()))?;

        let scores = validate_scores(size, result?)?;
        let scored = pair_scores(&batch, scores);

        log::info!(
            "🧮 Scored {} messages (model v{})",
            scored.len(),
            expected_version
        );

        if self.scored.push(scored).await.is_err() {
            log::warn!("⚠️  Scored queue closed, dropping {} scores", size);
        }
        Ok(())
    }
}

/// Pair scores with their originating messages by position
///
/// `scores` must already be validated against `batch.len()`.
pub fn pair_scores(batch: &[WorkItem], scores: Vec<f64>) -> ScoredBatch {
    batch
        .iter()
        .zip(scores)
        .map(|(item, score)| ScoreRecord {
            patient_id: item.patient_id.clone(),
            written_at: item.written_at,
            score,
        })
        .collect()
}
