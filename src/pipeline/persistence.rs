//! Persistence task: scored queue → store
//!
//! Pops at most one scored batch per tick and writes it back on a fresh
//! session, one transaction per batch. Rows are matched by
//! `(patient_id, written_at)`.

use super::db::StoreGateway;
use super::error::PipelineError;
use super::queue::QueueConsumer;
use super::scheduler::PeriodicTask;
use super::state::PipelineState;
use super::types::ScoredBatch;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub struct PersistenceTask {
    store: Arc<dyn StoreGateway>,
    state: Arc<PipelineState>,
    scored: QueueConsumer<ScoredBatch>,
    interval: Duration,
}

impl PersistenceTask {
    pub fn new(
        store: Arc<dyn StoreGateway>,
        state: Arc<PipelineState>,
        scored: QueueConsumer<ScoredBatch>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            state,
            scored,
            interval,
        }
    }
}

#[async_trait]
impl PeriodicTask for PersistenceTask {
    fn name(&self) -> &'static str {
        "write"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&mut self) -> Result<(), PipelineError> {
        if self.state.is_paused() {
            return Ok(());
        }

        let batch = match self.scored.try_pop() {
            Ok(Some(batch)) if !batch.is_empty() => batch,
            Ok(_) => return Ok(()),
            Err(e) => {
                log::warn!("⚠️  {}", e);
                return Ok(());
            }
        };

        let mut session = self.store.open_session().await?;
        let ack = session.write_scores(&batch).await?;

        log::info!(
            "💾 Wrote {} scores ({} rows updated, {} unmatched)",
            batch.len(),
            ack.rows_updated,
            ack.unmatched
        );
        Ok(())
    }
}
