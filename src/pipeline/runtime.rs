//! Pipeline wiring and the main run loop
//!
//! Builds the two bounded queues and the periodic tasks, hands them to the
//! scheduler, then polls the pause flag until shutdown. The Reloading →
//! Active transition happens here rather than in a scheduled task so a slow
//! model load never competes with a scoring tick.

use super::config::PipelineConfig;
use super::db::StoreGateway;
use super::error::{InferenceError, PipelineError};
use super::history::HistoryDumpTask;
use super::inference::{InferenceEngine, ModelLoader, ModelSlot};
use super::ingestion::IngestionTask;
use super::persistence::PersistenceTask;
use super::queue::bounded;
use super::recorder::{FailureRecorder, LogRotationTask};
use super::reload::{HotReloadCoordinator, ReloadCheckTask};
use super::scheduler::{handle_failure, join_all, Scheduler};
use super::scoring::ScoringTask;
use super::state::PipelineState;
use super::types::{system_clock, Batch, Clock, ScoredBatch};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Load the startup model on the blocking pool
pub async fn load_initial_model(
    loader: Arc<dyn ModelLoader>,
    path: &Path,
) -> Result<Arc<dyn InferenceEngine>, InferenceError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || loader.load(&path))
        .await
        .map_err(|e| InferenceError::Worker(e.to_string()))?
}

pub struct PipelineRuntime {
    config: PipelineConfig,
    store: Arc<dyn StoreGateway>,
    recorder: FailureRecorder,
    state: Arc<PipelineState>,
    slot: ModelSlot,
    coordinator: Arc<HotReloadCoordinator>,
    clock: Clock,
    shutdown: CancellationToken,
}

impl PipelineRuntime {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn StoreGateway>,
        loader: Arc<dyn ModelLoader>,
        initial_engine: Arc<dyn InferenceEngine>,
        recorder: FailureRecorder,
    ) -> Self {
        let state = Arc::new(PipelineState::new());
        let slot = ModelSlot::new(initial_engine, state.current_model_version());
        let coordinator = Arc::new(HotReloadCoordinator::new(
            state.clone(),
            slot.clone(),
            loader,
            config.model_path.clone(),
            config.update_dir.clone(),
            config.reload_extension.clone(),
        ));

        Self {
            config,
            store,
            recorder,
            state,
            slot,
            coordinator,
            clock: system_clock(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace the wall clock read by ingestion and history export
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> Arc<PipelineState> {
        self.state.clone()
    }

    pub fn slot(&self) -> ModelSlot {
        self.slot.clone()
    }

    /// Cancelling this token stops the pipeline
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Queues plus every periodic task, ready to spawn
    pub fn build_scheduler(&self) -> Scheduler {
        let config = &self.config;
        let (pending_tx, pending_rx) = bounded::<Batch>("pending", config.max_queue);
        let (scored_tx, scored_rx) = bounded::<ScoredBatch>("scored", config.max_queue);

        let mut scheduler = Scheduler::new(self.recorder.clone(), self.shutdown.clone());
        scheduler
            .register(Box::new(IngestionTask::new(
                self.store.clone(),
                self.state.clone(),
                pending_tx,
                config.ingest_lookback(),
                config.bio_lookback_days,
                secs(config.read_interval_secs),
                self.clock.clone(),
            )))
            .register(Box::new(ScoringTask::new(
                self.state.clone(),
                self.slot.clone(),
                pending_rx,
                scored_tx,
                secs(config.score_interval_secs),
            )))
            .register(Box::new(PersistenceTask::new(
                self.store.clone(),
                self.state.clone(),
                scored_rx,
                secs(config.write_interval_secs),
            )))
            .register(Box::new(ReloadCheckTask::new(
                self.coordinator.clone(),
                secs(config.reload_check_interval_secs),
            )))
            .register(Box::new(LogRotationTask::new(
                self.recorder.clone(),
                secs(config.log_rotate_interval_secs),
            )));

        if config.enable_history_dump {
            scheduler.register(Box::new(HistoryDumpTask::new(
                self.store.clone(),
                config.update_dir.clone(),
                config.history_lookback_days,
                secs(config.history_dump_interval_secs),
                self.clock.clone(),
            )));
        }

        scheduler
    }

    /// Run until the shutdown token is cancelled or a fatal error occurs
    pub async fn run(self) -> Result<(), PipelineError> {
        let handles = self.build_scheduler().spawn_all();
        let main_result = self.poll_reloads().await;

        log::info!("🛑 Shutting down, waiting for in-flight cycles...");
        self.shutdown.cancel();
        let tasks_result = join_all(handles).await;

        log::info!("✅ Pipeline stopped");
        main_result.and(tasks_result)
    }

    async fn poll_reloads(&self) -> Result<(), PipelineError> {
        let poll = self.config.reload_poll();
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(reload_delay(poll, failures)) => {}
            }

            if !self.state.is_paused() {
                failures = 0;
                continue;
            }

            match self.coordinator.complete_pending_reload().await {
                Ok(_) => failures = 0,
                // Only the first failure of a streak freezes a log
                Err(e) if failures == 0 || e.is_fatal() => {
                    failures += 1;
                    handle_failure("reload", e, &self.recorder)?;
                }
                Err(e) => {
                    failures += 1;
                    log::warn!("⚠️  Reload still failing (attempt {}): {}", failures, e);
                }
            }
        }
    }
}

/// Poll delay after `failures` consecutive reload failures, doubling up to 64x
fn reload_delay(poll: Duration, failures: u32) -> Duration {
    poll * 2u32.pow(failures.min(6))
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::SqliteStore;
    use crate::pipeline::types::WorkItem;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct ZeroEngine;

    impl InferenceEngine for ZeroEngine {
        fn score(&self, batch: &[WorkItem]) -> Result<Vec<f64>, InferenceError> {
            Ok(vec![0.0; batch.len()])
        }
    }

    struct NoLoader;

    impl ModelLoader for NoLoader {
        fn load(&self, path: &Path) -> Result<Arc<dyn InferenceEngine>, InferenceError> {
            Err(InferenceError::Load {
                path: path.to_path_buf(),
                reason: "not available".to_string(),
            })
        }
    }

    fn runtime_with(config: PipelineConfig, dir: &Path) -> PipelineRuntime {
        let recorder = FailureRecorder::open(dir.join("svc.log"), false).unwrap();
        PipelineRuntime::new(
            config,
            Arc::new(SqliteStore::new(dir.join("triage.db"))),
            Arc::new(NoLoader),
            Arc::new(ZeroEngine),
            recorder,
        )
    }

    #[tokio::test]
    async fn test_registers_all_tasks() {
        let dir = tempdir().unwrap();
        let runtime = runtime_with(PipelineConfig::default(), dir.path());

        assert_eq!(
            runtime.build_scheduler().task_names(),
            vec!["read", "score", "write", "reload-check", "log-rotate", "history-dump"]
        );
    }

    #[tokio::test]
    async fn test_history_task_optional() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            enable_history_dump: false,
            ..PipelineConfig::default()
        };
        let runtime = runtime_with(config, dir.path());

        assert_eq!(runtime.build_scheduler().task_names().len(), 5);
    }

    #[tokio::test]
    async fn test_initial_load_failure_surfaces() {
        let dir = tempdir().unwrap();
        let result = load_initial_model(Arc::new(NoLoader), &dir.path().join("model.json")).await;
        assert!(matches!(result, Err(InferenceError::Load { .. })));
    }

    #[test]
    fn test_reload_delay_backs_off() {
        let poll = Duration::from_millis(500);
        assert_eq!(reload_delay(poll, 0), poll);
        assert_eq!(reload_delay(poll, 2), Duration::from_secs(2));
        assert_eq!(reload_delay(poll, 20), Duration::from_secs(32));
    }

    struct CountingNoLoader(Arc<AtomicUsize>);

    impl ModelLoader for CountingNoLoader {
        fn load(&self, path: &Path) -> Result<Arc<dyn InferenceEngine>, InferenceError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            NoLoader.load(path)
        }
    }

    #[tokio::test]
    async fn test_repeated_reload_failure_freezes_once() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            model_path: dir.path().join("model.json"),
            update_dir: dir.path().join("updates"),
            reload_poll_ms: 10,
            ..PipelineConfig::default()
        };
        let loads = Arc::new(AtomicUsize::new(0));
        let runtime = PipelineRuntime::new(
            config,
            Arc::new(SqliteStore::new(dir.path().join("triage.db"))),
            Arc::new(CountingNoLoader(loads.clone())),
            Arc::new(ZeroEngine),
            FailureRecorder::open(dir.path().join("svc.log"), false).unwrap(),
        );
        runtime.state().pause();

        let polled = tokio::time::timeout(Duration::from_millis(400), runtime.poll_reloads()).await;
        assert!(polled.is_err(), "poll loop keeps running while paused");

        assert!(loads.load(Ordering::SeqCst) >= 2);
        let frozen = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with("_err"))
            .count();
        assert_eq!(frozen, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let dir = tempdir().unwrap();
        let runtime = runtime_with(PipelineConfig::default(), dir.path());
        let shutdown = runtime.shutdown_token();

        let handle = tokio::spawn(runtime.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();

        handle.await.unwrap().unwrap();
    }
}
