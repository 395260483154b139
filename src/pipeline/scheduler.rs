//! Fixed-delay scheduler for the pipeline's periodic tasks
//!
//! Each registered task runs in its own tokio task: wait `interval`, run one
//! cycle, repeat. The next wait only starts after the cycle finishes, so a
//! slow cycle self-throttles instead of overlapping with itself.
//!
//! Shutdown is a single `CancellationToken` broadcast. A cancelled task stops
//! waiting for its next tick; a cycle already running is allowed to finish.
//!
//! Every cycle runs inside a failure boundary: errors are handed to the
//! `FailureRecorder` and the task keeps ticking. A `FatalIo` error (from the
//! task or from the recorder itself) cancels the shutdown token and ends
//! the task with that error.

use super::error::PipelineError;
use super::recorder::FailureRecorder;
use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One autonomous periodic unit of work
#[async_trait]
pub trait PeriodicTask: Send {
    fn name(&self) -> &'static str;

    /// Delay between the end of one cycle and the start of the next
    fn interval(&self) -> Duration;

    /// Run one cycle
    async fn run_once(&mut self) -> Result<(), PipelineError>;
}

/// Registers named tasks and drives them until shutdown
pub struct Scheduler {
    tasks: Vec<Box<dyn PeriodicTask>>,
    recorder: FailureRecorder,
    shutdown: CancellationToken,
}

/// Handle to one running task loop
pub struct TaskHandle {
    pub name: &'static str,
    pub handle: JoinHandle<Result<(), PipelineError>>,
}

impl Scheduler {
    pub fn new(recorder: FailureRecorder, shutdown: CancellationToken) -> Self {
        Self {
            tasks: Vec::new(),
            recorder,
            shutdown,
        }
    }

    pub fn register(&mut self, task: Box<dyn PeriodicTask>) -> &mut Self {
        log::info!(
            "   ├─ Registered task '{}' (every {}s)",
            task.name(),
            task.interval().as_secs_f64()
        );
        self.tasks.push(task);
        self
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|t| t.name()).collect()
    }

    /// Spawn every registered task onto the tokio runtime
    pub fn spawn_all(self) -> Vec<TaskHandle> {
        log::info!("⏰ Starting {} periodic tasks", self.tasks.len());

        self.tasks
            .into_iter()
            .map(|task| {
                let name = task.name();
                let recorder = self.recorder.clone();
                let shutdown = self.shutdown.clone();
                TaskHandle {
                    name,
                    handle: tokio::spawn(run_task_loop(task, recorder, shutdown)),
                }
            })
            .collect()
    }
}

/// Wait for every task loop to end, returning the first fatal error
pub async fn join_all(handles: Vec<TaskHandle>) -> Result<(), PipelineError> {
    let mut first_fatal = None;

    for TaskHandle { name, handle } in handles {
        match handle.await {
            Ok(Ok(())) => log::debug!("Task '{}' stopped", name),
            Ok(Err(e)) => {
                log::error!("❌ Task '{}' ended with fatal error: {}", name, e);
                first_fatal.get_or_insert(e);
            }
            Err(e) => log::error!("❌ Task '{}' panicked: {}", name, e),
        }
    }

    match first_fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn run_task_loop(
    mut task: Box<dyn PeriodicTask>,
    recorder: FailureRecorder,
    shutdown: CancellationToken,
) -> Result<(), PipelineError> {
    let name = task.name();
    let interval = task.interval();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                log::info!("🛑 Task '{}' shutting down", name);
                return Ok(());
            }
            _ = tokio::time::sleep(interval) => {}
        }

        // Not raced against shutdown: an in-flight cycle always completes
        let result = task.run_once().await;

        if let Err(e) = result {
            if let Err(fatal) = handle_failure(name, e, &recorder) {
                log::error!("💀 Fatal error in task '{}', shutting down pipeline", name);
                shutdown.cancel();
                return Err(fatal);
            }
        }
    }
}

/// Failure boundary shared by task loops and the main run loop
///
/// Records `error` and swallows it, unless it (or recording it) is fatal.
pub fn handle_failure(
    task: &str,
    error: PipelineError,
    recorder: &FailureRecorder,
) -> Result<(), PipelineError> {
    if error.is_fatal() {
        // Recorder cannot be trusted to rotate; leave the log as it is
        log::error!("❌ [{}] {}", task, error);
        return Err(error);
    }

    log::error!("❌ [{}] {}: {}", task, error.kind(), error);

    match recorder.record_failure(task, &error) {
        Ok(frozen) => {
            log::warn!("📄 Log frozen to {}", frozen.display());
            Ok(())
        }
        Err(fatal) => Err(fatal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::InferenceError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    struct CountingTask {
        runs: Arc<AtomicUsize>,
        fail_every: Option<usize>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        work: Duration,
    }

    #[async_trait]
    impl PeriodicTask for CountingTask {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn run_once(&mut self) -> Result<(), PipelineError> {
            let now_running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now_running, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            match self.fail_every {
                Some(n) if run % n == 0 => Err(InferenceError::NonFinite { index: 0 }.into()),
                _ => Ok(()),
            }
        }
    }

    fn counting_task(fail_every: Option<usize>, work: Duration) -> (CountingTask, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let task = CountingTask {
            runs: runs.clone(),
            fail_every,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: max_in_flight.clone(),
            work,
        };
        (task, runs, max_in_flight)
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_ticks_do_not_stop_task() {
        let dir = tempdir().unwrap();
        let recorder = FailureRecorder::open(dir.path().join("svc.log"), false).unwrap();
        let shutdown = CancellationToken::new();

        let (task, runs, _) = counting_task(Some(2), Duration::from_millis(1));
        let mut scheduler = Scheduler::new(recorder, shutdown.clone());
        scheduler.register(Box::new(task));
        let handles = scheduler.spawn_all();

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        join_all(handles).await.unwrap();

        // Every second run failed, yet the task kept going
        assert!(runs.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_delay_never_overlaps() {
        let dir = tempdir().unwrap();
        let recorder = FailureRecorder::open(dir.path().join("svc.log"), false).unwrap();
        let shutdown = CancellationToken::new();

        // Work takes 5x the interval
        let (task, runs, max_in_flight) = counting_task(None, Duration::from_millis(50));
        let mut scheduler = Scheduler::new(recorder, shutdown.clone());
        scheduler.register(Box::new(task));
        let handles = scheduler.spawn_all();

        tokio::time::sleep(Duration::from_millis(600)).await;
        shutdown.cancel();
        join_all(handles).await.unwrap();

        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        // 60ms per cycle (10ms delay + 50ms work)
        assert!(runs.load(Ordering::SeqCst) <= 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_lets_in_flight_cycle_finish() {
        let dir = tempdir().unwrap();
        let recorder = FailureRecorder::open(dir.path().join("svc.log"), false).unwrap();
        let shutdown = CancellationToken::new();

        let (task, runs, _) = counting_task(None, Duration::from_millis(100));
        let mut scheduler = Scheduler::new(recorder, shutdown.clone());
        scheduler.register(Box::new(task));
        let handles = scheduler.spawn_all();

        // Cancel while the first cycle is mid-work
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        join_all(handles).await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    struct FatalTask;

    #[async_trait]
    impl PeriodicTask for FatalTask {
        fn name(&self) -> &'static str {
            "fatal"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn run_once(&mut self) -> Result<(), PipelineError> {
            Err(PipelineError::FatalIo {
                path: "svc.log".into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_broadcasts_shutdown() {
        let dir = tempdir().unwrap();
        let recorder = FailureRecorder::open(dir.path().join("svc.log"), false).unwrap();
        let shutdown = CancellationToken::new();

        let (task, _, _) = counting_task(None, Duration::from_millis(1));
        let mut scheduler = Scheduler::new(recorder, shutdown.clone());
        scheduler.register(Box::new(task)).register(Box::new(FatalTask));
        assert_eq!(scheduler.task_names(), vec!["counting", "fatal"]);
        let handles = scheduler.spawn_all();

        let result = join_all(handles).await;
        assert!(shutdown.is_cancelled());
        assert!(matches!(result, Err(PipelineError::FatalIo { .. })));
    }
}
