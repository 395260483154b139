//! Inference engine seam and the hot-swappable model slot
//!
//! The engine is an opaque `score(batch) -> scores` function. `ModelSlot`
//! pairs the loaded engine with the model version it was loaded for; the
//! scoring task only invokes the engine while holding a read guard whose
//! version matches `PipelineState`, and the reload path bumps the version
//! under the write guard.

use super::error::InferenceError;
use super::types::WorkItem;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, RwLock, RwLockWriteGuard};

/// Stateless scoring function over a batch
pub trait InferenceEngine: Send + Sync {
    /// Score every item; the result must have the same length and order as `batch`
    fn score(&self, batch: &[WorkItem]) -> Result<Vec<f64>, InferenceError>;

    /// Human-readable description for log lines
    fn describe(&self) -> String {
        "inference engine".to_string()
    }
}

/// Loads an engine from a model artifact on disk
pub trait ModelLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Arc<dyn InferenceEngine>, InferenceError>;
}

/// Engine tagged with the model version it serves
pub struct LoadedModel {
    pub version: u64,
    pub engine: Arc<dyn InferenceEngine>,
}

/// Shared, swappable handle to the current engine
#[derive(Clone)]
pub struct ModelSlot {
    inner: Arc<RwLock<LoadedModel>>,
}

impl ModelSlot {
    pub fn new(engine: Arc<dyn InferenceEngine>, version: u64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(LoadedModel { version, engine })),
        }
    }

    /// Shared access for one inference call; movable into a blocking worker
    pub async fn read_owned(&self) -> OwnedRwLockReadGuard<LoadedModel> {
        self.inner.clone().read_owned().await
    }

    /// Exclusive access; waits for every in-flight inference to finish
    pub async fn write(&self) -> RwLockWriteGuard<'_, LoadedModel> {
        self.inner.write().await
    }

    pub async fn version(&self) -> u64 {
        self.inner.read().await.version
    }

    /// Replace the engine and tag it with `version`
    pub async fn install(&self, engine: Arc<dyn InferenceEngine>, version: u64) {
        let mut slot = self.inner.write().await;
        slot.engine = engine;
        slot.version = version;
    }
}

/// Check an engine's output against its input batch
///
/// Returns the scores unchanged when they are index-alignable.
pub fn validate_scores(expected: usize, scores: Vec<f64>) -> Result<Vec<f64>, InferenceError> {
    if scores.len() != expected {
        return Err(InferenceError::ShapeMismatch {
            expected,
            actual: scores.len(),
        });
    }

    if let Some(index) = scores.iter().position(|s| !s.is_finite()) {
        return Err(InferenceError::NonFinite { index });
    }

    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ConstantEngine(f64);

    impl InferenceEngine for ConstantEngine {
        fn score(&self, batch: &[WorkItem]) -> Result<Vec<f64>, InferenceError> {
            Ok(vec![self.0; batch.len()])
        }
    }

    #[test]
    fn test_validate_scores() {
        assert_eq!(validate_scores(2, vec![1.0, 2.0]).unwrap(), vec![1.0, 2.0]);

        match validate_scores(3, vec![1.0]) {
            Err(InferenceError::ShapeMismatch { expected, actual }) => {
                assert_eq!(expected, 3);
                assert_eq!(actual, 1);
            }
            other => panic!("expected shape mismatch, got {:?}", other),
        }

        match validate_scores(2, vec![1.0, f64::NAN]) {
            Err(InferenceError::NonFinite { index }) => assert_eq!(index, 1),
            other => panic!("expected non-finite error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_install_replaces_engine_and_version() {
        let slot = ModelSlot::new(Arc::new(ConstantEngine(1.0)), 1);
        assert_eq!(slot.version().await, 1);

        slot.install(Arc::new(ConstantEngine(4.0)), 2).await;

        let guard = slot.read_owned().await;
        assert_eq!(guard.version, 2);
        assert_eq!(guard.engine.score(&[]).unwrap(), Vec::<f64>::new());
    }
}
