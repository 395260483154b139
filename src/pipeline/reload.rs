//! Hot model reload
//!
//! Two halves, run from different places:
//!
//! - `check_for_update` (reload-check task, Active → Reloading): looks for a
//!   single `*.<ext>` artifact in the drop directory, renames it over the
//!   model path (old artifact kept as `<model>.prev`), pauses the pipeline
//!   and bumps the model version. Runs under the slot's write guard, so no
//!   inference call is in flight while the version moves.
//! - `complete_pending_reload` (main run loop, Reloading → Active): loads the
//!   new artifact on the blocking pool, installs it tagged with the current
//!   version, and resumes. On a failed load the `.prev` artifact is put back
//!   and the pipeline stays paused so the next poll loads it.

use super::error::{ConfigError, InferenceError, PipelineError};
use super::inference::{ModelLoader, ModelSlot};
use super::scheduler::PeriodicTask;
use super::state::PipelineState;
use async_trait::async_trait;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Find the single reload artifact in `dir`
///
/// `Ok(None)` when there is none (or `dir` does not exist), an error when
/// there is more than one.
pub fn find_reload_candidate(dir: &Path, extension: &str) -> Result<Option<PathBuf>, ConfigError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ConfigError::InvalidValue(format!(
                "cannot read update directory {}: {}",
                dir.display(),
                e
            )))
        }
    };

    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| path.extension().is_some_and(|ext| ext == extension))
        .collect();

    match candidates.len() {
        0 => Ok(None),
        1 => Ok(candidates.pop()),
        count => Err(ConfigError::MultipleReloadCandidates {
            count,
            dir: dir.to_path_buf(),
        }),
    }
}

/// `<model>.prev`
pub fn backup_path(model_path: &Path) -> PathBuf {
    let mut name = OsString::from(model_path.as_os_str());
    name.push(".prev");
    PathBuf::from(name)
}

pub struct HotReloadCoordinator {
    state: Arc<PipelineState>,
    slot: ModelSlot,
    loader: Arc<dyn ModelLoader>,
    model_path: PathBuf,
    update_dir: PathBuf,
    extension: String,
}

impl HotReloadCoordinator {
    pub fn new(
        state: Arc<PipelineState>,
        slot: ModelSlot,
        loader: Arc<dyn ModelLoader>,
        model_path: impl Into<PathBuf>,
        update_dir: impl Into<PathBuf>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            state,
            slot,
            loader,
            model_path: model_path.into(),
            update_dir: update_dir.into(),
            extension: extension.into(),
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    /// Active → Reloading if exactly one candidate is waiting
    ///
    /// Returns the new model version when a swap happened.
    pub async fn check_for_update(&self) -> Result<Option<u64>, PipelineError> {
        if self.state.is_paused() {
            // A reload is already pending
            return Ok(None);
        }

        let Some(candidate) = find_reload_candidate(&self.update_dir, &self.extension)? else {
            return Ok(None);
        };

        log::info!("🔄 Model update found: {}", candidate.display());

        // Waits for any in-flight inference call to finish
        let _slot = self.slot.write().await;

        self.swap_artifact(&candidate)?;
        self.state.pause();
        let version = self.state.bump_model_version();

        log::info!("⏸️  Pipeline paused for reload (model v{})", version);
        Ok(Some(version))
    }

    /// Back up the current artifact, then move the candidate over it
    ///
    /// The backup is a hard link (or a copy), so the model path is replaced
    /// by a single rename and never goes missing.
    fn swap_artifact(&self, candidate: &Path) -> Result<(), ConfigError> {
        if self.model_path.exists() {
            let backup = backup_path(&self.model_path);
            let swap_err = |source| ConfigError::ArtifactSwap {
                path: self.model_path.clone(),
                source,
            };

            if backup.exists() {
                fs::remove_file(&backup).map_err(swap_err)?;
            }
            if let Err(e) = fs::hard_link(&self.model_path, &backup) {
                log::debug!("hard link to {} failed ({}), copying", backup.display(), e);
                fs::copy(&self.model_path, &backup).map_err(swap_err)?;
            }
        }

        fs::rename(candidate, &self.model_path).map_err(|source| {
            log::error!(
                "❌ Failed to move {} onto {}: {}",
                candidate.display(),
                self.model_path.display(),
                source
            );
            ConfigError::ArtifactSwap {
                path: candidate.to_path_buf(),
                source,
            }
        })
    }

    /// Reloading → Active; no-op while not paused
    pub async fn complete_pending_reload(&self) -> Result<bool, PipelineError> {
        if !self.state.is_paused() {
            return Ok(false);
        }

        let version = self.state.current_model_version();
        let loader = self.loader.clone();
        let path = self.model_path.clone();

        let loaded = tokio::task::spawn_blocking(move || loader.load(&path))
            .await
            .map_err(|e| InferenceError::Worker(e.to_string()))?;

        match loaded {
            Ok(engine) => {
                self.slot.install(engine, version).await;
                self.state.resume();
                log::info!("✅ Model v{} loaded, pipeline resumed", version);
                Ok(true)
            }
            Err(e) => {
                let backup = backup_path(&self.model_path);
                if backup.exists() {
                    log::warn!(
                        "↩️  Restoring previous model from {}",
                        backup.display()
                    );
                    fs::rename(&backup, &self.model_path).map_err(|source| {
                        ConfigError::ArtifactSwap {
                            path: backup.clone(),
                            source,
                        }
                    })?;
                }
                Err(e.into())
            }
        }
    }
}

/// Periodic check of the drop directory
pub struct ReloadCheckTask {
    coordinator: Arc<HotReloadCoordinator>,
    interval: Duration,
}

impl ReloadCheckTask {
    pub fn new(coordinator: Arc<HotReloadCoordinator>, interval: Duration) -> Self {
        Self {
            coordinator,
            interval,
        }
    }
}

#[async_trait]
impl PeriodicTask for ReloadCheckTask {
    fn name(&self) -> &'static str {
        "reload-check"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&mut self) -> Result<(), PipelineError> {
        self.coordinator.check_for_update().await?;
        Ok(())
    }
}
