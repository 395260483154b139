//! Process-wide pipeline state shared by every task
//!
//! Mutated only by the hot-reload path, read by every task at the top of
//! each cycle. Never persisted.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Reload state machine, derived from the pause flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadPhase {
    Active,
    Reloading,
}

/// Shared pause flag and model version
///
/// Passed by `Arc` into each task. Plain atomics: no lock is ever held
/// across a store or inference call.
#[derive(Debug)]
pub struct PipelineState {
    paused: AtomicBool,
    current_model_version: AtomicU64,
}

impl PipelineState {
    /// Fresh state: not paused, model version 1 (the startup model)
    pub fn new() -> Self {
        Self::with_version(1)
    }

    pub fn with_version(version: u64) -> Self {
        Self {
            paused: AtomicBool::new(false),
            current_model_version: AtomicU64::new(version),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn current_model_version(&self) -> u64 {
        self.current_model_version.load(Ordering::Acquire)
    }

    /// Increment the model version, returning the new value
    pub fn bump_model_version(&self) -> u64 {
        self.current_model_version.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn phase(&self) -> ReloadPhase {
        if self.is_paused() {
            ReloadPhase::Reloading
        } else {
            ReloadPhase::Active
        }
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = PipelineState::new();
        assert!(!state.is_paused());
        assert_eq!(state.current_model_version(), 1);
        assert_eq!(state.phase(), ReloadPhase::Active);
    }

    #[test]
    fn test_pause_and_bump() {
        let state = PipelineState::new();
        state.pause();
        assert_eq!(state.phase(), ReloadPhase::Reloading);
        assert_eq!(state.bump_model_version(), 2);
        assert_eq!(state.current_model_version(), 2);

        state.resume();
        assert_eq!(state.phase(), ReloadPhase::Active);
    }
}
