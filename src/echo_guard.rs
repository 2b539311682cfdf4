//! Mutual exclusion between speech capture and speech playback.
//!
//! The guard is a single shared flag. Only the orchestrator writes it; the
//! capture adapter reads it so that no code path can open the microphone
//! while the assistant's own voice is playing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared `speaking` flag. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct EchoGuard {
    speaking: Arc<AtomicBool>,
}

impl EchoGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark playback as owning the audio path.
    ///
    /// Must be called before capture is interrupted and before playback
    /// starts. Returns `false` if the guard was already engaged.
    pub fn engage(&self) -> bool {
        !self.speaking.swap(true, Ordering::SeqCst)
    }

    /// Release the audio path. Returns `false` if it was not engaged.
    pub fn release(&self) -> bool {
        self.speaking.swap(false, Ordering::SeqCst)
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let guard = EchoGuard::new();
        let observer = guard.clone();
        assert!(!observer.is_speaking());

        assert!(guard.engage());
        assert!(observer.is_speaking());

        assert!(guard.release());
        assert!(!observer.is_speaking());
    }

    #[test]
    fn double_engage_and_release_are_harmless() {
        let guard = EchoGuard::new();
        assert!(guard.engage());
        assert!(!guard.engage());
        assert!(guard.is_speaking());
        assert!(guard.release());
        assert!(!guard.release());
        assert!(!guard.is_speaking());
    }
}
