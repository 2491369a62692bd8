//! Remote-fault debounce.
//!
//! Repeated transport faults inside the debounce window are treated as one
//! event: no new user-visible error, no repeated fallback. The timestamp
//! advances on every observation and on every migration attempt, so a storm
//! of faults keeps coalescing until the link has been quiet for the full
//! window.

use std::time::{Duration, Instant};

/// Default debounce window between fallback-triggering faults.
pub const FAULT_DEBOUNCE: Duration = Duration::from_secs(3);

/// What the session should do with an observed fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Within the window of the previous event: swallow it.
    Coalesced,
    /// Quiet period elapsed: switch this session back to local processing.
    FallBack,
}

/// Time-since-last-event state for one window.
#[derive(Debug, Clone)]
pub struct FaultDebounce {
    window: Duration,
    last: Instant,
}

impl FaultDebounce {
    /// Start debouncing at `now` (session open counts as the first event).
    pub fn new(now: Instant) -> Self {
        Self::with_window(FAULT_DEBOUNCE, now)
    }

    pub fn with_window(window: Duration, now: Instant) -> Self {
        Self { window, last: now }
    }

    /// Record a fault and decide whether it triggers a fallback.
    pub fn observe(&mut self, now: Instant) -> FaultAction {
        let action = if now.duration_since(self.last) > self.window {
            FaultAction::FallBack
        } else {
            FaultAction::Coalesced
        };
        self.last = now;
        action
    }

    /// Record a migration attempt so faults right after it stay quiet.
    pub fn note_migration(&mut self, now: Instant) {
        self.last = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seconds(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_fault_within_window_coalesces() {
        let start = Instant::now();
        let mut debounce = FaultDebounce::new(start);
        assert_eq!(debounce.observe(start + seconds(1)), FaultAction::Coalesced);
    }

    #[test]
    fn test_fault_after_window_falls_back() {
        let start = Instant::now();
        let mut debounce = FaultDebounce::new(start);
        assert_eq!(debounce.observe(start + seconds(5)), FaultAction::FallBack);
    }

    #[test]
    fn test_storm_keeps_coalescing() {
        let start = Instant::now();
        let mut debounce = FaultDebounce::new(start);
        assert_eq!(debounce.observe(start + seconds(4)), FaultAction::FallBack);
        // Every subsequent fault arrives within 3s of the previous one.
        for step in 5..12 {
            assert_eq!(
                debounce.observe(start + seconds(step)),
                FaultAction::Coalesced
            );
        }
        // Quiet gap, then the next fault fires again.
        assert_eq!(debounce.observe(start + seconds(20)), FaultAction::FallBack);
    }

    #[test]
    fn test_migration_resets_window() {
        let start = Instant::now();
        let mut debounce = FaultDebounce::new(start);
        debounce.note_migration(start + seconds(10));
        assert_eq!(
            debounce.observe(start + seconds(11)),
            FaultAction::Coalesced
        );
        assert_eq!(debounce.observe(start + seconds(15)), FaultAction::FallBack);
    }

    #[test]
    fn test_exact_boundary_coalesces() {
        let start = Instant::now();
        let mut debounce = FaultDebounce::new(start);
        // The window is exclusive: exactly 3s since the last event coalesces.
        assert_eq!(debounce.observe(start + seconds(3)), FaultAction::Coalesced);
    }
}
