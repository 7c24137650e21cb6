//! Fixed-window admission budget.
//!
//! Counts admissions per priority class within the current window and
//! resets every counter together when a boundary is crossed. Callers pass
//! `Instant`s explicitly so the arithmetic is testable without sleeping.

use std::time::{Duration, Instant};

use crate::event::PriorityClass;

#[derive(Debug, Clone)]
pub struct RateBudget {
    window: Duration,
    limits: [u32; PriorityClass::COUNT],
    counts: [u32; PriorityClass::COUNT],
    window_start: Instant,
    /// Number of windows started since construction.
    generation: u64,
}

impl RateBudget {
    pub fn new(window: Duration, limits: [u32; PriorityClass::COUNT], now: Instant) -> Self {
        Self {
            // A zero window would make every instant a boundary.
            window: window.max(Duration::from_millis(1)),
            limits,
            counts: [0; PriorityClass::COUNT],
            window_start: now,
            generation: 0,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn window_start(&self) -> Instant {
        self.window_start
    }

    pub fn next_boundary(&self) -> Instant {
        self.window_start + self.window
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn limit(&self, class: PriorityClass) -> u32 {
        self.limits[class.index()]
    }

    /// Admissions charged to `class` in the current window.
    pub fn count(&self, class: PriorityClass) -> u32 {
        self.counts[class.index()]
    }

    pub fn remaining(&self, class: PriorityClass) -> u32 {
        self.limit(class).saturating_sub(self.count(class))
    }

    /// Charge one admission if the class has budget left.
    pub fn try_take(&mut self, class: PriorityClass) -> bool {
        let i = class.index();
        if self.counts[i] < self.limits[i] {
            self.counts[i] += 1;
            true
        } else {
            false
        }
    }

    /// Start a new window if `now` is at or past the boundary.
    ///
    /// Windows stay aligned to the original start: after a long idle gap
    /// the start jumps by whole windows. Returns `true` if counters were
    /// reset.
    pub fn roll(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window {
            return false;
        }
        // Snap back to the last aligned boundary at or before `now`. The
        // remainder is shorter than one window, so it always fits.
        let rem = elapsed.as_nanos() % self.window.as_nanos();
        let rem = Duration::new((rem / 1_000_000_000) as u64, (rem % 1_000_000_000) as u32);
        self.window_start = now - rem;
        self.counts = [0; PriorityClass::COUNT];
        self.generation += 1;
        true
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(limit: u32, now: Instant) -> RateBudget {
        RateBudget::new(Duration::from_millis(100), [limit; PriorityClass::COUNT], now)
    }

    #[test]
    fn take_until_exhausted() {
        let t0 = Instant::now();
        let mut b = budget(2, t0);
        assert!(b.try_take(PriorityClass::Normal));
        assert!(b.try_take(PriorityClass::Normal));
        assert!(!b.try_take(PriorityClass::Normal));
        assert_eq!(b.remaining(PriorityClass::Normal), 0);
        // Other classes are independent.
        assert!(b.try_take(PriorityClass::Focus));
    }

    #[test]
    fn roll_resets_all_classes_at_boundary() {
        let t0 = Instant::now();
        let mut b = budget(1, t0);
        b.try_take(PriorityClass::Normal);
        b.try_take(PriorityClass::Critical);

        assert!(!b.roll(t0 + Duration::from_millis(99)));
        assert_eq!(b.count(PriorityClass::Normal), 1);

        assert!(b.roll(t0 + Duration::from_millis(100)));
        for class in PriorityClass::ALL {
            assert_eq!(b.count(class), 0);
        }
        assert_eq!(b.generation(), 1);
    }

    #[test]
    fn idle_gap_keeps_alignment() {
        let t0 = Instant::now();
        let mut b = budget(1, t0);
        assert!(b.roll(t0 + Duration::from_millis(350)));
        assert_eq!(b.window_start(), t0 + Duration::from_millis(300));
        assert_eq!(b.next_boundary(), t0 + Duration::from_millis(400));
    }

    #[test]
    fn very_long_idle_gap_still_enforces_budget() {
        let t0 = Instant::now();
        let window = Duration::from_millis(1);
        let mut b = RateBudget::new(window, [2; PriorityClass::COUNT], t0);
        let now = t0 + Duration::from_millis(u64::from(u32::MAX) + 6);

        assert!(b.roll(now));
        assert_eq!(b.window_start(), now);

        let mut admitted = 0;
        for _ in 0..10 {
            b.roll(now);
            if b.try_take(PriorityClass::Normal) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 2);
        assert_eq!(b.generation(), 1);
    }

    #[test]
    fn zero_limit_admits_nothing() {
        let mut b = budget(0, Instant::now());
        assert!(!b.try_take(PriorityClass::Critical));
    }
}
