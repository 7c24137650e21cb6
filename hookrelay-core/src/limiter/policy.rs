//! Per-class admission policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::event::PriorityClass;

/// What happens to an event that arrives after its class spent the
/// window's budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Discard it.
    Drop,
    /// Keep only the latest event per (source, class) until the next
    /// window.
    Coalesce,
    /// Keep every event, in order, until budget is available. Non-lossy
    /// up to `max_queued`.
    Queue,
}

impl OverflowPolicy {
    pub fn is_lossy(self) -> bool {
        !matches!(self, OverflowPolicy::Queue)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassPolicy {
    /// Events admitted per window.
    pub budget: u32,
    pub overflow: OverflowPolicy,
    /// Bound on deferred events (queued events or coalescing slots).
    pub max_queued: usize,
}

impl ClassPolicy {
    pub const fn new(budget: u32, overflow: OverflowPolicy) -> Self {
        Self {
            budget,
            overflow,
            max_queued: 256,
        }
    }
}

/// Inputs to the limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterConfig {
    /// Length of one budget window.
    pub window: Duration,
    /// Indexed by [`PriorityClass::index`].
    pub classes: [ClassPolicy; PriorityClass::COUNT],
    /// Capacity of the producer → limiter queue. A full queue drops.
    pub submit_capacity: usize,
    /// Attempts per event when the transport reports backpressure.
    pub send_retries: u32,
}

impl LimiterConfig {
    pub fn policy(&self, class: PriorityClass) -> &ClassPolicy {
        &self.classes[class.index()]
    }

    pub fn policy_mut(&mut self, class: PriorityClass) -> &mut ClassPolicy {
        &mut self.classes[class.index()]
    }

    /// Same policy for every class; handy in tests.
    pub fn uniform(window: Duration, policy: ClassPolicy) -> Self {
        Self {
            window,
            classes: [policy; PriorityClass::COUNT],
            ..Self::default()
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(100),
            classes: [
                ClassPolicy::new(50, OverflowPolicy::Queue),
                ClassPolicy::new(20, OverflowPolicy::Coalesce),
                ClassPolicy::new(10, OverflowPolicy::Coalesce),
                ClassPolicy::new(5, OverflowPolicy::Drop),
            ],
            submit_capacity: 1024,
            send_retries: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_priority() {
        let cfg = LimiterConfig::default();
        assert_eq!(
            cfg.policy(PriorityClass::Critical).overflow,
            OverflowPolicy::Queue
        );
        assert_eq!(
            cfg.policy(PriorityClass::Background).overflow,
            OverflowPolicy::Drop
        );
        assert!(cfg.policy(PriorityClass::Focus).overflow.is_lossy());
    }

    #[test]
    fn uniform_applies_to_every_class() {
        let cfg = LimiterConfig::uniform(
            Duration::from_millis(10),
            ClassPolicy::new(3, OverflowPolicy::Drop),
        );
        for class in PriorityClass::ALL {
            assert_eq!(cfg.policy(class).budget, 3);
        }
        assert_eq!(cfg.submit_capacity, LimiterConfig::default().submit_capacity);
    }
}
