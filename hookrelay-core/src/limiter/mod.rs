//! Event rate limiter.
//!
//! Sits between event producers (hook trampolines on host threads) and the
//! transport. Every priority class gets its own per-window budget; events
//! over budget are dropped, coalesced, or queued according to the class
//! policy. Nothing is buffered across a broken channel: pending events are
//! discarded and a single loss signal is sent on the next channel.
//!
//! ```text
//!  host threads ──try_send──► LimiterService ──► EventSink (Channel)
//!                              └ EventRateLimiter
//!                                 ├ RateBudget
//!                                 ├ ready queues   (per class, FIFO)
//!                                 └ deferred slots (per class, FIFO)
//! ```

pub mod budget;
pub mod policy;

mod engine;
mod service;

use std::sync::atomic::{AtomicU64, Ordering};

pub use budget::RateBudget;
pub use engine::EventRateLimiter;
pub use policy::{ClassPolicy, LimiterConfig, OverflowPolicy};
pub use service::{EventSink, LimiterHandle, LimiterService};

use crate::event::Event;
use crate::flags::FrameFlags;

// ── Admission ────────────────────────────────────────────────────

/// Decision taken for one offered event. Not an error: over-budget
/// outcomes are normal operation and are only counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Within budget; ready to send.
    Admitted,
    /// Replaced an older deferred event with the same source and class.
    Coalesced,
    /// Deferred to a later window.
    Queued,
    Dropped,
}

/// An event cleared for sending, with the frame flags describing how it
/// got there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    pub event: Event,
    pub flags: FrameFlags,
}

impl Admitted {
    pub(crate) fn immediate(event: Event) -> Self {
        Self {
            event,
            flags: FrameFlags::empty(),
        }
    }
}

// ── LimiterStats ─────────────────────────────────────────────────

/// Monotonic counters shared by the limiter task and its handles.
#[derive(Debug, Default)]
pub struct LimiterStats {
    submitted: AtomicU64,
    rejected: AtomicU64,
    admitted: AtomicU64,
    coalesced: AtomicU64,
    queued: AtomicU64,
    dropped: AtomicU64,
    discarded: AtomicU64,
    sent: AtomicU64,
}

/// Point-in-time copy of [`LimiterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Calls to `submit`.
    pub submitted: u64,
    /// Submissions refused because the entry queue was full.
    pub rejected: u64,
    /// Events moved to a ready queue (directly or by promotion).
    pub admitted: u64,
    /// Events that replaced a deferred event.
    pub coalesced: u64,
    /// Events deferred to a later window.
    pub queued: u64,
    /// Events dropped by policy, overflow, a down link or failed sends.
    pub dropped: u64,
    /// Pending events discarded when a channel broke.
    pub discarded: u64,
    /// Events handed to the transport.
    pub sent: u64,
}

impl LimiterStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record(&self, admission: Admission) {
        let counter = match admission {
            Admission::Admitted => &self.admitted,
            Admission::Coalesced => &self.coalesced,
            Admission::Queued => &self.queued,
            Admission::Dropped => &self.dropped,
        };
        Self::bump(counter, 1);
    }
}
