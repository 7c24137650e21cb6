//! Admission state machine. Synchronous and clock-free: every operation
//! that depends on time takes `now`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use super::{Admission, Admitted, LimiterConfig, LimiterStats, OverflowPolicy, RateBudget};
use crate::event::{Event, PriorityClass};
use crate::flags::FrameFlags;

/// An over-budget event waiting for a later window.
#[derive(Debug)]
struct Deferred {
    event: Event,
    /// How many older events this one replaced.
    replaced: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    /// No channel has been established yet. Drops are not reported.
    Awaiting,
    Up,
    /// The channel broke; drops accumulate into the loss report.
    Down,
}

/// Per-class admission with budgets, deferral, and loss accounting.
#[derive(Debug)]
pub struct EventRateLimiter {
    config: LimiterConfig,
    budget: RateBudget,
    ready: [VecDeque<Admitted>; PriorityClass::COUNT],
    deferred: [VecDeque<Deferred>; PriorityClass::COUNT],
    link: Link,
    /// Loss not yet reported on a channel.
    unreported: Option<u32>,
    /// Window generation in which each class last logged exhaustion.
    exhausted_logged: [Option<u64>; PriorityClass::COUNT],
    stats: Arc<LimiterStats>,
}

impl EventRateLimiter {
    /// A limiter whose link is up and whose first window starts at `now`.
    pub fn new(config: LimiterConfig, stats: Arc<LimiterStats>, now: Instant) -> Self {
        let limits = config.classes.map(|c| c.budget);
        Self {
            budget: RateBudget::new(config.window, limits, now),
            config,
            ready: Default::default(),
            deferred: Default::default(),
            link: Link::Up,
            unreported: None,
            exhausted_logged: [None; PriorityClass::COUNT],
            stats,
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<LimiterStats> {
        &self.stats
    }

    pub fn budget(&self) -> &RateBudget {
        &self.budget
    }

    pub fn next_boundary(&self) -> Instant {
        self.budget.next_boundary()
    }

    pub fn is_link_up(&self) -> bool {
        self.link == Link::Up
    }

    pub fn ready_len(&self) -> usize {
        self.ready.iter().map(VecDeque::len).sum()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.iter().map(VecDeque::len).sum()
    }

    /// Admissions charged to `class` in the current window.
    pub fn admitted_in_window(&self, class: PriorityClass) -> u32 {
        self.budget.count(class)
    }

    // ── Admission ────────────────────────────────────────────────

    /// Decide the fate of one event.
    pub fn offer(&mut self, event: Event, now: Instant) -> Admission {
        self.tick(now);

        let admission = if self.link != Link::Up {
            if self.link == Link::Down {
                self.add_unreported(1);
            }
            Admission::Dropped
        } else {
            self.admit(event)
        };
        self.stats.record(admission);
        admission
    }

    fn admit(&mut self, event: Event) -> Admission {
        let class = event.priority();
        let i = class.index();

        // A class with deferred events is behind; newcomers go after them.
        if self.deferred[i].is_empty() && self.budget.try_take(class) {
            self.ready[i].push_back(Admitted::immediate(event));
            return Admission::Admitted;
        }

        self.log_exhausted(class);
        let policy = *self.config.policy(class);
        let slots = &mut self.deferred[i];
        match policy.overflow {
            OverflowPolicy::Drop => Admission::Dropped,
            OverflowPolicy::Coalesce => {
                let key = event.coalesce_key();
                if let Some(slot) = slots.iter_mut().find(|d| d.event.coalesce_key() == key) {
                    slot.event = event;
                    slot.replaced += 1;
                    Admission::Coalesced
                } else if slots.len() < policy.max_queued {
                    slots.push_back(Deferred { event, replaced: 0 });
                    Admission::Queued
                } else {
                    Admission::Dropped
                }
            }
            OverflowPolicy::Queue => {
                if slots.len() < policy.max_queued {
                    slots.push_back(Deferred { event, replaced: 0 });
                    Admission::Queued
                } else {
                    debug!(%class, max = policy.max_queued, "queue full, dropping event");
                    Admission::Dropped
                }
            }
        }
    }

    fn log_exhausted(&mut self, class: PriorityClass) {
        let generation = self.budget.generation();
        let logged = &mut self.exhausted_logged[class.index()];
        if *logged != Some(generation) {
            *logged = Some(generation);
            debug!(
                %class,
                budget = self.budget.limit(class),
                "class budget exhausted for this window"
            );
        }
    }

    /// Advance the window if `now` crossed a boundary, then promote
    /// deferred events into the fresh budget.
    pub fn tick(&mut self, now: Instant) {
        if !self.budget.roll(now) {
            return;
        }
        for class in PriorityClass::ALL {
            let i = class.index();
            let mut promoted = 0u32;
            while !self.deferred[i].is_empty() && self.budget.try_take(class) {
                let Some(Deferred { event, replaced }) = self.deferred[i].pop_front() else {
                    break;
                };
                let mut flags = FrameFlags::DEFERRED;
                if replaced > 0 {
                    flags |= FrameFlags::COALESCED;
                }
                self.ready[i].push_back(Admitted { event, flags });
                self.stats.record(Admission::Admitted);
                promoted += 1;
            }
            if promoted > 0 {
                trace!(%class, promoted, "promoted deferred events");
            }
        }
    }

    // ── Draining ─────────────────────────────────────────────────

    /// Next event to send: highest class first, FIFO within a class.
    pub fn pop_ready(&mut self) -> Option<Admitted> {
        self.ready.iter_mut().find_map(VecDeque::pop_front)
    }

    pub fn drain_ready(&mut self) -> Vec<Admitted> {
        std::iter::from_fn(|| self.pop_ready()).collect()
    }

    /// Put back an event whose send did not complete, ahead of its class.
    pub(super) fn unpop(&mut self, admitted: Admitted) {
        self.ready[admitted.event.priority().index()].push_front(admitted);
    }

    // ── Link events ──────────────────────────────────────────────

    /// The channel broke. Discards every pending event and returns how
    /// many were discarded.
    pub fn channel_broken(&mut self) -> u32 {
        let discarded = self.discard_pending();
        self.link = Link::Down;
        self.add_unreported(discarded);
        discarded
    }

    /// A new channel is usable. The loss report, if any, becomes
    /// available through [`take_unreported`](Self::take_unreported).
    pub fn channel_restored(&mut self) {
        self.link = Link::Up;
    }

    /// No channel yet; drops before the first connection are not
    /// reported as loss.
    pub fn await_link(&mut self) {
        self.discard_pending();
        self.link = Link::Awaiting;
    }

    /// Loss to report on the current channel. Returns `None` while the
    /// link is down or after the report was taken.
    pub fn take_unreported(&mut self) -> Option<u32> {
        if self.link == Link::Up {
            self.unreported.take()
        } else {
            None
        }
    }

    /// Hand back a loss report whose delivery failed.
    pub fn add_unreported(&mut self, lost: u32) {
        self.unreported = Some(self.unreported.unwrap_or(0).saturating_add(lost));
    }

    /// Release everything. Returns a loss report that never reached a
    /// channel.
    pub fn teardown(&mut self) -> Option<u32> {
        self.discard_pending();
        self.link = Link::Awaiting;
        self.unreported.take()
    }

    fn discard_pending(&mut self) -> u32 {
        let mut n = 0usize;
        for q in &mut self.ready {
            n += q.len();
            q.clear();
        }
        for q in &mut self.deferred {
            n += q.len();
            q.clear();
        }
        if n > 0 {
            LimiterStats::bump(&self.stats.discarded, n as u64);
        }
        u32::try_from(n).unwrap_or(u32::MAX)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SourceId;
    use crate::limiter::ClassPolicy;
    use std::time::Duration;

    const WINDOW: Duration = Duration::from_millis(100);

    fn ev(source: u64, priority: PriorityClass, tag: u8) -> Event {
        Event::with_timestamp(SourceId(source), priority, tag as u64, vec![tag]).unwrap()
    }

    fn limiter(policy: ClassPolicy, t0: Instant) -> EventRateLimiter {
        EventRateLimiter::new(
            LimiterConfig::uniform(WINDOW, policy),
            Arc::new(LimiterStats::default()),
            t0,
        )
    }

    #[test]
    fn burst_of_fifty_admits_exactly_budget_with_drop() {
        let t0 = Instant::now();
        let mut l = limiter(ClassPolicy::new(10, OverflowPolicy::Drop), t0);
        let mut admitted = 0;
        let mut dropped = 0;
        for i in 0..50u8 {
            // 50 events spread over 10 ms.
            let now = t0 + Duration::from_micros(200 * i as u64);
            match l.offer(ev(1, PriorityClass::Normal, i), now) {
                Admission::Admitted => admitted += 1,
                Admission::Dropped => dropped += 1,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(admitted, 10);
        assert_eq!(dropped, 40);
        assert_eq!(l.admitted_in_window(PriorityClass::Normal), 10);

        l.tick(t0 + WINDOW);
        assert_eq!(l.admitted_in_window(PriorityClass::Normal), 0);
        assert_eq!(
            l.offer(ev(1, PriorityClass::Normal, 99), t0 + WINDOW),
            Admission::Admitted
        );
    }

    #[test]
    fn burst_of_fifty_coalesces_to_latest() {
        let t0 = Instant::now();
        let mut l = limiter(ClassPolicy::new(10, OverflowPolicy::Coalesce), t0);
        for i in 0..50u8 {
            l.offer(ev(1, PriorityClass::Normal, i), t0 + Duration::from_micros(200 * i as u64));
        }
        let snap = l.stats().snapshot();
        assert_eq!(snap.admitted, 10);
        assert_eq!(snap.queued + snap.coalesced, 40);
        assert_eq!(l.deferred_len(), 1);
        assert_eq!(l.drain_ready().len(), 10);

        l.tick(t0 + WINDOW);
        let promoted = l.drain_ready();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].event.payload(), &[49]);
        assert!(promoted[0].flags.contains(FrameFlags::DEFERRED | FrameFlags::COALESCED));
        assert_eq!(l.admitted_in_window(PriorityClass::Normal), 1);
    }

    #[test]
    fn coalesce_keeps_one_slot_per_source() {
        let t0 = Instant::now();
        let mut l = limiter(ClassPolicy::new(0, OverflowPolicy::Coalesce), t0);
        assert_eq!(l.offer(ev(1, PriorityClass::Focus, 1), t0), Admission::Queued);
        assert_eq!(l.offer(ev(2, PriorityClass::Focus, 2), t0), Admission::Queued);
        assert_eq!(l.offer(ev(1, PriorityClass::Focus, 3), t0), Admission::Coalesced);
        assert_eq!(l.deferred_len(), 2);
    }

    #[test]
    fn queue_is_non_lossy_and_fifo_across_windows() {
        let t0 = Instant::now();
        let mut l = limiter(ClassPolicy::new(2, OverflowPolicy::Queue), t0);
        for i in 0..5u8 {
            l.offer(ev(1, PriorityClass::Critical, i), t0);
        }
        let mut seen: Vec<u8> = l.drain_ready().iter().map(|a| a.event.payload()[0]).collect();
        l.tick(t0 + WINDOW);
        seen.extend(l.drain_ready().iter().map(|a| a.event.payload()[0]));
        // A newcomer must not overtake the remaining deferred event.
        l.offer(ev(1, PriorityClass::Critical, 5), t0 + WINDOW);
        l.tick(t0 + WINDOW * 2);
        seen.extend(l.drain_ready().iter().map(|a| a.event.payload()[0]));
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn queue_bound_drops_overflow() {
        let t0 = Instant::now();
        let mut policy = ClassPolicy::new(1, OverflowPolicy::Queue);
        policy.max_queued = 2;
        let mut l = limiter(policy, t0);
        let outcomes: Vec<_> = (0..4u8)
            .map(|i| l.offer(ev(1, PriorityClass::Critical, i), t0))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                Admission::Admitted,
                Admission::Queued,
                Admission::Queued,
                Admission::Dropped
            ]
        );
    }

    #[test]
    fn ready_order_is_class_then_arrival() {
        let t0 = Instant::now();
        let mut l = limiter(ClassPolicy::new(10, OverflowPolicy::Drop), t0);
        l.offer(ev(1, PriorityClass::Background, 1), t0);
        l.offer(ev(1, PriorityClass::Normal, 2), t0);
        l.offer(ev(1, PriorityClass::Critical, 3), t0);
        l.offer(ev(1, PriorityClass::Normal, 4), t0);
        let order: Vec<u8> = l.drain_ready().iter().map(|a| a.event.payload()[0]).collect();
        assert_eq!(order, vec![3, 2, 4, 1]);
    }

    #[test]
    fn classes_do_not_share_budget() {
        let t0 = Instant::now();
        let mut l = limiter(ClassPolicy::new(1, OverflowPolicy::Drop), t0);
        for class in PriorityClass::ALL {
            assert_eq!(l.offer(ev(1, class, 0), t0), Admission::Admitted);
        }
    }

    #[test]
    fn broken_channel_discards_pending_and_reports_once() {
        let t0 = Instant::now();
        let mut l = limiter(ClassPolicy::new(0, OverflowPolicy::Queue), t0);
        for i in 0..5u8 {
            assert_eq!(l.offer(ev(1, PriorityClass::Critical, i), t0), Admission::Queued);
        }

        assert_eq!(l.channel_broken(), 5);
        assert_eq!(l.deferred_len(), 0);
        // Nothing is buffered while the link is down.
        assert_eq!(l.offer(ev(1, PriorityClass::Critical, 9), t0), Admission::Dropped);
        assert_eq!(l.take_unreported(), None);

        l.channel_restored();
        assert_eq!(l.take_unreported(), Some(6));
        assert_eq!(l.take_unreported(), None);
        assert_eq!(l.stats().snapshot().discarded, 5);
    }

    #[test]
    fn awaiting_first_link_reports_nothing() {
        let t0 = Instant::now();
        let mut l = limiter(ClassPolicy::new(1, OverflowPolicy::Drop), t0);
        l.await_link();
        assert_eq!(l.offer(ev(1, PriorityClass::Normal, 0), t0), Admission::Dropped);
        l.channel_restored();
        assert_eq!(l.take_unreported(), None);
    }

    #[test]
    fn teardown_returns_unsent_report() {
        let t0 = Instant::now();
        let mut l = limiter(ClassPolicy::new(0, OverflowPolicy::Queue), t0);
        l.offer(ev(1, PriorityClass::Critical, 0), t0);
        l.channel_broken();
        assert_eq!(l.teardown(), Some(1));
        assert_eq!(l.teardown(), None);
    }
}
