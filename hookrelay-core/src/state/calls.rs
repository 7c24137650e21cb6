//! Outstanding controller → helper calls.
//!
//! Each call is tracked with an optional deadline and a oneshot that the
//! session resolves when the matching `Reply` arrives.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::message::{Interface, Reply};

// ── PendingCall ──────────────────────────────────────────────────

/// A call that may expire after a deadline.
#[derive(Debug)]
pub struct PendingCall {
    pub interface: Interface,
    pub operation: u32,
    /// When the call was sent.
    pub sent_at: Instant,
    /// `None` means no timeout.
    pub deadline: Option<Duration>,
    waiter: oneshot::Sender<Reply>,
}

impl PendingCall {
    /// Returns `true` if this call has exceeded its deadline.
    pub fn is_expired(&self) -> bool {
        match self.deadline {
            Some(d) => self.sent_at.elapsed() > d,
            None => false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.sent_at.elapsed()
    }
}

// ── PendingCalls ─────────────────────────────────────────────────

#[derive(Debug)]
pub struct PendingCalls {
    calls: HashMap<u64, PendingCall>,
    /// Deadline applied when none is given.
    default_timeout: Option<Duration>,
    next_id: u64,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            calls: HashMap::new(),
            default_timeout: None,
            next_id: 1,
        }
    }

    pub fn set_default_timeout(&mut self, timeout: Duration) {
        self.default_timeout = Some(timeout);
    }

    /// Allocate an id and start tracking a call.
    ///
    /// The returned receiver completes when [`resolve`](Self::resolve) is
    /// called for the id; it errors if the call is dropped instead.
    pub fn track(
        &mut self,
        interface: Interface,
        operation: u32,
    ) -> (u64, oneshot::Receiver<Reply>) {
        let deadline = self.default_timeout;
        self.track_with_deadline(interface, operation, deadline)
    }

    pub fn track_with_deadline(
        &mut self,
        interface: Interface,
        operation: u32,
        deadline: Option<Duration>,
    ) -> (u64, oneshot::Receiver<Reply>) {
        let call_id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.calls.insert(
            call_id,
            PendingCall {
                interface,
                operation,
                sent_at: Instant::now(),
                deadline,
                waiter: tx,
            },
        );
        (call_id, rx)
    }

    /// Complete a call with its reply. Returns `false` for unknown ids
    /// (late replies after expiry, or a confused peer).
    pub fn resolve(&mut self, reply: Reply) -> bool {
        match self.calls.remove(&reply.call_id) {
            Some(call) => {
                let _ = call.waiter.send(reply);
                true
            }
            None => false,
        }
    }

    /// Stop tracking a call without completing it.
    pub fn forget(&mut self, call_id: u64) -> Option<PendingCall> {
        self.calls.remove(&call_id)
    }

    pub fn pending_count(&self) -> usize {
        self.calls.len()
    }

    pub fn is_pending(&self, call_id: u64) -> bool {
        self.calls.contains_key(&call_id)
    }

    /// Ids of calls past their deadline. Does not remove them.
    fn check_timeouts(&self) -> Vec<u64> {
        self.calls
            .iter()
            .filter(|(_, c)| c.is_expired())
            .map(|(&id, _)| id)
            .collect()
    }

    /// Remove and return all expired calls. Their waiters observe a
    /// closed channel.
    pub fn drain_expired(&mut self) -> Vec<(u64, PendingCall)> {
        self.check_timeouts()
            .into_iter()
            .filter_map(|id| self.calls.remove(&id).map(|c| (id, c)))
            .collect()
    }

    /// Drop every outstanding call (the link is gone).
    pub fn clear(&mut self) -> usize {
        let n = self.calls.len();
        self.calls.clear();
        n
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_and_resolve() {
        let mut calls = PendingCalls::new();
        let (id, mut rx) = calls.track(Interface::VirtualBuffer, 2);
        assert!(calls.is_pending(id));

        assert!(calls.resolve(Reply {
            call_id: id,
            result: Ok(b"ok".to_vec()),
        }));
        assert_eq!(calls.pending_count(), 0);
        assert_eq!(rx.try_recv().unwrap().result, Ok(b"ok".to_vec()));
    }

    #[test]
    fn ids_are_unique() {
        let mut calls = PendingCalls::new();
        let (a, _ra) = calls.track(Interface::DisplayModel, 1);
        let (b, _rb) = calls.track(Interface::DisplayModel, 1);
        assert_ne!(a, b);
    }

    #[test]
    fn unknown_reply_ignored() {
        let mut calls = PendingCalls::new();
        assert!(!calls.resolve(Reply {
            call_id: 999,
            result: Ok(Vec::new()),
        }));
    }

    #[test]
    fn deadline_expires() {
        let mut calls = PendingCalls::new();
        let (id, _rx) =
            calls.track_with_deadline(Interface::Audio, 1, Some(Duration::ZERO));
        std::thread::sleep(Duration::from_millis(1));
        assert_eq!(calls.check_timeouts(), vec![id]);
    }

    #[test]
    fn drain_expired_closes_waiter() {
        let mut calls = PendingCalls::new();
        calls.set_default_timeout(Duration::ZERO);
        let (_, mut expired_rx) = calls.track(Interface::ScreenCurtain, 1);
        let (_, _live_rx) = calls.track_with_deadline(Interface::ScreenCurtain, 2, None);
        std::thread::sleep(Duration::from_millis(1));

        let drained = calls.drain_expired();
        assert_eq!(drained.len(), 1);
        drop(drained);
        assert!(expired_rx.try_recv().is_err());
        assert_eq!(calls.pending_count(), 1);
    }

    #[test]
    fn clear_drops_all() {
        let mut calls = PendingCalls::new();
        calls.track(Interface::RemoteAccess, 1);
        calls.track(Interface::RemoteAccess, 2);
        assert_eq!(calls.clear(), 2);
        assert_eq!(calls.pending_count(), 0);
    }
}
