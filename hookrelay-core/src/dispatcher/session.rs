//! One helper process as seen by the controller.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::Stream;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::event::Event;
use crate::flags::FrameFlags;
use crate::message::{Call, Interface, Message, ProcessIdentity, Reply};
use crate::packet::Frame;
use crate::state::{LinkState, PendingCalls};
use crate::transport::{Channel, Inbound};

/// What a session yields to application logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Event {
        event: Event,
        /// Channel sequence number of the carrying frame.
        sequence: u64,
        flags: FrameFlags,
    },
    /// The helper discarded `discarded` events when an earlier channel
    /// broke, instead of buffering them.
    Resync { discarded: u32 },
    /// This session's channel broke. Delivered once, right before the
    /// session ends.
    ChannelLost { reason: String },
}

struct SessionInner {
    id: u64,
    process: ProcessIdentity,
    interfaces: Vec<Interface>,
    channel: Channel,
    state: Mutex<LinkState>,
    /// Reason the channel broke, until it is delivered.
    lost: Mutex<Option<String>>,
    calls: Mutex<PendingCalls>,
    call_timeout: Duration,
    detached: CancellationToken,
    created_at: Instant,
    runtime: Handle,
}

/// A live helper connection, keyed by process id in the dispatcher.
///
/// Cloning is cheap; clones observe the same session. `receive` may be
/// called again after a previous call returned, and picks up where it
/// left off.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Must be called inside a Tokio runtime; `detach` uses it later.
    pub(crate) fn new(
        id: u64,
        process: ProcessIdentity,
        interfaces: Vec<Interface>,
        channel: Channel,
        call_timeout: Duration,
    ) -> Result<Self, RelayError> {
        let mut state = LinkState::default();
        state.open()?;
        let mut calls = PendingCalls::new();
        calls.set_default_timeout(call_timeout);
        Ok(Self {
            inner: Arc::new(SessionInner {
                id,
                process,
                interfaces,
                channel,
                state: Mutex::new(state),
                lost: Mutex::new(None),
                calls: Mutex::new(calls),
                call_timeout,
                detached: CancellationToken::new(),
                created_at: Instant::now(),
                runtime: Handle::current(),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn process(&self) -> &ProcessIdentity {
        &self.inner.process
    }

    /// Interfaces the helper announced it answers calls for.
    pub fn interfaces(&self) -> &[Interface] {
        &self.inner.interfaces
    }

    pub fn state(&self) -> LinkState {
        let mut state = self.lock_state();
        self.observe_channel(&mut state);
        state.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().is_closed()
    }

    /// When the helper was last heard from (heartbeats included).
    pub fn last_seen(&self) -> Instant {
        self.inner.channel.last_seen()
    }

    pub fn age(&self) -> Duration {
        self.inner.created_at.elapsed()
    }

    pub fn pending_calls(&self) -> usize {
        self.lock_calls().pending_count()
    }

    pub(crate) fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    // ── Receiving ────────────────────────────────────────────────

    /// Next delivery, or `None` once the session is closed.
    ///
    /// Replies to [`call`](Self::call) are matched here, so some task must
    /// keep receiving for calls to complete.
    pub async fn receive(&self) -> Option<Delivery> {
        loop {
            if self.is_closed() {
                return self.take_lost();
            }

            let inbound = tokio::select! {
                biased;
                _ = self.inner.detached.cancelled() => None,
                inbound = self.inner.channel.recv() => inbound,
            };

            let Some(Inbound {
                message,
                flags,
                sequence,
            }) = inbound
            else {
                return self.finish();
            };

            match message {
                Message::Event(event) => {
                    return Some(Delivery::Event {
                        event,
                        sequence,
                        flags,
                    });
                }
                Message::ChannelLost { discarded } => {
                    return Some(Delivery::Resync { discarded });
                }
                Message::Reply(reply) => self.complete(reply),
                other => {
                    warn!(
                        session = self.inner.id,
                        kind = %other.kind(),
                        "unexpected message from helper"
                    );
                }
            }
        }
    }

    /// The same sequence as [`receive`](Self::receive), as a stream.
    /// Dropping the stream loses nothing; a later call continues.
    pub fn events(&self) -> impl Stream<Item = Delivery> + Send + 'static {
        futures::stream::unfold(self.clone(), |session| async move {
            let delivery = session.receive().await?;
            Some((delivery, session))
        })
    }

    fn complete(&self, reply: Reply) {
        let mut calls = self.lock_calls();
        let call_id = reply.call_id;
        if !calls.resolve(reply) {
            debug!(session = self.inner.id, call_id, "reply for unknown or expired call");
        }
        for (id, call) in calls.drain_expired() {
            debug!(
                session = self.inner.id,
                call_id = id,
                interface = %call.interface,
                elapsed = ?call.elapsed(),
                "reaped expired call"
            );
        }
    }

    /// The channel produced its last message.
    fn finish(&self) -> Option<Delivery> {
        {
            let mut state = self.lock_state();
            self.observe_channel(&mut state);
            if state.close() {
                let dropped = self.lock_calls().clear();
                info!(
                    session = self.inner.id,
                    process = %self.inner.process,
                    dropped_calls = dropped,
                    "session closed"
                );
            }
        }
        self.take_lost()
    }

    fn take_lost(&self) -> Option<Delivery> {
        self.inner
            .lost
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|reason| Delivery::ChannelLost { reason })
    }

    /// Carry a channel break into the session state. Only an open session
    /// can break, so the loss is recorded at most once.
    fn observe_channel(&self, state: &mut LinkState) {
        if !state.is_open() {
            return;
        }
        if let LinkState::Broken { reason } = self.inner.channel.state() {
            if state.fail(reason.clone()).unwrap_or(false) {
                warn!(
                    session = self.inner.id,
                    process = %self.inner.process,
                    %reason,
                    "channel lost"
                );
                *self
                    .inner
                    .lost
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(reason);
            }
        }
    }

    // ── Calls ────────────────────────────────────────────────────

    /// Invoke `operation` on one of the helper's interfaces and wait for
    /// its reply, at most the configured call timeout.
    pub async fn call(
        &self,
        interface: Interface,
        operation: u32,
        args: Vec<u8>,
    ) -> Result<Vec<u8>, RelayError> {
        if !self.is_open() {
            return Err(RelayError::SessionClosed(self.inner.id));
        }

        let limit = self.inner.call_timeout;
        let (call_id, reply) = self.lock_calls().track(interface, operation);

        let frame = Frame::from_message(&Message::Call(Call {
            call_id,
            interface,
            operation,
            args,
        }));
        let sent = match frame {
            Ok(frame) => self
                .inner
                .channel
                .send_frame(frame)
                .await
                .map_err(RelayError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.lock_calls().forget(call_id);
            return Err(e);
        }

        match tokio::time::timeout(limit, reply).await {
            Ok(Ok(reply)) => reply.result.map_err(RelayError::Remote),
            Ok(Err(_)) => Err(RelayError::SessionClosed(self.inner.id)),
            Err(_) => {
                self.lock_calls().forget(call_id);
                Err(RelayError::Timeout(limit))
            }
        }
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Release the session. Safe from any thread, including while another
    /// task is inside `receive`, which then returns. Idempotent.
    pub fn detach(&self) {
        let open_for = {
            let mut state = self.lock_state();
            self.observe_channel(&mut state);
            let open_for = state.open_duration();
            if !state.close() {
                return;
            }
            open_for
        };
        self.inner.detached.cancel();
        let dropped = self.lock_calls().clear();

        let channel = self.inner.channel.clone();
        self.inner.runtime.spawn(async move {
            channel.close().await;
        });
        info!(
            session = self.inner.id,
            process = %self.inner.process,
            dropped_calls = dropped,
            open_for = ?open_for,
            "session detached"
        );
    }

    fn lock_state(&self) -> MutexGuard<'_, LinkState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_calls(&self) -> MutexGuard<'_, PendingCalls> {
        self.inner.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("process", &self.inner.process)
            .field("state", &*self.lock_state())
            .finish()
    }
}
