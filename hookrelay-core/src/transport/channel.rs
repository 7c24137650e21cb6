//! A framed TCP link between one helper and the controller.
//!
//! Each channel runs a writer task (sole owner of the socket's write half,
//! so frames leave in `send` order), a reader task, and optionally a
//! heartbeat task. State changes are published on a `watch`.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::Endpoint;
use crate::codec::RelayCodec;
use crate::error::{ConnectError, RelayError, SendError};
use crate::flags::FrameFlags;
use crate::limiter::{Admitted, EventSink};
use crate::message::{Message, MessageKind};
use crate::packet::Frame;
use crate::state::LinkState;

type FramedStream = Framed<TcpStream, RelayCodec>;

// ── Options ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    pub connect_timeout: Duration,
    /// How long `send` waits for queue space before reporting a
    /// transient failure.
    pub send_timeout: Duration,
    /// How long `close` lets queued frames drain.
    pub linger: Duration,
    /// Interval between outbound heartbeats; `None` disables them.
    pub heartbeat: Option<Duration>,
    /// Inbound silence after which the channel is considered broken.
    pub idle_timeout: Option<Duration>,
    /// Capacity of the outbound and inbound frame queues.
    pub queue_capacity: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_millis(250),
            linger: Duration::from_millis(500),
            heartbeat: Some(Duration::from_secs(5)),
            idle_timeout: Some(Duration::from_secs(15)),
            queue_capacity: 256,
        }
    }
}

/// A message received on a channel, with its frame metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub message: Message,
    pub flags: FrameFlags,
    /// Writer-assigned sequence number; strictly increasing per channel.
    pub sequence: u64,
}

// ── Channel ──────────────────────────────────────────────────────

/// Handle to one link. Clones share the link; the tasks stop when the
/// last handle is dropped.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Shared>,
}

struct Shared {
    peer: SocketAddr,
    options: ChannelOptions,
    outbound: mpsc::Sender<Frame>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Inbound>>,
    state: Arc<watch::Sender<LinkState>>,
    last_seen: Arc<Mutex<Instant>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Channel {
    /// Open a channel to `endpoint`.
    ///
    /// Never retries: reconnection belongs to whoever owns the channel.
    pub async fn connect(endpoint: &Endpoint, options: ChannelOptions) -> Result<Self, ConnectError> {
        let addr = endpoint.to_string();
        let stream = match tokio::time::timeout(
            options.connect_timeout,
            TcpStream::connect((endpoint.host(), endpoint.port())),
        )
        .await
        {
            Err(_) => {
                return Err(ConnectError::Timeout {
                    endpoint: addr,
                    after: options.connect_timeout,
                });
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(ConnectError::Refused { endpoint: addr });
            }
            Ok(Err(source)) => {
                return Err(ConnectError::Io {
                    endpoint: addr,
                    source,
                });
            }
            Ok(Ok(stream)) => stream,
        };

        Self::from_stream(stream, options).map_err(|e| match e {
            RelayError::Connection(source) => ConnectError::Io {
                endpoint: addr.clone(),
                source,
            },
            other => ConnectError::Handshake(other.to_string()),
        })
    }

    /// Wrap an established stream. The channel starts `Open`.
    pub fn from_stream(stream: TcpStream, options: ChannelOptions) -> Result<Self, RelayError> {
        let peer = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "could not set TCP_NODELAY");
        }

        let (sink, source) = Framed::new(stream, RelayCodec).split();
        let capacity = options.queue_capacity.max(1);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);

        let (state, _) = watch::channel(LinkState::Open {
            since: Instant::now(),
        });
        let state = Arc::new(state);
        let last_seen = Arc::new(Mutex::new(Instant::now()));
        let cancel = CancellationToken::new();

        let writer = tokio::spawn(write_loop(
            sink,
            out_rx,
            Arc::clone(&state),
            cancel.clone(),
        ));

        tokio::spawn(read_loop(
            source,
            in_tx,
            Arc::clone(&state),
            Arc::clone(&last_seen),
            options.idle_timeout,
            cancel.clone(),
        ));

        if let Some(every) = options.heartbeat {
            tokio::spawn(heartbeat_loop(out_tx.clone(), every, cancel.clone()));
        }

        debug!(%peer, "channel open");

        Ok(Self {
            inner: Arc::new(Shared {
                peer,
                options,
                outbound: out_tx,
                inbound: tokio::sync::Mutex::new(in_rx),
                state,
                last_seen,
                writer: Mutex::new(Some(writer)),
                cancel,
            }),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.inner.options
    }

    pub fn state(&self) -> LinkState {
        self.inner.state.borrow().clone()
    }

    pub fn state_watch(&self) -> watch::Receiver<LinkState> {
        self.inner.state.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.borrow().is_open()
    }

    /// When the last inbound frame (heartbeats included) arrived.
    pub fn last_seen(&self) -> Instant {
        *self
            .inner
            .last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ── Sending ──────────────────────────────────────────────────

    pub async fn send(&self, message: &Message) -> Result<(), SendError> {
        let frame = match Frame::from_message(message) {
            Ok(frame) => frame,
            Err(e) => {
                let reason = format!("could not encode {}: {e}", message.kind());
                self.fail(reason.clone());
                return Err(SendError::Fatal(reason));
            }
        };
        self.send_frame(frame).await
    }

    /// Queue a frame for the writer. Frames are written in call order.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), SendError> {
        {
            let state = self.inner.state.borrow();
            if state.is_terminal() {
                return Err(SendError::Fatal(format!("channel is {}", *state)));
            }
        }
        let limit = self.inner.options.send_timeout;
        match self.inner.outbound.send_timeout(frame, limit).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(SendError::Transient(limit)),
            Err(SendTimeoutError::Closed(_)) => {
                self.fail("writer stopped");
                Err(SendError::Fatal("writer stopped".into()))
            }
        }
    }

    // ── Receiving ────────────────────────────────────────────────

    /// Next inbound message. Heartbeats and goodbyes are consumed by the
    /// channel. `None` once the link is no longer open.
    pub async fn recv(&self) -> Option<Inbound> {
        self.inner.inbound.lock().await.recv().await
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Mark the link `Broken` and stop its tasks. Returns `false` if it was
    /// already broken or closed.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        mark_broken(&self.inner.state, &self.inner.cancel, reason.into())
    }

    /// Close the link. Sends `Goodbye` if the link was open and waits at
    /// most `linger` for queued frames to drain. Idempotent.
    pub async fn close(&self) {
        let was_open = self.is_open();
        if !self.inner.state.send_if_modified(LinkState::close) {
            return;
        }

        if was_open {
            if let Ok(goodbye) = Frame::from_message(&Message::Goodbye) {
                match self.inner.outbound.try_send(goodbye) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => debug!("outbound queue full, skipping goodbye"),
                    Err(TrySendError::Closed(_)) => {}
                }
            }
            let writer = self
                .inner
                .writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(writer) = writer {
                if tokio::time::timeout(self.inner.options.linger, writer)
                    .await
                    .is_err()
                {
                    debug!(peer = %self.inner.peer, "writer did not drain before linger expired");
                }
            }
        }

        self.inner.cancel.cancel();
        debug!(peer = %self.inner.peer, "channel closed");
    }

    /// Resolves once the link is `Broken` or `Closed`.
    pub async fn terminated(&self) {
        let mut state = self.state_watch();
        let _ = state.wait_for(LinkState::is_terminal).await;
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.inner.peer)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

#[async_trait]
impl EventSink for Channel {
    async fn send_event(&self, admitted: &Admitted) -> Result<(), SendError> {
        let frame = Frame::from_message(&Message::Event(admitted.event.clone()))
            .map_err(|e| SendError::Fatal(e.to_string()))?
            .with_flags(admitted.flags);
        self.send_frame(frame).await
    }

    async fn send_channel_lost(&self, discarded: u32) -> Result<(), SendError> {
        self.send(&Message::ChannelLost { discarded }).await
    }
}

// ── Tasks ────────────────────────────────────────────────────────

fn mark_broken(
    state: &watch::Sender<LinkState>,
    cancel: &CancellationToken,
    reason: String,
) -> bool {
    let why = reason.clone();
    let changed = state.send_if_modified(|s| s.fail(reason).unwrap_or(false));
    if changed {
        debug!(reason = %why, "channel broken");
    }
    cancel.cancel();
    changed
}

async fn write_loop(
    mut sink: SplitSink<FramedStream, Frame>,
    mut frames: mpsc::Receiver<Frame>,
    state: Arc<watch::Sender<LinkState>>,
    cancel: CancellationToken,
) {
    let mut sequence = 0u64;
    loop {
        let mut frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };

        sequence += 1;
        frame.set_sequence(sequence);
        let goodbye = frame.kind() == MessageKind::Goodbye;

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            written = sink.send(frame) => written,
        };
        if let Err(e) = written {
            warn!(error = %e, "write failed");
            mark_broken(&state, &cancel, format!("write failed: {e}"));
            return;
        }
        if goodbye {
            let _ = sink.close().await;
            return;
        }
    }
}

async fn next_frame(
    source: &mut SplitStream<FramedStream>,
    idle: Option<Duration>,
) -> Result<Option<Frame>, RelayError> {
    let next = match idle {
        Some(limit) => tokio::time::timeout(limit, source.next())
            .await
            .map_err(|_| RelayError::Timeout(limit))?,
        None => source.next().await,
    };
    next.transpose()
}

async fn read_loop(
    mut source: SplitStream<FramedStream>,
    inbound: mpsc::Sender<Inbound>,
    state: Arc<watch::Sender<LinkState>>,
    last_seen: Arc<Mutex<Instant>>,
    idle: Option<Duration>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = next_frame(&mut source, idle) => next,
        };

        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                mark_broken(&state, &cancel, "peer closed the connection".into());
                return;
            }
            Err(RelayError::Timeout(limit)) => {
                mark_broken(&state, &cancel, format!("no traffic for {limit:?}"));
                return;
            }
            Err(e) => {
                mark_broken(&state, &cancel, format!("read failed: {e}"));
                return;
            }
        };
        *last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();

        let message = match frame.to_message() {
            Ok(message) => message,
            Err(e) => {
                mark_broken(&state, &cancel, format!("undecodable {}: {e}", frame.kind()));
                return;
            }
        };

        match message {
            Message::Heartbeat => trace!(sequence = frame.sequence(), "heartbeat"),
            Message::Goodbye => {
                debug!("peer said goodbye");
                state.send_if_modified(LinkState::close);
                cancel.cancel();
                return;
            }
            message => {
                let item = Inbound {
                    message,
                    flags: frame.flags(),
                    sequence: frame.sequence(),
                };
                let delivered = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    delivered = inbound.send(item) => delivered,
                };
                if delivered.is_err() {
                    return;
                }
            }
        }
    }
}

async fn heartbeat_loop(outbound: mpsc::Sender<Frame>, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        let Ok(frame) = Frame::from_message(&Message::Heartbeat) else {
            return;
        };
        // A full queue means traffic is flowing anyway.
        if let Err(TrySendError::Closed(_)) = outbound.try_send(frame) {
            return;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
