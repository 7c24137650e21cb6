//! Controller-side dispatcher.
//!
//! Accepts helper connections, runs the `Hello` exchange, and keeps one
//! [`Session`] per helper process. Handshakes run concurrently so a slow
//! helper never holds up another.
//!
//! ```text
//!  TcpListener ──► accept task ──► handshake task (per connection)
//!                                      │ Hello ok
//!                                      ▼
//!                  registry (pid → Session) ──► accept() / serve()
//! ```

mod session;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use session::{Delivery, Session};

use crate::error::RelayError;
use crate::message::{Message, PROTOCOL_VERSION};
use crate::transport::{Channel, ChannelOptions};

/// Back-off after the listener itself fails (e.g. out of descriptors).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

// ── Options ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherOptions {
    /// How long a new connection has to send `Hello`.
    pub hello_timeout: Duration,
    /// Deadline for [`Session::call`].
    pub call_timeout: Duration,
    pub channel: ChannelOptions,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            hello_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
            channel: ChannelOptions::default(),
        }
    }
}

// ── EventHandler ─────────────────────────────────────────────────

/// Application logic fed by [`Dispatcher::serve`]. One instance is shared
/// by every session; calls for one session are sequential.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn on_open(&self, _session: &Session) {}

    async fn on_delivery(&self, session: &Session, delivery: Delivery);

    async fn on_close(&self, _session: &Session) {}
}

// ── Registry ─────────────────────────────────────────────────────

#[derive(Default)]
struct Registry {
    sessions: Mutex<HashMap<u32, Session>>,
    next_id: AtomicU64,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<u32, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `session`, detaching any live session of the same
    /// process.
    fn insert(&self, session: Session) {
        let pid = session.process().pid;
        let previous = {
            let mut sessions = self.lock();
            sessions.retain(|_, s| !s.is_closed());
            sessions.insert(pid, session)
        };
        if let Some(previous) = previous {
            info!(
                pid,
                old = previous.id(),
                "helper reconnected, replacing previous session"
            );
            previous.detach();
        }
    }
}

// ── Dispatcher ───────────────────────────────────────────────────

pub struct Dispatcher {
    local_addr: SocketAddr,
    options: DispatcherOptions,
    registry: Arc<Registry>,
    accepted: tokio::sync::Mutex<mpsc::Receiver<Session>>,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Listen on `addr` and start accepting helpers in the background.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        options: DispatcherOptions,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let registry = Arc::new(Registry::default());
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(accept_loop(
            listener,
            options.clone(),
            Arc::clone(&registry),
            tx,
            cancel.clone(),
        ));

        info!(%local_addr, "dispatcher listening");

        Ok(Self {
            local_addr,
            options,
            registry,
            accepted: tokio::sync::Mutex::new(rx),
            cancel,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn options(&self) -> &DispatcherOptions {
        &self.options
    }

    /// Next helper that completed the handshake.
    pub async fn accept(&self) -> Result<Session, RelayError> {
        self.accepted
            .lock()
            .await
            .recv()
            .await
            .ok_or(RelayError::ChannelClosed)
    }

    /// Live session of process `pid`.
    pub fn session(&self, pid: u32) -> Option<Session> {
        self.registry
            .lock()
            .get(&pid)
            .filter(|s| !s.is_closed())
            .cloned()
    }

    /// Every live session, in process id order.
    pub fn sessions(&self) -> Vec<Session> {
        let mut sessions = self.registry.lock();
        sessions.retain(|_, s| !s.is_closed());
        let mut live: Vec<Session> = sessions.values().cloned().collect();
        live.sort_by_key(|s| s.process().pid);
        live
    }

    /// Detach the session of process `pid`. Returns `false` if there was
    /// none.
    pub fn detach(&self, pid: u32) -> bool {
        let removed = self.registry.lock().remove(&pid);
        match removed {
            Some(session) => {
                session.detach();
                true
            }
            None => false,
        }
    }

    /// Stop accepting and detach every session.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let sessions: Vec<Session> = self.registry.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.detach();
        }
    }

    /// Accept helpers and drive each session into `handler` until
    /// `cancel` fires. A panicking handler detaches only its own session.
    pub async fn serve(&self, handler: Arc<dyn EventHandler>, cancel: CancellationToken) {
        let mut tasks = JoinSet::new();
        loop {
            let session = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "session task failed");
                    }
                    continue;
                }
                accepted = self.accept() => match accepted {
                    Ok(session) => session,
                    Err(_) => break,
                },
            };

            let handler = Arc::clone(&handler);
            tasks.spawn(async move {
                let outcome = AssertUnwindSafe(drive(&session, handler.as_ref()))
                    .catch_unwind()
                    .await;
                if outcome.is_err() {
                    error!(session = session.id(), "handler panicked, detaching session");
                    session.detach();
                }
            });
        }

        self.shutdown();
        while tasks.join_next().await.is_some() {}
        debug!("dispatcher stopped serving");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("local_addr", &self.local_addr)
            .field("sessions", &self.registry.lock().len())
            .finish()
    }
}

async fn drive(session: &Session, handler: &dyn EventHandler) {
    handler.on_open(session).await;
    while let Some(delivery) = session.receive().await {
        handler.on_delivery(session, delivery).await;
    }
    handler.on_close(session).await;
}

// ── Accepting ────────────────────────────────────────────────────

async fn accept_loop(
    listener: TcpListener,
    options: DispatcherOptions,
    registry: Arc<Registry>,
    accepted: mpsc::Sender<Session>,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = listener.accept() => match result {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };

        let options = options.clone();
        let registry = Arc::clone(&registry);
        let accepted = accepted.clone();
        tokio::spawn(async move {
            let session = match handshake(stream, &options, &registry).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(%peer, error = %e, "rejected helper connection");
                    return;
                }
            };
            if let Err(mpsc::error::SendError(session)) = accepted.send(session).await {
                // Nobody is accepting any more.
                session.detach();
            }
        });
    }
}

async fn handshake(
    stream: TcpStream,
    options: &DispatcherOptions,
    registry: &Registry,
) -> Result<Session, RelayError> {
    let channel = Channel::from_stream(stream, options.channel.clone())?;

    let first = match tokio::time::timeout(options.hello_timeout, channel.recv()).await {
        Ok(Some(inbound)) => inbound,
        Ok(None) => {
            channel.close().await;
            return Err(RelayError::ProtocolViolation("connection ended before hello"));
        }
        Err(_) => {
            channel.close().await;
            return Err(RelayError::Timeout(options.hello_timeout));
        }
    };

    let hello = match first.message {
        Message::Hello(hello) => hello,
        _ => {
            channel.close().await;
            return Err(RelayError::ProtocolViolation("first message was not hello"));
        }
    };
    if hello.protocol_version != PROTOCOL_VERSION {
        channel.close().await;
        return Err(RelayError::UnsupportedVersion(hello.protocol_version));
    }

    let id = registry.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    let session = Session::new(
        id,
        hello.process,
        hello.interfaces,
        channel,
        options.call_timeout,
    )?;
    info!(
        session = id,
        process = %session.process(),
        peer = %session.channel().peer(),
        "helper attached"
    );
    registry.insert(session.clone());
    Ok(session)
}
