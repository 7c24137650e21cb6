//! The limiter task: owns the limiter state, ticks windows, and flushes
//! admitted events to whichever channel is current.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Admitted, EventRateLimiter, LimiterConfig, LimiterStats, StatsSnapshot};
use crate::error::SendError;
use crate::event::Event;

/// First backoff between send retries; doubles per attempt.
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

// ── EventSink ────────────────────────────────────────────────────

/// Where admitted events go. Implemented by the transport channel.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn send_event(&self, admitted: &Admitted) -> Result<(), SendError>;

    /// Report events discarded because a previous channel broke.
    async fn send_channel_lost(&self, discarded: u32) -> Result<(), SendError>;
}

// ── LimiterHandle ────────────────────────────────────────────────

/// Producer side of the limiter. Cheap to clone and safe to use from any
/// thread, including host threads outside the runtime.
#[derive(Clone)]
pub struct LimiterHandle {
    tx: mpsc::Sender<Event>,
    stats: Arc<LimiterStats>,
}

impl LimiterHandle {
    /// Offer an event without blocking. Returns `false` if the entry queue
    /// is full or the limiter has stopped; the event is then dropped.
    pub fn submit(&self, event: Event) -> bool {
        LimiterStats::bump(&self.stats.submitted, 1);
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                LimiterStats::bump(&self.stats.rejected, 1);
                false
            }
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for LimiterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterHandle")
            .field("capacity", &self.tx.capacity())
            .finish()
    }
}

// ── LimiterService ───────────────────────────────────────────────

/// Runs the limiter until cancelled or until every handle is dropped.
///
/// The current sink arrives over a `watch`: `Some` when a channel opens,
/// `None` when it breaks. The limiter never buffers across that gap.
pub struct LimiterService<S: EventSink> {
    limiter: EventRateLimiter,
    rx: mpsc::Receiver<Event>,
    links: watch::Receiver<Option<Arc<S>>>,
    sink: Option<Arc<S>>,
    cancel: CancellationToken,
}

impl<S: EventSink> LimiterService<S> {
    pub fn new(
        config: LimiterConfig,
        links: watch::Receiver<Option<Arc<S>>>,
        cancel: CancellationToken,
    ) -> (Self, LimiterHandle) {
        let stats = Arc::new(LimiterStats::default());
        let (tx, rx) = mpsc::channel(config.submit_capacity.max(1));
        let mut limiter = EventRateLimiter::new(config, Arc::clone(&stats), Instant::now());
        limiter.await_link();
        let service = Self {
            limiter,
            rx,
            links,
            sink: None,
            cancel,
        };
        (service, LimiterHandle { tx, stats })
    }

    pub async fn run(mut self) {
        let initial = self.links.borrow_and_update().clone();
        if let Some(sink) = initial {
            self.attach(sink);
        }

        loop {
            let boundary = tokio::time::Instant::from_std(self.limiter.next_boundary());
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                changed = self.links.changed() => {
                    if changed.is_err() {
                        debug!("link publisher gone, stopping limiter");
                        break;
                    }
                    let next = self.links.borrow_and_update().clone();
                    match next {
                        Some(sink) => self.attach(sink),
                        None => self.detach_sink(),
                    }
                }

                _ = tokio::time::sleep_until(boundary) => {
                    self.limiter.tick(Instant::now());
                }

                event = self.rx.recv() => match event {
                    Some(event) => {
                        self.limiter.offer(event, Instant::now());
                    }
                    None => break,
                },
            }

            self.flush().await;
        }

        let pending = self.limiter.ready_len() + self.limiter.deferred_len();
        let unreported = self.limiter.teardown();
        info!(
            pending,
            unreported = unreported.unwrap_or(0),
            stats = ?self.limiter.stats().snapshot(),
            "limiter stopped"
        );
    }

    fn attach(&mut self, sink: Arc<S>) {
        if self.sink.is_some() {
            // Replaced without passing through `None`: the old channel is
            // gone all the same.
            self.limiter.channel_broken();
        }
        self.sink = Some(sink);
        self.limiter.channel_restored();
    }

    fn detach_sink(&mut self) {
        if self.sink.take().is_some() {
            let discarded = self.limiter.channel_broken();
            info!(discarded, "channel lost, pending events discarded");
        }
    }

    async fn flush(&mut self) {
        let Some(sink) = self.sink.clone() else {
            return;
        };

        if let Some(lost) = self.limiter.take_unreported() {
            match send_with_retry(self.limiter.config().send_retries, || {
                sink.send_channel_lost(lost)
            })
            .await
            {
                Ok(()) => debug!(lost, "reported channel loss"),
                Err(err) => {
                    self.limiter.add_unreported(lost);
                    if err.is_fatal() {
                        self.fail_sink(&err);
                    }
                    return;
                }
            }
        }

        while let Some(admitted) = self.limiter.pop_ready() {
            let result = send_with_retry(self.limiter.config().send_retries, || {
                sink.send_event(&admitted)
            })
            .await;
            match result {
                Ok(()) => LimiterStats::bump(&self.limiter.stats().sent, 1),
                Err(err) if err.is_fatal() => {
                    // The in-flight event counts as discarded with the rest.
                    self.limiter.unpop(admitted);
                    self.fail_sink(&err);
                    return;
                }
                Err(err) => {
                    warn!(%err, "send retries exhausted, dropping event");
                    LimiterStats::bump(&self.limiter.stats().dropped, 1);
                }
            }
        }
    }

    fn fail_sink(&mut self, err: &SendError) {
        warn!(%err, "channel failed during flush");
        self.sink = None;
        let discarded = self.limiter.channel_broken();
        info!(discarded, "pending events discarded");
    }
}

/// Retry transient failures with exponential backoff. Fatal errors and the
/// last transient error are returned as is.
async fn send_with_retry<F, Fut>(retries: u32, mut send: F) -> Result<(), SendError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), SendError>>,
{
    let mut attempt = 0u32;
    loop {
        match send().await {
            Err(SendError::Transient(waited)) if attempt < retries => {
                let backoff = RETRY_BACKOFF * 2u32.saturating_pow(attempt);
                debug!(?waited, ?backoff, attempt, "transient send failure, retrying");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
