//! The in-process helper: hooks, limiter and controller link wired
//! together.
//!
//! ```text
//!  ImportTable ─► HookTable ─► EventObserver ─► LimiterHandle
//!                                                   │
//!                  supervisor ── watch<Channel> ──► LimiterService
//!                     │
//!                     └─ serves Calls via InterfaceRegistry
//! ```
//!
//! The supervisor owns reconnection: when a channel breaks it publishes
//! `None` (the limiter discards everything pending) and dials again after
//! an exponential backoff. The backoff only resets once a link has stayed
//! up for `reconnect_max`.

mod interfaces;
mod observer;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use interfaces::{InterfaceHandler, InterfaceRegistry};
pub use observer::{CallRecord, EventObserver};

use crate::error::{HookError, HookInstallError, RelayError};
use crate::event::PriorityClass;
use crate::hook::{HookEntry, HookTable, HookTarget, ImportTable, Signature, Symbol};
use crate::limiter::{LimiterConfig, LimiterHandle, LimiterService, StatsSnapshot};
use crate::message::{Hello, Message, PROTOCOL_VERSION, ProcessIdentity};
use crate::transport::{Channel, ChannelOptions, Endpoint};

// ── Options ──────────────────────────────────────────────────────

/// One API to hook and the priority of the events it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookSpec {
    pub symbol: Symbol,
    pub priority: PriorityClass,
    /// Expected signature; taken from the dispatch table when `None`.
    pub signature: Option<Signature>,
}

impl HookSpec {
    pub fn new(symbol: impl Into<Symbol>, priority: PriorityClass) -> Self {
        Self {
            symbol: symbol.into(),
            priority,
            signature: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HelperOptions {
    pub controller: Endpoint,
    pub process: ProcessIdentity,
    pub channel: ChannelOptions,
    pub limiter: LimiterConfig,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    /// Upper bound on `detach`; tasks still running after it are aborted.
    pub detach_timeout: Duration,
}

impl HelperOptions {
    pub fn new(controller: Endpoint) -> Self {
        Self {
            controller,
            process: ProcessIdentity::current(),
            channel: ChannelOptions::default(),
            limiter: LimiterConfig::default(),
            reconnect_initial: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(5),
            detach_timeout: Duration::from_secs(2),
        }
    }
}

// ── HelperRuntime ────────────────────────────────────────────────

pub struct HelperRuntime {
    hooks: HookTable,
    entries: Vec<HookEntry>,
    limiter: LimiterHandle,
    link: watch::Receiver<Option<Arc<Channel>>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    detach_timeout: Duration,
}

impl HelperRuntime {
    /// Start the limiter and the controller link, then install `hooks`
    /// into `table` as one batch.
    ///
    /// Returns once hooks are installed; the first connection is made in
    /// the background. If any hook fails, nothing stays installed.
    pub async fn attach(
        options: HelperOptions,
        table: Arc<ImportTable>,
        hooks: Vec<HookSpec>,
        interfaces: InterfaceRegistry,
    ) -> Result<Self, RelayError> {
        let cancel = CancellationToken::new();
        let (link_tx, link_rx) = watch::channel::<Option<Arc<Channel>>>(None);

        let (service, limiter) =
            LimiterService::new(options.limiter.clone(), link_rx.clone(), cancel.clone());
        let limiter_task = tokio::spawn(service.run());

        let hook_table = HookTable::new(table);
        let targets = match build_targets(&hook_table, &hooks, &limiter) {
            Ok(targets) => targets,
            Err(e) => {
                cancel.cancel();
                return Err(e.into());
            }
        };
        let entries = match hook_table.install_all(targets) {
            Ok(entries) => entries,
            Err(e) => {
                cancel.cancel();
                return Err(e.into());
            }
        };
        info!(hooks = entries.len(), controller = %options.controller, "helper attached");

        let supervisor = tokio::spawn(supervise(
            options.clone(),
            link_tx,
            Arc::new(interfaces),
            cancel.clone(),
        ));

        Ok(Self {
            hooks: hook_table,
            entries,
            limiter,
            link: link_rx,
            cancel,
            tasks: vec![supervisor, limiter_task],
            detach_timeout: options.detach_timeout,
        })
    }

    pub fn hooks(&self) -> &HookTable {
        &self.hooks
    }

    /// Entries installed by `attach`, in the order the hooks were given.
    pub fn entries(&self) -> &[HookEntry] {
        &self.entries
    }

    pub fn limiter(&self) -> &LimiterHandle {
        &self.limiter
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.limiter.stats()
    }

    pub fn is_connected(&self) -> bool {
        self.link
            .borrow()
            .as_ref()
            .is_some_and(|channel| channel.is_open())
    }

    /// Wait until a channel to the controller is up.
    pub async fn connected(&self) {
        let mut link = self.link.clone();
        let _ = link.wait_for(Option::is_some).await;
    }

    /// Remove every hook, then close the link and stop background tasks.
    /// Bounded by the configured detach timeout. Returns hooks whose
    /// original entry could not be restored.
    pub async fn detach(mut self) -> Vec<HookError> {
        let failures = self.hooks.uninstall_all();
        for failure in &failures {
            warn!(error = %failure, "hook left in place on detach");
        }

        self.cancel.cancel();
        let tasks = std::mem::take(&mut self.tasks);
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let joined =
            tokio::time::timeout(self.detach_timeout, futures::future::join_all(tasks)).await;
        if joined.is_err() {
            warn!(timeout = ?self.detach_timeout, "helper tasks did not stop in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
        info!(stats = ?self.limiter.stats(), "helper detached");
        failures
    }
}

impl Drop for HelperRuntime {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn build_targets(
    hooks: &HookTable,
    specs: &[HookSpec],
    limiter: &LimiterHandle,
) -> Result<Vec<HookTarget>, HookInstallError> {
    specs
        .iter()
        .map(|spec| {
            let signature = match spec.signature {
                Some(signature) => signature,
                None => hooks
                    .import_table()
                    .resolve(&spec.symbol)
                    .map(|(signature, _)| signature)
                    .ok_or_else(|| HookInstallError::UnknownSymbol(spec.symbol.clone()))?,
            };
            let observer = Arc::new(EventObserver::new(spec.priority, limiter.clone()));
            Ok(HookTarget::new(spec.symbol.clone(), signature, observer))
        })
        .collect()
}

// ── Supervisor ───────────────────────────────────────────────────

async fn supervise(
    options: HelperOptions,
    links: watch::Sender<Option<Arc<Channel>>>,
    interfaces: Arc<InterfaceRegistry>,
    cancel: CancellationToken,
) {
    let mut backoff = options.reconnect_initial;
    loop {
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            connected = open_channel(&options, &interfaces) => connected,
        };

        match connected {
            Ok(channel) => {
                let channel = Arc::new(channel);
                info!(peer = %channel.peer(), "connected to controller");
                links.send_replace(Some(Arc::clone(&channel)));
                let opened = Instant::now();

                let shutting_down = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => true,
                    _ = serve_calls(&channel, &interfaces) => false,
                };

                links.send_replace(None);
                if shutting_down {
                    channel.close().await;
                    break;
                }
                // Only a link that held up resets the backoff; one dropped
                // right after the handshake keeps growing it.
                let lived = opened.elapsed();
                if lived >= options.reconnect_max {
                    backoff = options.reconnect_initial;
                }
                warn!(
                    state = %channel.state(),
                    lived = ?lived,
                    retry_in = ?backoff,
                    "controller link lost"
                );
                channel.close().await;
            }
            Err(e) => warn!(error = %e, retry_in = ?backoff, "controller unreachable"),
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(options.reconnect_max);
    }
    links.send_replace(None);
    debug!("supervisor stopped");
}

async fn open_channel(
    options: &HelperOptions,
    interfaces: &InterfaceRegistry,
) -> Result<Channel, RelayError> {
    let channel = Channel::connect(&options.controller, options.channel.clone()).await?;
    let hello = Message::Hello(Hello {
        protocol_version: PROTOCOL_VERSION,
        process: options.process.clone(),
        interfaces: interfaces.interfaces(),
    });
    if let Err(e) = channel.send(&hello).await {
        channel.close().await;
        return Err(e.into());
    }
    Ok(channel)
}

/// Answer controller calls until the channel stops delivering.
async fn serve_calls(channel: &Channel, interfaces: &InterfaceRegistry) {
    while let Some(inbound) = channel.recv().await {
        match inbound.message {
            Message::Call(call) => {
                let reply = interfaces.dispatch(call).await;
                if let Err(e) = channel.send(&Message::Reply(reply)).await {
                    if e.is_fatal() {
                        return;
                    }
                    debug!(error = %e, "reply dropped");
                }
            }
            other => debug!(kind = %other.kind(), "ignoring message from controller"),
        }
    }
}
