//! Helper service core logic.
//!
//! Attaches the hook runtime to the simulated host, keeps the host
//! threads running, and reports limiter statistics until stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;
use tracing::{info, warn};

use hookrelay_core::{HelperRuntime, ImportTable, Interface, InterfaceRegistry};

use crate::config::HelperConfig;
use crate::host::{HostThreads, UtilityInterface, register_host_apis};

// ── HelperService ────────────────────────────────────────────────

/// The top-level helper service.
pub struct HelperService {
    config: HelperConfig,
    table: Arc<ImportTable>,
    running: Arc<AtomicBool>,
}

impl HelperService {
    /// Create a service whose host APIs live in a fresh import table.
    pub fn new(config: HelperConfig) -> Self {
        let table = Arc::new(ImportTable::new());
        register_host_apis(&table);
        Self {
            config,
            table,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn import_table(&self) -> &Arc<ImportTable> {
        &self.table
    }

    /// Run the service until stopped.
    ///
    /// 1. Installs the configured hooks and starts the controller link.
    /// 2. Starts the host threads.
    /// 3. Logs limiter statistics on an interval.
    /// 4. Stops the host, then detaches when `running` becomes `false`.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.running.store(true, Ordering::SeqCst);

        let runtime = match self.attach().await {
            Ok(runtime) => runtime,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        for entry in runtime.entries() {
            info!("hooked {}", entry.symbol());
        }

        let host = HostThreads::spawn(Arc::clone(&self.table), &self.config.host);
        info!("host running with {} threads", host.threads());

        match self.config.logging.stats_interval_secs {
            0 => Self::wait_for_stop(&self.running).await,
            secs => {
                let mut ticks =
                    IntervalStream::new(tokio::time::interval(Duration::from_secs(secs)));
                // The first tick completes immediately.
                ticks.next().await;
                loop {
                    tokio::select! {
                        _ = ticks.next() => {
                            let stats = runtime.stats();
                            info!(
                                connected = runtime.is_connected(),
                                host_calls = host.calls(),
                                submitted = stats.submitted,
                                sent = stats.sent,
                                dropped = stats.dropped,
                                coalesced = stats.coalesced,
                                discarded = stats.discarded,
                                "limiter stats"
                            );
                        }
                        _ = Self::wait_for_stop(&self.running) => break,
                    }
                }
            }
        }

        let calls = tokio::task::spawn_blocking(move || host.stop()).await?;
        info!("host stopped after {calls} calls");

        let failures = runtime.detach().await;
        if !failures.is_empty() {
            warn!("{} hooks could not be removed", failures.len());
        }

        self.running.store(false, Ordering::SeqCst);
        info!("helper service stopped");
        Ok(())
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the service is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Internal ─────────────────────────────────────────────────

    async fn attach(&self) -> Result<HelperRuntime, Box<dyn std::error::Error>> {
        let options = self.config.to_helper_options()?;
        let interfaces = InterfaceRegistry::new().with(
            Interface::InProcessUtility,
            Arc::new(UtilityInterface::new(Arc::clone(&self.table))),
        );
        let runtime = HelperRuntime::attach(
            options,
            Arc::clone(&self.table),
            self.config.hook_specs(),
            interfaces,
        )
        .await?;
        Ok(runtime)
    }

    /// Resolves when `running` becomes false.
    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use hookrelay_core::{Dispatcher, DispatcherOptions, Symbol};

    #[test]
    fn service_creates_with_defaults() {
        let svc = HelperService::new(HelperConfig::default());
        assert!(!svc.is_running());
        assert!(
            svc.import_table()
                .resolve(&Symbol::new("user32!SetFocus"))
                .is_some()
        );
    }

    #[test]
    fn stop_handle_works() {
        let svc = HelperService::new(HelperConfig::default());
        let handle = svc.stop_handle();
        handle.store(true, Ordering::SeqCst);
        assert!(svc.is_running());
        svc.stop();
        assert!(!svc.is_running());
    }

    #[tokio::test]
    async fn unknown_hook_symbol_fails_attach() {
        let mut config = HelperConfig::default();
        config.hooks.push(crate::config::HookConfig::new(
            "user32!DoesNotExist",
            hookrelay_core::PriorityClass::Normal,
        ));
        let svc = HelperService::new(config);
        assert!(svc.run().await.is_err());
        assert!(!svc.is_running());
        // Nothing was left patched.
        for (name, _) in crate::host::HOST_APIS {
            assert_eq!(svc.import_table().patch_count(&Symbol::new(name)), 0);
        }
    }

    #[tokio::test]
    async fn service_relays_host_calls_then_stops() {
        let dispatcher = Dispatcher::bind("127.0.0.1:0", DispatcherOptions::default())
            .await
            .unwrap();

        let mut config = HelperConfig::default();
        config.network.controller = dispatcher.local_addr().to_string();
        config.logging.stats_interval_secs = 0;
        config.host.calls_per_second = 500;

        let svc = Arc::new(HelperService::new(config));
        let stop = svc.stop_handle();
        let task = tokio::spawn({
            let svc = Arc::clone(&svc);
            async move { svc.run().await.map_err(|e| e.to_string()) }
        });

        let session = tokio::time::timeout(Duration::from_secs(5), dispatcher.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.process().pid, std::process::id());
        assert!(session.interfaces().contains(&Interface::InProcessUtility));

        let delivery = tokio::time::timeout(Duration::from_secs(5), session.receive())
            .await
            .unwrap();
        assert!(delivery.is_some());

        stop.store(false, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!svc.is_running());
        for (name, _) in crate::host::HOST_APIS {
            assert_eq!(svc.import_table().patch_count(&Symbol::new(name)) % 2, 0);
        }
        dispatcher.shutdown();
    }
}
