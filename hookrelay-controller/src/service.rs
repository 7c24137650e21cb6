//! Controller service core logic.
//!
//! Accepts helpers on the configured address and feeds every session
//! into the [`EventJournal`] until stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use hookrelay_core::Dispatcher;

use crate::config::ControllerConfig;
use crate::journal::EventJournal;

// ── ControllerService ────────────────────────────────────────────

pub struct ControllerService {
    config: ControllerConfig,
    journal: Arc<EventJournal>,
    running: Arc<AtomicBool>,
}

impl ControllerService {
    pub fn new(config: ControllerConfig) -> Self {
        let journal = Arc::new(EventJournal::new(config.logging.events));
        Self::with_journal(config, journal)
    }

    pub fn with_journal(config: ControllerConfig, journal: Arc<EventJournal>) -> Self {
        Self {
            config,
            journal,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn journal(&self) -> &Arc<EventJournal> {
        &self.journal
    }

    /// Run the service until stopped.
    ///
    /// 1. Binds the listener helpers connect to.
    /// 2. Serves every session into the journal.
    /// 3. Logs a session summary on an interval.
    /// 4. Detaches all helpers when `running` becomes `false`.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.running.store(true, Ordering::SeqCst);

        let dispatcher = Arc::new(
            Dispatcher::bind(
                self.config.network.listen.as_str(),
                self.config.to_dispatcher_options(),
            )
            .await?,
        );
        info!("controller listening on {}", dispatcher.local_addr());

        let cancel = CancellationToken::new();
        if self.config.logging.stats_interval_secs > 0 {
            tokio::spawn(report_sessions(
                Arc::clone(&dispatcher),
                Arc::clone(&self.journal),
                Duration::from_secs(self.config.logging.stats_interval_secs),
                cancel.clone(),
            ));
        }

        let serve = dispatcher.serve(self.journal.clone(), cancel.clone());
        tokio::pin!(serve);
        let stopped = tokio::select! {
            _ = &mut serve => false,
            _ = Self::wait_for_stop(&self.running) => true,
        };
        cancel.cancel();
        if stopped {
            serve.await;
        }

        let totals = self.journal.totals();
        info!(
            sessions = totals.sessions,
            events = totals.events,
            discarded = totals.discarded,
            "controller stopped"
        );
        self.running.store(false, Ordering::SeqCst);
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

async fn report_sessions(
    dispatcher: Arc<Dispatcher>,
    journal: Arc<EventJournal>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticks = IntervalStream::new(tokio::time::interval(every));
    // The first tick completes immediately.
    ticks.next().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticks.next() => {}
        }
        let sessions = dispatcher.sessions();
        let totals = journal.totals();
        info!(
            live = sessions.iter().filter(|s| s.is_open()).count(),
            events = totals.events,
            resyncs = totals.resyncs,
            discarded = totals.discarded,
            lost = totals.channels_lost,
            "session summary"
        );
        for session in sessions {
            info!(
                session = session.id(),
                pid = session.process().pid,
                state = %session.state(),
                age = ?session.age(),
                "session"
            );
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventFormat;
    use hookrelay_core::{
        Channel, ChannelOptions, Endpoint, Event, Hello, Message, PROTOCOL_VERSION, PriorityClass,
        ProcessIdentity, SourceId,
    };

    #[test]
    fn stop_handle_works() {
        let svc = ControllerService::new(ControllerConfig::default());
        let handle = svc.stop_handle();
        handle.store(true, Ordering::SeqCst);
        assert!(svc.is_running());
        svc.stop();
        assert!(!svc.is_running());
    }

    #[tokio::test]
    async fn journal_counts_events_from_a_helper() {
        // Reserve a free port, then hand it to the service.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut config = ControllerConfig::default();
        config.network.listen = format!("127.0.0.1:{port}");
        config.logging.stats_interval_secs = 0;
        let journal = Arc::new(EventJournal::with_writer(
            EventFormat::Off,
            Box::new(std::io::sink()),
        ));
        let svc = Arc::new(ControllerService::with_journal(config, Arc::clone(&journal)));
        let stop = svc.stop_handle();
        let task = tokio::spawn({
            let svc = Arc::clone(&svc);
            async move { svc.run().await.map_err(|e| e.to_string()) }
        });

        let endpoint: Endpoint = format!("127.0.0.1:{port}").parse().unwrap();
        let channel = loop {
            match Channel::connect(&endpoint, ChannelOptions::default()).await {
                Ok(channel) => break channel,
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        };
        let process = ProcessIdentity {
            pid: 4242,
            image: "notepad.exe".into(),
        };
        channel
            .send(&Message::Hello(Hello {
                protocol_version: PROTOCOL_VERSION,
                process,
                interfaces: Vec::new(),
            }))
            .await
            .unwrap();
        for i in 0..3 {
            let event = Event::new(SourceId(i), PriorityClass::Normal, vec![i as u8]).unwrap();
            channel.send(&Message::Event(event)).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while journal.tally(4242).map(|t| t.events) != Some(3) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let tally = journal.tally(4242).unwrap();
        assert_eq!(tally.sessions, 1);
        assert_eq!(tally.undecoded, 3);

        channel.close().await;
        stop.store(false, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
