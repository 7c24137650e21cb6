//! Event journal: the controller's [`EventHandler`].
//!
//! Every delivery is counted per process and, depending on
//! [`EventFormat`], written out as a tracing line or a JSON object.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use hookrelay_core::{CallRecord, Delivery, EventHandler, FrameFlags, PriorityClass, Session};

use crate::config::EventFormat;

/// Per-process counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessTally {
    pub sessions: u64,
    pub events: u64,
    /// Events delivered after waiting for a later window.
    pub deferred: u64,
    /// Events that replaced older ones of the same source.
    pub coalesced: u64,
    pub resyncs: u64,
    /// Events the helper reported as discarded.
    pub discarded: u64,
    pub channels_lost: u64,
    /// Event payloads that were not call records.
    pub undecoded: u64,
}

/// One journal line in JSON form.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Entry<'a> {
    Open {
        session: u64,
        pid: u32,
        image: &'a str,
    },
    Event {
        session: u64,
        pid: u32,
        sequence: u64,
        source: u64,
        priority: PriorityClass,
        timestamp_us: u64,
        flags: Vec<&'static str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        call: Option<CallRecord>,
    },
    Resync {
        session: u64,
        pid: u32,
        discarded: u32,
    },
    ChannelLost {
        session: u64,
        pid: u32,
        reason: &'a str,
    },
    Close {
        session: u64,
        pid: u32,
    },
}

pub struct EventJournal {
    format: EventFormat,
    out: Mutex<Box<dyn Write + Send>>,
    tallies: Mutex<HashMap<u32, ProcessTally>>,
}

impl EventJournal {
    /// Journal writing JSON lines to stdout.
    pub fn new(format: EventFormat) -> Self {
        Self::with_writer(format, Box::new(std::io::stdout()))
    }

    pub fn with_writer(format: EventFormat, out: Box<dyn Write + Send>) -> Self {
        Self {
            format,
            out: Mutex::new(out),
            tallies: Mutex::new(HashMap::new()),
        }
    }

    pub fn tally(&self, pid: u32) -> Option<ProcessTally> {
        self.lock_tallies().get(&pid).copied()
    }

    /// Sum over every process seen so far.
    pub fn totals(&self) -> ProcessTally {
        self.lock_tallies()
            .values()
            .fold(ProcessTally::default(), |mut acc, t| {
                acc.sessions += t.sessions;
                acc.events += t.events;
                acc.deferred += t.deferred;
                acc.coalesced += t.coalesced;
                acc.resyncs += t.resyncs;
                acc.discarded += t.discarded;
                acc.channels_lost += t.channels_lost;
                acc.undecoded += t.undecoded;
                acc
            })
    }

    fn lock_tallies(&self) -> MutexGuard<'_, HashMap<u32, ProcessTally>> {
        self.tallies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, pid: u32, f: impl FnOnce(&mut ProcessTally)) {
        f(self.lock_tallies().entry(pid).or_default());
    }

    fn write_json(&self, entry: &Entry<'_>) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        let written = serde_json::to_writer(&mut *out, entry)
            .map_err(std::io::Error::from)
            .and_then(|()| out.write_all(b"\n"))
            .and_then(|()| out.flush());
        if let Err(e) = written {
            warn!("journal write failed: {e}");
        }
    }
}

fn flag_names(flags: FrameFlags) -> Vec<&'static str> {
    flags.iter_names().map(|(name, _)| name).collect()
}

#[async_trait]
impl EventHandler for EventJournal {
    async fn on_open(&self, session: &Session) {
        let pid = session.process().pid;
        self.update(pid, |t| t.sessions += 1);
        info!(
            session = session.id(),
            pid,
            image = %session.process().image,
            interfaces = session.interfaces().len(),
            "helper attached"
        );
        if self.format == EventFormat::Json {
            self.write_json(&Entry::Open {
                session: session.id(),
                pid,
                image: &session.process().image,
            });
        }
    }

    async fn on_delivery(&self, session: &Session, delivery: Delivery) {
        let pid = session.process().pid;
        match delivery {
            Delivery::Event {
                event,
                sequence,
                flags,
            } => {
                let call = CallRecord::decode(event.payload()).ok();
                self.update(pid, |t| {
                    t.events += 1;
                    t.deferred += u64::from(flags.contains(FrameFlags::DEFERRED));
                    t.coalesced += u64::from(flags.contains(FrameFlags::COALESCED));
                    t.undecoded += u64::from(call.is_none());
                });
                match self.format {
                    EventFormat::Text => match &call {
                        Some(call) => info!(
                            pid,
                            sequence,
                            priority = %event.priority(),
                            flags = ?flags,
                            "{}({:?}) = {:#x}",
                            call.symbol,
                            call.args,
                            call.result
                        ),
                        None => info!(
                            pid,
                            sequence,
                            priority = %event.priority(),
                            bytes = event.payload().len(),
                            "event"
                        ),
                    },
                    EventFormat::Json => self.write_json(&Entry::Event {
                        session: session.id(),
                        pid,
                        sequence,
                        source: event.source().0,
                        priority: event.priority(),
                        timestamp_us: event.timestamp_us(),
                        flags: flag_names(flags),
                        call,
                    }),
                    EventFormat::Off => {}
                }
            }
            Delivery::Resync { discarded } => {
                self.update(pid, |t| {
                    t.resyncs += 1;
                    t.discarded += u64::from(discarded);
                });
                warn!(pid, discarded, "helper discarded events while disconnected");
                if self.format == EventFormat::Json {
                    self.write_json(&Entry::Resync {
                        session: session.id(),
                        pid,
                        discarded,
                    });
                }
            }
            Delivery::ChannelLost { reason } => {
                self.update(pid, |t| t.channels_lost += 1);
                warn!(pid, %reason, "helper channel lost");
                if self.format == EventFormat::Json {
                    self.write_json(&Entry::ChannelLost {
                        session: session.id(),
                        pid,
                        reason: &reason,
                    });
                }
            }
        }
    }

    async fn on_close(&self, session: &Session) {
        let pid = session.process().pid;
        let tally = self.tally(pid).unwrap_or_default();
        info!(
            session = session.id(),
            pid,
            events = tally.events,
            discarded = tally.discarded,
            "helper detached"
        );
        if self.format == EventFormat::Json {
            self.write_json(&Entry::Close {
                session: session.id(),
                pid,
            });
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
