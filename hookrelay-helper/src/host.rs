//! Simulated host process.
//!
//! Registers a handful of window-system APIs in an [`ImportTable`] and
//! drives them from plain OS threads, the way a GUI application would
//! call into its imports. Hooks installed by the runtime see these calls.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use hookrelay_core::{
    CallingConvention, EntryPoint, ImportTable, InterfaceHandler, Signature, Symbol,
};

use crate::config::HostConfig;

const STDCALL_0: Signature = Signature::new(CallingConvention::Stdcall, 0);
const STDCALL_1: Signature = Signature::new(CallingConvention::Stdcall, 1);
const STDCALL_2: Signature = Signature::new(CallingConvention::Stdcall, 2);

/// APIs the simulated host imports, with the argument count each takes.
pub const HOST_APIS: [(&str, Signature); 5] = [
    ("user32!GetForegroundWindow", STDCALL_0),
    ("user32!SetFocus", STDCALL_1),
    ("user32!SetWindowTextW", STDCALL_2),
    ("user32!GetCaretPos", STDCALL_1),
    ("comctl32!SendProgressStep", STDCALL_1),
];

/// Register every host API in `table`. Each entry point returns a value
/// derived from its arguments so hooked and unhooked calls can be
/// compared.
pub fn register_host_apis(table: &ImportTable) {
    for (index, (name, signature)) in HOST_APIS.iter().enumerate() {
        let base = 0x1000 * (index as u64 + 1);
        let entry = EntryPoint::new(move |args: &[u64]| {
            args.iter().fold(base, |acc, a| acc.wrapping_add(*a))
        });
        table.register(Symbol::new(name), *signature, entry);
    }
}

// ── Host threads ─────────────────────────────────────────────────

/// Threads calling host APIs until stopped.
pub struct HostThreads {
    stop: Arc<AtomicBool>,
    calls: Arc<AtomicU64>,
    workers: Vec<JoinHandle<()>>,
}

impl HostThreads {
    pub fn spawn(table: Arc<ImportTable>, config: &HostConfig) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicU64::new(0));
        let pause = match config.calls_per_second {
            0 => None,
            rate => Some(Duration::from_secs(1) / rate),
        };

        let workers = (0..config.threads)
            .filter_map(|id| {
                let table = Arc::clone(&table);
                let stop = Arc::clone(&stop);
                let calls = Arc::clone(&calls);
                thread::Builder::new()
                    .name(format!("host-{id}"))
                    .spawn(move || host_loop(id as u64, &table, pause, &stop, &calls))
                    .inspect_err(|e| warn!("failed to start host thread {id}: {e}"))
                    .ok()
            })
            .collect();

        Self {
            stop,
            calls,
            workers,
        }
    }

    /// Calls made so far across all threads.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Stop every thread and wait for it. Returns the total call count.
    pub fn stop(self) -> u64 {
        self.stop.store(true, Ordering::SeqCst);
        for worker in self.workers {
            if worker.join().is_err() {
                warn!("host thread panicked");
            }
        }
        self.calls.load(Ordering::Relaxed)
    }
}

fn host_loop(
    id: u64,
    table: &ImportTable,
    pause: Option<Duration>,
    stop: &AtomicBool,
    calls: &AtomicU64,
) {
    let symbols: Vec<(Symbol, usize)> = HOST_APIS
        .iter()
        .map(|(name, sig)| (Symbol::new(name), sig.arity as usize))
        .collect();
    let mut tick: u64 = 0;

    while !stop.load(Ordering::SeqCst) {
        let Some(pause) = pause else {
            thread::sleep(Duration::from_millis(100));
            continue;
        };
        let (symbol, arity) = &symbols[(tick as usize) % symbols.len()];
        let args: Vec<u64> = (0..*arity as u64).map(|i| id * 1_000 + tick + i).collect();
        if table.call(symbol, &args).is_some() {
            calls.fetch_add(1, Ordering::Relaxed);
        }
        tick = tick.wrapping_add(1);
        thread::sleep(pause);
    }
    debug!(thread = id, "host thread stopped");
}

// ── In-process utility interface ─────────────────────────────────

/// Answers `InProcessUtility` calls from the controller.
///
/// | op | request | reply |
/// |----|---------|-------|
/// | 0  | any bytes | the same bytes |
/// | 1  | empty | bincode `Vec<String>` of imported symbols |
/// | 2  | bincode `(String, Vec<u64>)` | bincode `u64` result of calling it |
pub struct UtilityInterface {
    table: Arc<ImportTable>,
}

impl UtilityInterface {
    pub const ECHO: u32 = 0;
    pub const LIST_SYMBOLS: u32 = 1;
    pub const INVOKE: u32 = 2;

    pub fn new(table: Arc<ImportTable>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl InterfaceHandler for UtilityInterface {
    async fn handle(&self, operation: u32, args: Vec<u8>) -> Result<Vec<u8>, String> {
        match operation {
            Self::ECHO => Ok(args),
            Self::LIST_SYMBOLS => {
                let mut names: Vec<String> = self
                    .table
                    .symbols()
                    .iter()
                    .map(|s| s.as_str().to_owned())
                    .collect();
                names.sort();
                bincode::serialize(&names).map_err(|e| e.to_string())
            }
            Self::INVOKE => {
                let (name, call_args): (String, Vec<u64>) =
                    bincode::deserialize(&args).map_err(|e| e.to_string())?;
                let result = self
                    .table
                    .call(&Symbol::new(&name), &call_args)
                    .ok_or_else(|| format!("no such import: {name}"))?;
                bincode::serialize(&result).map_err(|e| e.to_string())
            }
            other => Err(format!("unknown utility operation {other}")),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn host_table() -> Arc<ImportTable> {
        let table = Arc::new(ImportTable::new());
        register_host_apis(&table);
        table
    }

    #[test]
    fn host_apis_are_registered() {
        let table = host_table();
        assert_eq!(table.symbols().len(), HOST_APIS.len());
        let (sig, _) = table.resolve(&Symbol::new("user32!SetWindowTextW")).unwrap();
        assert_eq!(sig.arity, 2);
        assert_eq!(
            table.call(&Symbol::new("user32!GetForegroundWindow"), &[]),
            Some(0x1000)
        );
    }

    #[test]
    fn host_threads_call_until_stopped() {
        let table = host_table();
        let threads = HostThreads::spawn(
            Arc::clone(&table),
            &HostConfig {
                threads: 2,
                calls_per_second: 1_000,
            },
        );
        assert_eq!(threads.threads(), 2);
        thread::sleep(Duration::from_millis(100));
        let total = threads.stop();
        assert!(total > 0);
    }

    #[test]
    fn idle_host_makes_no_calls() {
        let threads = HostThreads::spawn(
            host_table(),
            &HostConfig {
                threads: 1,
                calls_per_second: 0,
            },
        );
        thread::sleep(Duration::from_millis(50));
        assert_eq!(threads.stop(), 0);
    }

    #[tokio::test]
    async fn utility_lists_and_invokes_imports() {
        let utility = UtilityInterface::new(host_table());

        assert_eq!(
            utility.handle(UtilityInterface::ECHO, vec![1, 2]).await,
            Ok(vec![1, 2])
        );

        let listed = utility
            .handle(UtilityInterface::LIST_SYMBOLS, Vec::new())
            .await
            .unwrap();
        let names: Vec<String> = bincode::deserialize(&listed).unwrap();
        assert!(names.contains(&"user32!GetCaretPos".to_string()));

        let request = bincode::serialize(&("user32!SetFocus".to_string(), vec![5u64])).unwrap();
        let reply = utility
            .handle(UtilityInterface::INVOKE, request)
            .await
            .unwrap();
        assert_eq!(bincode::deserialize::<u64>(&reply).unwrap(), 0x2000 + 5);

        assert!(utility.handle(99, Vec::new()).await.is_err());
    }
}
