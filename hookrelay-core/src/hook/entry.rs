//! Hook entries and the trampolines they install.

use std::cell::Cell;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::{EntryPoint, Signature, Symbol};

// ── Observer ─────────────────────────────────────────────────────

/// Arguments of one intercepted call, as seen by an observer.
#[derive(Debug, Clone, Copy)]
pub struct HookCall<'a> {
    pub hook_id: u64,
    pub symbol: &'a Symbol,
    pub args: &'a [u64],
}

/// Side logic run around the original entry point.
///
/// Runs on host threads, possibly concurrently and recursively. A panic
/// is caught and counted; the host still gets the original result.
pub trait CallObserver: Send + Sync {
    fn before(&self, _call: &HookCall<'_>) {}

    fn after(&self, call: &HookCall<'_>, result: u64);
}

thread_local! {
    static IN_OBSERVER: Cell<bool> = const { Cell::new(false) };
}

/// Run observer code unless this thread is already inside an observer
/// (an observer calling a hooked API must not observe itself).
fn guarded(stats: &HookStats, f: impl FnOnce()) {
    if IN_OBSERVER.with(Cell::get) {
        stats.reentrant_skips.fetch_add(1, Ordering::Relaxed);
        return;
    }
    IN_OBSERVER.with(|c| c.set(true));
    let outcome = catch_unwind(AssertUnwindSafe(f));
    IN_OBSERVER.with(|c| c.set(false));
    if outcome.is_err() {
        stats.observer_faults.fetch_add(1, Ordering::Relaxed);
    }
}

// ── HookState ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    Uninstalled,
    Installed,
    /// The original could not be restored; a trampoline may remain live.
    Failed,
}

impl fmt::Display for HookState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── HookEntry ────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct HookStats {
    calls: AtomicU64,
    observer_faults: AtomicU64,
    reentrant_skips: AtomicU64,
}

struct HookRecord {
    id: u64,
    symbol: Symbol,
    signature: Signature,
    original: EntryPoint,
    trampoline: EntryPoint,
    state: Mutex<HookState>,
    stats: Arc<HookStats>,
}

/// Handle to one hook. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct HookEntry {
    inner: Arc<HookRecord>,
}

impl HookEntry {
    /// Build the trampoline for `original` and wrap both in a new entry in
    /// the `Uninstalled` state.
    pub(crate) fn build(
        id: u64,
        symbol: Symbol,
        signature: Signature,
        original: EntryPoint,
        observer: Arc<dyn CallObserver>,
    ) -> Self {
        let stats = Arc::new(HookStats::default());
        let trampoline = {
            let stats = Arc::clone(&stats);
            let original = original.clone();
            let symbol = symbol.clone();
            EntryPoint::new(move |args: &[u64]| {
                stats.calls.fetch_add(1, Ordering::Relaxed);
                let call = HookCall {
                    hook_id: id,
                    symbol: &symbol,
                    args,
                };
                guarded(&stats, || observer.before(&call));
                let result = original.call(args);
                guarded(&stats, || observer.after(&call, result));
                result
            })
        };
        Self {
            inner: Arc::new(HookRecord {
                id,
                symbol,
                signature,
                original,
                trampoline,
                state: Mutex::new(HookState::Uninstalled),
                stats,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn symbol(&self) -> &Symbol {
        &self.inner.symbol
    }

    pub fn signature(&self) -> Signature {
        self.inner.signature
    }

    /// Address captured at install time. Owned by the image; never freed
    /// by the hook table.
    pub fn original_address(&self) -> usize {
        self.inner.original.address()
    }

    pub fn trampoline_address(&self) -> usize {
        self.inner.trampoline.address()
    }

    pub fn state(&self) -> HookState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of calls that went through the trampoline.
    pub fn call_count(&self) -> u64 {
        self.inner.stats.calls.load(Ordering::Relaxed)
    }

    /// Number of observer panics swallowed by the trampoline.
    pub fn observer_faults(&self) -> u64 {
        self.inner.stats.observer_faults.load(Ordering::Relaxed)
    }

    /// Number of observer invocations skipped for same-thread re-entry.
    pub fn reentrant_skips(&self) -> u64 {
        self.inner.stats.reentrant_skips.load(Ordering::Relaxed)
    }

    /// Call the original entry point, bypassing the trampoline. Valid in
    /// every state because the original belongs to the image.
    pub fn invoke_original(&self, args: &[u64]) -> u64 {
        self.inner.original.call(args)
    }

    pub(crate) fn original(&self) -> &EntryPoint {
        &self.inner.original
    }

    pub(crate) fn trampoline(&self) -> &EntryPoint {
        &self.inner.trampoline
    }

    pub(crate) fn set_state(&self, state: HookState) {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub(crate) fn same_hook(&self, other: &HookEntry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for HookEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookEntry")
            .field("id", &self.id())
            .field("symbol", self.symbol())
            .field("original", &format_args!("{:#x}", self.original_address()))
            .field("trampoline", &format_args!("{:#x}", self.trampoline_address()))
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::CallingConvention;
    use std::sync::atomic::AtomicUsize;

    struct Counting(AtomicUsize);

    impl CallObserver for Counting {
        fn after(&self, _call: &HookCall<'_>, _result: u64) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicky;

    impl CallObserver for Panicky {
        fn before(&self, _call: &HookCall<'_>) {
            panic!("observer bug");
        }

        fn after(&self, _call: &HookCall<'_>, _result: u64) {}
    }

    fn sig() -> Signature {
        Signature::new(CallingConvention::Cdecl, 1)
    }

    #[test]
    fn trampoline_forwards_and_observes() {
        let observer = Arc::new(Counting(AtomicUsize::new(0)));
        let entry = HookEntry::build(
            1,
            Symbol::new("double"),
            sig(),
            EntryPoint::new(|a| a[0] * 2),
            observer.clone(),
        );
        assert_eq!(entry.trampoline().call(&[21]), 42);
        assert_eq!(entry.call_count(), 1);
        assert_eq!(observer.0.load(Ordering::SeqCst), 1);
        assert_eq!(entry.state(), HookState::Uninstalled);
    }

    #[test]
    fn observer_panic_still_returns_original_result() {
        let entry = HookEntry::build(
            2,
            Symbol::new("inc"),
            sig(),
            EntryPoint::new(|a| a[0] + 1),
            Arc::new(Panicky),
        );
        assert_eq!(entry.trampoline().call(&[1]), 2);
        assert_eq!(entry.observer_faults(), 1);
    }

    #[test]
    fn invoke_original_bypasses_trampoline() {
        let entry = HookEntry::build(
            3,
            Symbol::new("id"),
            sig(),
            EntryPoint::new(|a| a[0]),
            Arc::new(Counting(AtomicUsize::new(0))),
        );
        assert_eq!(entry.invoke_original(&[9]), 9);
        assert_eq!(entry.call_count(), 0);
    }
}
