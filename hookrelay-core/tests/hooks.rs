//! Hook table behaviour under concurrency and long install/uninstall
//! sequences.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use hookrelay_core::{
    CallObserver, CallingConvention, EntryPoint, HookCall, HookState, HookTable, HookTarget,
    ImportTable, Signature, Symbol,
};

const SIG: Signature = Signature::new(CallingConvention::Win64, 2);

#[derive(Default)]
struct Tally {
    before: AtomicU64,
    after: AtomicU64,
    result_sum: AtomicU64,
}

impl CallObserver for Tally {
    fn before(&self, _call: &HookCall<'_>) {
        self.before.fetch_add(1, Ordering::Relaxed);
    }

    fn after(&self, _call: &HookCall<'_>, result: u64) {
        self.after.fetch_add(1, Ordering::Relaxed);
        self.result_sum.fetch_add(result, Ordering::Relaxed);
    }
}

fn table_with(symbols: &[&str]) -> (Arc<ImportTable>, Vec<(Symbol, EntryPoint)>) {
    let table = Arc::new(ImportTable::new());
    let originals = symbols
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let symbol = Symbol::new(name);
            let offset = i as u64 * 1000;
            let entry = EntryPoint::new(move |args| args[0] * args[1] + offset);
            table.register(symbol.clone(), SIG, entry.clone());
            (symbol, entry)
        })
        .collect();
    (table, originals)
}

#[test]
fn test_concurrent_calls_through_one_hook() {
    const THREADS: usize = 2;
    const CALLS: u64 = 10_000;

    let (table, _) = table_with(&["user32!GetWindowTextW"]);
    let symbol = Symbol::new("user32!GetWindowTextW");
    let hooks = HookTable::new(Arc::clone(&table));
    let tally = Arc::new(Tally::default());
    let entry = hooks
        .install(HookTarget::new(symbol.clone(), SIG, tally.clone()))
        .unwrap();

    let barrier = Arc::new(Barrier::new(THREADS));
    let workers: Vec<_> = (0..THREADS as u64)
        .map(|t| {
            let table = Arc::clone(&table);
            let symbol = symbol.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..CALLS {
                    // Both threads get the original result.
                    assert_eq!(table.call(&symbol, &[i, t + 1]), Some(i * (t + 1)));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let total = THREADS as u64 * CALLS;
    assert_eq!(entry.call_count(), total);
    assert_eq!(tally.before.load(Ordering::Relaxed), total);
    assert_eq!(tally.after.load(Ordering::Relaxed), total);
    let expected_sum: u64 = (0..THREADS as u64)
        .map(|t| (0..CALLS).map(|i| i * (t + 1)).sum::<u64>())
        .sum();
    assert_eq!(tally.result_sum.load(Ordering::Relaxed), expected_sum);
}

#[test]
fn test_install_uninstall_sequence_patches_only_installed() {
    let names = [
        "a!One", "a!Two", "a!Three", "b!Four", "b!Five", "c!Six", "c!Seven", "c!Eight",
    ];
    let (table, originals) = table_with(&names);
    let hooks = HookTable::new(Arc::clone(&table));
    let observer = Arc::new(Tally::default());

    // Deterministic pseudo-random walk over install/uninstall.
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    let mut installed: HashSet<Symbol> = HashSet::new();
    for _ in 0..500 {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        let (symbol, _) = &originals[(seed % originals.len() as u64) as usize];

        if installed.contains(symbol) {
            let entry = hooks.get(symbol).unwrap();
            hooks.uninstall(&entry).unwrap();
            assert_eq!(entry.state(), HookState::Uninstalled);
            installed.remove(symbol);
        } else {
            let entry = hooks
                .install(HookTarget::new(symbol.clone(), SIG, observer.clone()))
                .unwrap();
            assert_eq!(entry.state(), HookState::Installed);
            installed.insert(symbol.clone());
        }

        for (symbol, original) in &originals {
            let (_, current) = table.resolve(symbol).unwrap();
            assert_eq!(
                !current.same_as(original),
                installed.contains(symbol),
                "{symbol} patched state diverged"
            );
        }
        assert_eq!(hooks.len(), installed.len());
    }

    assert!(hooks.uninstall_all().is_empty());
    for (symbol, original) in &originals {
        assert!(table.resolve(symbol).unwrap().1.same_as(original));
    }
}

#[test]
fn test_original_reachable_from_inside_observer() {
    struct CallsOriginal {
        table: Arc<ImportTable>,
        seen: AtomicU64,
    }

    impl CallObserver for CallsOriginal {
        fn after(&self, call: &HookCall<'_>, result: u64) {
            // Re-entering the hooked API from side logic must not recurse
            // into this observer.
            let again = self.table.call(call.symbol, call.args).unwrap();
            assert_eq!(again, result);
            self.seen.fetch_add(1, Ordering::Relaxed);
        }
    }

    let (table, _) = table_with(&["k!Sleep"]);
    let symbol = Symbol::new("k!Sleep");
    let hooks = HookTable::new(Arc::clone(&table));
    let observer = Arc::new(CallsOriginal {
        table: Arc::clone(&table),
        seen: AtomicU64::new(0),
    });
    let entry = hooks
        .install(HookTarget::new(symbol.clone(), SIG, observer.clone()))
        .unwrap();

    assert_eq!(table.call(&symbol, &[3, 4]), Some(12));
    assert_eq!(observer.seen.load(Ordering::Relaxed), 1);
    assert_eq!(entry.call_count(), 2);
    assert_eq!(entry.reentrant_skips(), 2);
    assert_eq!(entry.observer_faults(), 0);
    assert_eq!(hooks.invoke_original(&entry, &[5, 5]), 25);
}
