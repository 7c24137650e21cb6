//! The process-local dispatch table host code calls through.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{EntryPoint, Signature, Symbol};

struct Slot {
    signature: Signature,
    current: EntryPoint,
    /// Number of times the slot was rewritten after registration.
    patches: u64,
}

/// Named entry points, shared by every thread of the process.
///
/// The one `RwLock` here is the process-wide patch lock: slot edits take
/// it for writing, calls take it for reading only long enough to clone
/// the entry point.
#[derive(Default)]
pub struct ImportTable {
    slots: RwLock<HashMap<Symbol, Slot>>,
}

static GLOBAL: OnceLock<Arc<ImportTable>> = OnceLock::new();

impl ImportTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The table of the current process.
    pub fn global() -> Arc<ImportTable> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(ImportTable::new())))
    }

    /// Publish an entry point, as the image loader does for exports.
    /// Re-registering a symbol replaces it and resets its patch count.
    pub fn register(&self, symbol: Symbol, signature: Signature, entry: EntryPoint) {
        self.write().insert(
            symbol,
            Slot {
                signature,
                current: entry,
                patches: 0,
            },
        );
    }

    /// Current signature and entry point of a symbol.
    pub fn resolve(&self, symbol: &Symbol) -> Option<(Signature, EntryPoint)> {
        self.read()
            .get(symbol)
            .map(|slot| (slot.signature, slot.current.clone()))
    }

    /// Call through the table. `None` if the symbol is not present.
    pub fn call(&self, symbol: &Symbol, args: &[u64]) -> Option<u64> {
        let entry = self.read().get(symbol).map(|slot| slot.current.clone())?;
        Some(entry.call(args))
    }

    /// How many times the slot was rewritten since registration.
    pub fn patch_count(&self, symbol: &Symbol) -> u64 {
        self.read().get(symbol).map(|slot| slot.patches).unwrap_or(0)
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        let mut out: Vec<Symbol> = self.read().keys().cloned().collect();
        out.sort();
        out
    }

    /// Replace the slot's entry point only if it is still `expected`.
    ///
    /// Returns `false` and writes nothing when the symbol is missing or
    /// the slot holds something else.
    pub(crate) fn compare_and_swap(
        &self,
        symbol: &Symbol,
        expected: &EntryPoint,
        replacement: EntryPoint,
    ) -> bool {
        let mut slots = self.write();
        match slots.get_mut(symbol) {
            Some(slot) if slot.current.same_as(expected) => {
                slot.current = replacement;
                slot.patches += 1;
                true
            }
            _ => false,
        }
    }

    // The host may have panicked mid-call on another thread; the map is
    // still structurally valid, so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<Symbol, Slot>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Symbol, Slot>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ImportTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportTable")
            .field("symbols", &self.symbols())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::CallingConvention;

    const SIG: Signature = Signature::new(CallingConvention::Stdcall, 2);

    #[test]
    fn call_through_table() {
        let table = ImportTable::new();
        table.register(Symbol::new("add"), SIG, EntryPoint::new(|a| a[0] + a[1]));
        assert_eq!(table.call(&Symbol::new("add"), &[2, 3]), Some(5));
        assert_eq!(table.call(&Symbol::new("missing"), &[]), None);
    }

    #[test]
    fn cas_requires_expected_entry() {
        let table = ImportTable::new();
        let original = EntryPoint::new(|_| 1);
        let sym = Symbol::new("f");
        table.register(sym.clone(), SIG, original.clone());

        let stranger = EntryPoint::new(|_| 2);
        assert!(!table.compare_and_swap(&sym, &stranger, EntryPoint::new(|_| 3)));
        assert_eq!(table.patch_count(&sym), 0);

        assert!(table.compare_and_swap(&sym, &original, EntryPoint::new(|_| 4)));
        assert_eq!(table.call(&sym, &[]), Some(4));
        assert_eq!(table.patch_count(&sym), 1);
    }

    #[test]
    fn global_is_shared() {
        let a = ImportTable::global();
        let b = ImportTable::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
