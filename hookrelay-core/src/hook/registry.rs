//! Install / uninstall bookkeeping on top of an [`ImportTable`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use super::entry::{CallObserver, HookEntry, HookState};
use super::{ImportTable, Signature, Symbol};
use crate::error::{HookError, HookInstallError, HookNotFoundError};

/// What to hook and what to run when it is called.
#[derive(Clone)]
pub struct HookTarget {
    pub symbol: Symbol,
    /// Signature the caller expects; must match the table's.
    pub signature: Signature,
    pub observer: Arc<dyn CallObserver>,
}

impl HookTarget {
    pub fn new(symbol: Symbol, signature: Signature, observer: Arc<dyn CallObserver>) -> Self {
        Self {
            symbol,
            signature,
            observer,
        }
    }
}

impl std::fmt::Debug for HookTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookTarget")
            .field("symbol", &self.symbol)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// The set of hooks this helper owns in one dispatch table.
///
/// A symbol is hooked at most once per table. Entries stay registered
/// while `Installed` or `Failed`; a `Failed` entry can be retried with
/// [`uninstall`](Self::uninstall).
pub struct HookTable {
    table: Arc<ImportTable>,
    hooks: Mutex<HashMap<Symbol, HookEntry>>,
    next_id: AtomicU64,
}

impl HookTable {
    pub fn new(table: Arc<ImportTable>) -> Self {
        Self {
            table,
            hooks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The dispatch table this hook table patches.
    pub fn import_table(&self) -> &Arc<ImportTable> {
        &self.table
    }

    /// Patch `target.symbol` to a trampoline around its current entry.
    ///
    /// Either the slot is rewritten and an `Installed` entry is returned,
    /// or nothing is written at all.
    pub fn install(&self, target: HookTarget) -> Result<HookEntry, HookInstallError> {
        let mut hooks = self.hooks();
        self.install_locked(&mut hooks, target)
    }

    /// Install a batch. On the first failure every hook the batch already
    /// installed is removed again before the error is returned.
    pub fn install_all(&self, targets: Vec<HookTarget>) -> Result<Vec<HookEntry>, HookInstallError> {
        let mut hooks = self.hooks();
        let mut done: Vec<HookEntry> = Vec::with_capacity(targets.len());
        for target in targets {
            match self.install_locked(&mut hooks, target) {
                Ok(entry) => done.push(entry),
                Err(e) => {
                    warn!("hook batch failed ({e}); rolling back {} hook(s)", done.len());
                    for entry in done.iter().rev() {
                        if let Err(rollback) = self.uninstall_locked(&mut hooks, entry) {
                            error!("rollback of {} failed: {rollback}", entry.symbol());
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(done)
    }

    /// Put the original entry point back.
    ///
    /// Fails with `NotFound` if this table does not own `entry`, or with
    /// `RestoreFailed` if the slot no longer holds the trampoline. In the
    /// latter case the entry is marked `Failed` and stays registered.
    pub fn uninstall(&self, entry: &HookEntry) -> Result<(), HookError> {
        let mut hooks = self.hooks();
        self.uninstall_locked(&mut hooks, entry)
    }

    /// Remove every hook. Never panics; returns the failures.
    pub fn uninstall_all(&self) -> Vec<HookError> {
        let mut hooks = self.hooks();
        let entries: Vec<HookEntry> = hooks.values().cloned().collect();
        let failures: Vec<HookError> = entries
            .iter()
            .filter_map(|entry| self.uninstall_locked(&mut hooks, entry).err())
            .collect();
        if !entries.is_empty() {
            info!(
                "uninstalled {} of {} hook(s)",
                entries.len() - failures.len(),
                entries.len()
            );
        }
        failures
    }

    /// Forward to the original entry captured at install time.
    pub fn invoke_original(&self, entry: &HookEntry, args: &[u64]) -> u64 {
        entry.invoke_original(args)
    }

    pub fn get(&self, symbol: &Symbol) -> Option<HookEntry> {
        self.hooks().get(symbol).cloned()
    }

    pub fn is_hooked(&self, symbol: &Symbol) -> bool {
        self.hooks().contains_key(symbol)
    }

    /// Entries currently in the `Installed` state, sorted by symbol.
    pub fn installed(&self) -> Vec<HookEntry> {
        let mut out: Vec<HookEntry> = self
            .hooks()
            .values()
            .filter(|e| e.state() == HookState::Installed)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.symbol().cmp(b.symbol()));
        out
    }

    pub fn len(&self) -> usize {
        self.hooks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Internal ─────────────────────────────────────────────────

    fn hooks(&self) -> MutexGuard<'_, HashMap<Symbol, HookEntry>> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn install_locked(
        &self,
        hooks: &mut HashMap<Symbol, HookEntry>,
        target: HookTarget,
    ) -> Result<HookEntry, HookInstallError> {
        let HookTarget {
            symbol,
            signature,
            observer,
        } = target;

        if hooks.contains_key(&symbol) {
            return Err(HookInstallError::AlreadyHooked(symbol));
        }
        if !signature.convention.is_trampolinable() {
            return Err(HookInstallError::UnsupportedSignature {
                reason: format!("{:?} calls cannot be trampolined", signature.convention),
                symbol,
            });
        }

        let (actual, original) = self
            .table
            .resolve(&symbol)
            .ok_or_else(|| HookInstallError::UnknownSymbol(symbol.clone()))?;
        if actual != signature {
            return Err(HookInstallError::UnsupportedSignature {
                reason: format!("expected {signature}, table has {actual}"),
                symbol,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = HookEntry::build(id, symbol.clone(), signature, original, observer);
        if !self
            .table
            .compare_and_swap(&symbol, entry.original(), entry.trampoline().clone())
        {
            return Err(HookInstallError::SlotChanged(symbol));
        }

        entry.set_state(HookState::Installed);
        hooks.insert(symbol, entry.clone());
        debug!(
            "hooked {} ({:#x} -> {:#x})",
            entry.symbol(),
            entry.original_address(),
            entry.trampoline_address()
        );
        Ok(entry)
    }

    fn uninstall_locked(
        &self,
        hooks: &mut HashMap<Symbol, HookEntry>,
        entry: &HookEntry,
    ) -> Result<(), HookError> {
        let owned = hooks
            .get(entry.symbol())
            .is_some_and(|registered| registered.same_hook(entry));
        if !owned {
            return Err(HookNotFoundError {
                symbol: entry.symbol().clone(),
                id: entry.id(),
            }
            .into());
        }

        if self.table.compare_and_swap(
            entry.symbol(),
            entry.trampoline(),
            entry.original().clone(),
        ) {
            entry.set_state(HookState::Uninstalled);
            hooks.remove(entry.symbol());
            debug!("unhooked {}", entry.symbol());
            Ok(())
        } else {
            entry.set_state(HookState::Failed);
            error!(
                "cannot restore {}: slot no longer holds trampoline {:#x}",
                entry.symbol(),
                entry.trampoline_address()
            );
            Err(HookError::RestoreFailed {
                symbol: entry.symbol().clone(),
            })
        }
    }
}

impl Drop for HookTable {
    fn drop(&mut self) {
        for failure in self.uninstall_all() {
            error!("hook left behind at detach: {failure}");
        }
    }
}

impl std::fmt::Debug for HookTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookTable")
            .field("hooks", &self.len())
            .finish()
    }
}
