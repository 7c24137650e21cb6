//! API hook table.
//!
//! Host code calls process-local APIs through an [`ImportTable`]. The
//! [`HookTable`] swaps table slots for trampolines that run a
//! [`CallObserver`] around the original entry point, and puts the original
//! back on uninstall.
//!
//! ```text
//!  host thread ──► ImportTable::call(sym) ──► trampoline
//!                                               ├─ observer.before
//!                                               ├─ original(args)
//!                                               └─ observer.after ──► limiter
//! ```
//!
//! Only the slot edit happens under the table's write lock. Calls clone
//! the slot's entry point under a read lock and release it before running
//! any target code.

mod entry;
mod registry;
mod table;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use entry::{CallObserver, HookCall, HookEntry, HookState};
pub use registry::{HookTable, HookTarget};
pub use table::ImportTable;

// ── Symbol ───────────────────────────────────────────────────────

/// Identity of an API entry point, e.g. `user32!GetFocus`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(Arc<str>);

impl Symbol {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

// ── Signature ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallingConvention {
    Cdecl,
    Stdcall,
    Fastcall,
    Thiscall,
    Win64,
    /// Argument count unknown at the call site; cannot be trampolined.
    Variadic,
}

impl CallingConvention {
    pub fn is_trampolinable(self) -> bool {
        !matches!(self, CallingConvention::Variadic)
    }
}

/// Shape of an entry point: how it is called and how many word-sized
/// arguments it takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub convention: CallingConvention,
    pub arity: u8,
}

impl Signature {
    pub const fn new(convention: CallingConvention, arity: u8) -> Self {
        Self { convention, arity }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}", self.convention, self.arity)
    }
}

// ── EntryPoint ───────────────────────────────────────────────────

/// Word-sized argument in, word-sized result out.
pub type ApiFn = dyn Fn(&[u64]) -> u64 + Send + Sync;

/// A callable entry point. Cloning shares the same function; identity
/// (`same_as`, `address`) follows the shared allocation.
#[derive(Clone)]
pub struct EntryPoint {
    func: Arc<ApiFn>,
}

impl EntryPoint {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[u64]) -> u64 + Send + Sync + 'static,
    {
        Self { func: Arc::new(f) }
    }

    #[inline]
    pub fn call(&self, args: &[u64]) -> u64 {
        (self.func)(args)
    }

    pub fn same_as(&self, other: &EntryPoint) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }

    /// Stable address of this entry point for logs and diagnostics.
    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.func) as *const () as usize
    }
}

impl fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryPoint({:#x})", self.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_point_identity_follows_clone() {
        let a = EntryPoint::new(|args| args.iter().sum());
        let b = a.clone();
        let c = EntryPoint::new(|args| args.iter().sum());
        assert!(a.same_as(&b));
        assert_eq!(a.address(), b.address());
        assert!(!a.same_as(&c));
        assert_eq!(a.call(&[1, 2, 3]), 6);
    }

    #[test]
    fn variadic_is_not_trampolinable() {
        assert!(!CallingConvention::Variadic.is_trampolinable());
        assert!(CallingConvention::Stdcall.is_trampolinable());
    }

    #[test]
    fn symbol_display() {
        let s = Symbol::new("user32!GetFocus");
        assert_eq!(s.to_string(), "user32!GetFocus");
        assert_eq!(s, Symbol::from("user32!GetFocus"));
    }

    #[test]
    fn symbol_travels_as_a_plain_string() {
        let s = Symbol::new("user32!SetFocus");
        let bytes = bincode::serialize(&s).unwrap();
        assert_eq!(bytes, bincode::serialize("user32!SetFocus").unwrap());
        let back: Symbol = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, s);
    }
}
