//! Process-wide symbol interning
//!
//! Every method name, ivar name, and constant name is interned once into
//! a stable `u32` id so that method tables and ivar maps can key on an
//! integer compare instead of hashing a string on every lookup.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

/// An interned symbol. Cheap to copy, compares by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

impl Symbol {
    pub fn id(self) -> u32 {
        self.0
    }

    pub fn name(self) -> String {
        SymbolTable::global().name_of(self)
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, ":{}", self.name())
    }
}

struct SymbolTableInner {
    by_name: HashMap<String, Symbol>,
    by_id: Vec<String>,
}

/// The process-wide intern table. A single instance lives behind a
/// `RwLock`: reads (the common case, resolving a known symbol back to
/// its name during inspect/backtrace formatting) take a shared lock;
/// interning a never-before-seen name takes an exclusive one.
pub struct SymbolTable {
    inner: RwLock<SymbolTableInner>,
    next_id: AtomicU32,
}

impl SymbolTable {
    fn new() -> Self {
        SymbolTable {
            inner: RwLock::new(SymbolTableInner {
                by_name: HashMap::new(),
                by_id: Vec::new(),
            }),
            next_id: AtomicU32::new(0),
        }
    }

    pub fn global() -> &'static SymbolTable {
        static TABLE: std::sync::OnceLock<SymbolTable> = std::sync::OnceLock::new();
        TABLE.get_or_init(SymbolTable::new)
    }

    pub fn intern(&self, name: &str) -> Symbol {
        if let Some(sym) = self.inner.read().unwrap().by_name.get(name) {
            return *sym;
        }
        let mut inner = self.inner.write().unwrap();
        // Re-check: another writer may have interned it while we waited.
        if let Some(sym) = inner.by_name.get(name) {
            return *sym;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sym = Symbol(id);
        inner.by_name.insert(name.to_string(), sym);
        inner.by_id.push(name.to_string());
        sym
    }

    fn name_of(&self, sym: Symbol) -> String {
        self.inner
            .read()
            .unwrap()
            .by_id
            .get(sym.0 as usize)
            .cloned()
            .unwrap_or_else(|| format!("<unknown-symbol-{}>", sym.0))
    }
}

/// Intern `name`, returning its stable `Symbol`.
pub fn intern(name: &str) -> Symbol {
    SymbolTable::global().intern(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let a = intern("foo");
        let b = intern("foo");
        assert_eq!(a, b);
        assert_eq!(a.name(), "foo");
    }

    #[test]
    fn distinct_names_get_distinct_ids() {
        let a = intern("alpha_sym_distinct");
        let b = intern("beta_sym_distinct");
        assert_ne!(a, b);
    }
}
