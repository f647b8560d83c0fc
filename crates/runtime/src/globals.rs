//! Process-wide global variables (`$VERBOSE`, `$PROGRAM_NAME`, and
//! user-defined `$foo` globals) plus the runtime's environment-variable
//! configuration knobs.
//!
//! Global variables live per-OS-thread, mirroring the thread-local heap
//! and fiber scheduler: this runtime has no cross-thread sharing story,
//! so a `Mutex`-guarded global table would only add contention no one
//! needs.

use std::cell::RefCell;
use std::collections::HashMap;

use rbcore::{Symbol, Value};

thread_local! {
    static GLOBALS: RefCell<HashMap<Symbol, Value>> = RefCell::new(HashMap::new());
}

pub fn get(name: Symbol) -> Value {
    GLOBALS.with(|g| g.borrow().get(&name).copied().unwrap_or_else(Value::nil))
}

pub fn set(name: Symbol, value: Value) {
    GLOBALS.with(|g| {
        g.borrow_mut().insert(name, value);
    });
}

/// Every currently-bound global, used as an explicit GC root set
/// alongside the active `Env` chain and constant tables.
pub fn all_values() -> Vec<Value> {
    GLOBALS.with(|g| g.borrow().values().copied().collect())
}

fn verbose_symbol() -> Symbol {
    rbcore::symbol::intern("$VERBOSE")
}

/// `$VERBOSE`: gates warning-level diagnostics emitted by the dispatcher
/// and constant resolver (deprecated-constant warnings, redefinition
/// notices). Defaults to truthy, matching a freshly booted interpreter
/// running without `-W0`.
pub fn verbose() -> bool {
    GLOBALS.with(|g| {
        g.borrow()
            .get(&verbose_symbol())
            .map(|v| v.is_truthy())
            .unwrap_or(true)
    })
}

pub fn set_verbose(value: Value) {
    set(verbose_symbol(), value);
}

/// Runtime tuning read once from the environment at bootstrap and
/// threaded through explicitly rather than re-read on every allocation;
/// see the heap block size / GC watermark / fiber stack size knobs this
/// mirrors in `rbcore::heap` and `crate::fiber`.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    pub heap_block_size: usize,
    pub gc_low_watermark: f64,
    pub gc_high_watermark: f64,
    pub fiber_stack_size: usize,
    pub fiber_registry_size: usize,
}

impl RuntimeConfig {
    pub fn from_env() -> RuntimeConfig {
        RuntimeConfig {
            heap_block_size: env_usize("RUBYRT_HEAP_BLOCK_SIZE", rbcore::heap::HEAP_BLOCK_SIZE),
            gc_low_watermark: env_f64("RUBYRT_GC_LOW_WATERMARK", rbcore::heap::LOW_WATERMARK),
            gc_high_watermark: env_f64("RUBYRT_GC_HIGH_WATERMARK", rbcore::heap::HIGH_WATERMARK),
            fiber_stack_size: env_usize("RUBYRT_FIBER_STACK_SIZE", 256 * 1024),
            fiber_registry_size: env_usize("RUBYRT_FIBER_REGISTRY_SIZE", 1024),
        }
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|&n| n > 0.0 && n < 1.0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn unset_global_reads_as_nil() {
        let sym = rbcore::symbol::intern("$unused_global_for_test");
        assert!(get(sym).is_nil());
    }

    #[test]
    #[serial]
    fn set_then_get_round_trips() {
        let sym = rbcore::symbol::intern("$roundtrip_global_for_test");
        set(sym, Value::from_int(42).unwrap());
        assert_eq!(get(sym).as_int(), Some(42));
    }

    #[test]
    #[serial]
    fn verbose_defaults_to_truthy() {
        assert!(verbose());
    }

    #[test]
    fn runtime_config_falls_back_without_env_vars() {
        let cfg = RuntimeConfig::from_env();
        assert!(cfg.heap_block_size > 0);
        assert!(cfg.gc_low_watermark < cfg.gc_high_watermark);
    }
}
