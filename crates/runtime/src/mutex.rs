//! Fiber-aware mutual exclusion.
//!
//! There is no scheduler to block on here: a single OS thread runs one
//! fiber at a time, so contended `lock` has nothing to wait for and
//! raises instead. The only thing a `Mutex` actually buys in this model
//! is an owner check that turns accidental re-entrancy and mismatched
//! unlock into a `ThreadError` instead of silent corruption.

use std::cell::Cell;

use crate::error::RResult;
use crate::fiber::{self, FiberId};
use rbcore::error::RubyError;

pub struct Mutex {
    owner: Cell<Option<FiberId>>,
}

impl Default for Mutex {
    fn default() -> Mutex {
        Mutex {
            owner: Cell::new(None),
        }
    }
}

impl Mutex {
    pub fn new() -> Mutex {
        Mutex::default()
    }

    pub fn is_locked(&self) -> bool {
        self.owner.get().is_some()
    }

    pub fn owned_by_current(&self) -> bool {
        self.owner.get() == Some(fiber::current())
    }

    /// Claims the mutex for the current fiber. Raises `ThreadError` if
    /// the current fiber already holds it (recursive locking) or if any
    /// other fiber holds it (there is no scheduler to park on).
    pub fn lock(&self) -> RResult<()> {
        let current = fiber::current();
        match self.owner.get() {
            Some(owner) if owner == current => {
                return Err(deadlock_error());
            }
            Some(_) => {
                return Err(deadlock_error());
            }
            None => {}
        }
        self.owner.set(Some(current));
        Ok(())
    }

    /// Releases the mutex. Raises `ThreadError` if it isn't locked, or
    /// if the current fiber isn't the owner (a deliberate hardening over
    /// the unlock-without-owner-check left unvalidated upstream: letting
    /// a non-owner unlock would make `lock` meaningless as a guard).
    pub fn unlock(&self) -> RResult<()> {
        let current = fiber::current();
        match self.owner.get() {
            None => Err(not_locked_error()),
            Some(owner) if owner != current => Err(not_owner_error()),
            Some(_) => {
                self.owner.set(None);
                Ok(())
            }
        }
    }

    /// Runs `f` while holding the lock, always releasing it afterwards
    /// (including on error), mirroring `Mutex#synchronize`.
    pub fn synchronize<T>(&self, f: impl FnOnce() -> RResult<T>) -> RResult<T> {
        self.lock()?;
        let result = f();
        self.unlock()?;
        result
    }
}

fn deadlock_error() -> crate::error::RaisedException {
    crate::error::RaisedException {
        error: RubyError::ThreadError("deadlock; recursive locking".to_string()),
        exception: None,
        backtrace: Vec::new(),
    }
}

fn not_locked_error() -> crate::error::RaisedException {
    crate::error::RaisedException {
        error: RubyError::ThreadError("Attempt to unlock a mutex which is not locked".to_string()),
        exception: None,
        backtrace: Vec::new(),
    }
}

fn not_owner_error() -> crate::error::RaisedException {
    crate::error::RaisedException {
        error: RubyError::ThreadError(
            "Attempt to unlock a mutex which is locked by another fiber".to_string(),
        ),
        exception: None,
        backtrace: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_then_unlock_round_trips() {
        let m = Mutex::new();
        assert!(!m.is_locked());
        m.lock().unwrap();
        assert!(m.is_locked());
        assert!(m.owned_by_current());
        m.unlock().unwrap();
        assert!(!m.is_locked());
    }

    #[test]
    fn recursive_lock_raises_deadlock() {
        let m = Mutex::new();
        m.lock().unwrap();
        let err = m.lock().unwrap_err();
        assert!(matches!(err.error, RubyError::ThreadError(_)));
    }

    #[test]
    fn unlock_without_lock_raises() {
        let m = Mutex::new();
        let err = m.unlock().unwrap_err();
        assert!(matches!(err.error, RubyError::ThreadError(_)));
    }

    #[test]
    fn synchronize_releases_on_error() {
        let m = Mutex::new();
        let result: RResult<()> = m.synchronize(|| {
            Err(crate::error::RaisedException {
                error: RubyError::RuntimeError("boom".to_string()),
                exception: None,
                backtrace: Vec::new(),
            })
        });
        assert!(result.is_err());
        assert!(!m.is_locked());
    }
}
