//! Raising and propagating errors through call frames.
//!
//! The error channel is ordinary `Result<Value, RaisedException>`
//! propagation via `?`, not a native unwind: panic-based unwinding
//! cannot safely cross a fiber's hand-rolled assembly stack switch (see
//! `crate::fiber`), so every dispatcher entry point returns a `Result`
//! instead.

pub use rbcore::error::{RaisedException, RubyError};

use crate::env::Env;

pub type RResult<T> = Result<T, RaisedException>;

/// Capture a backtrace by walking `env`'s caller chain, formatting each
/// frame the way a Ruby backtrace line reads: `file:line`. The
/// dispatcher fills in the method/block name by formatting around this.
pub fn capture_backtrace(env: &Env) -> Vec<String> {
    env.backtrace_locations()
        .into_iter()
        .map(|(file, line)| format!("{file}:{line}"))
        .collect()
}

/// Raise `error` from `env`, capturing its backtrace. A re-raise of an
/// already-raised exception should reuse `RaisedException` directly
/// instead of calling this again, preserving the original backtrace
/// (§7: "the backtrace reflects the first raise, not the re-raise").
pub fn raise(env: &Env, error: RubyError) -> RaisedException {
    RaisedException {
        error,
        exception: None,
        backtrace: capture_backtrace(env),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbcore::Value;

    #[test]
    fn raise_captures_backtrace_from_caller_chain() {
        let mut root_locals: [Value; 0] = [];
        let root = Env::new_root(&mut root_locals, "a.rb", 10);
        let mut child_locals: [Value; 0] = [];
        let child = Env::new_call(None, Some(&root), None, &mut child_locals, "b.rb", 20);
        let raised = raise(&child, RubyError::RuntimeError("boom".into()));
        assert_eq!(raised.backtrace, vec!["b.rb:20", "a.rb:10"]);
    }
}
