//! The call frame: per-activation lexical and dynamic state.

use std::cell::Cell;

use rbcore::Value;

use crate::error::RaisedException;

/// A single call frame. Allocated from the currently-running fiber's
/// bump arena (see `crate::fiber::Fiber::arena`): frames are short-lived
/// and high-frequency, exactly the allocation shape a bump arena is
/// suited to, and `Value` is `Copy` so the arena never needs to run a
/// destructor over the locals it handed out.
pub struct Env<'a> {
    pub outer: Option<&'a Env<'a>>,
    pub caller: Option<&'a Env<'a>>,
    pub block: Option<Value>,
    locals: Cell<&'a mut [Value]>,
    pub file: &'a str,
    pub line: u32,
    /// `$~`-equivalent: the MatchData from the most recent regexp match
    /// visible to this frame.
    pub match_data: Cell<Value>,
    /// Populated by the error channel during unwind; consulted by a
    /// `rescue` clause evaluated in this frame.
    pub exception: Cell<Option<Box<RaisedException>>>,
}

impl<'a> Env<'a> {
    pub fn new_root(locals: &'a mut [Value], file: &'a str, line: u32) -> Env<'a> {
        Env {
            outer: None,
            caller: None,
            block: None,
            locals: Cell::new(locals),
            file,
            line,
            match_data: Cell::new(Value::nil()),
            exception: Cell::new(None),
        }
    }

    pub fn new_call(
        outer: Option<&'a Env<'a>>,
        caller: Option<&'a Env<'a>>,
        block: Option<Value>,
        locals: &'a mut [Value],
        file: &'a str,
        line: u32,
    ) -> Env<'a> {
        Env {
            outer,
            caller,
            block,
            locals: Cell::new(locals),
            file,
            line,
            match_data: Cell::new(Value::nil()),
            exception: Cell::new(None),
        }
    }

    pub fn local_get(&self, slot: usize) -> Value {
        // Safety: `locals` is only ever read/written through this Cell,
        // single-threaded, never aliased outside this accessor pair.
        let locals = unsafe { &*self.locals.as_ptr() };
        locals[slot]
    }

    pub fn local_set(&self, slot: usize, value: Value) {
        let locals = unsafe { &mut *self.locals.as_ptr() };
        locals[slot] = value;
    }

    pub fn locals_len(&self) -> usize {
        unsafe { (*self.locals.as_ptr()).len() }
    }

    /// Walk `caller` links, formatting each frame as Ruby's
    /// `file:line:in 'name'`-shaped backtrace entries would be rendered
    /// by the dispatcher (which supplies `name`; this just walks frames).
    pub fn backtrace_locations(&self) -> Vec<(String, u32)> {
        let mut out = Vec::new();
        let mut cur = Some(self);
        while let Some(env) = cur {
            out.push((env.file.to_string(), env.line));
            cur = env.caller;
        }
        out
    }

    /// Resolve a constant's lexical owner chain starting here: the
    /// dispatcher walks `outer` (not `caller`) for lexical constant
    /// lookup, per §4.2.
    pub fn lexical_chain(&self) -> Vec<&Env<'a>> {
        let mut out = Vec::new();
        let mut cur = Some(self);
        while let Some(env) = cur {
            out.push(env);
            cur = env.outer;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locals_roundtrip() {
        let mut locals = [Value::nil(), Value::nil()];
        let env = Env::new_root(&mut locals, "test.rb", 1);
        env.local_set(0, Value::from_int(7).unwrap());
        assert_eq!(env.local_get(0).as_int(), Some(7));
        assert!(env.local_get(1).is_nil());
    }

    #[test]
    fn backtrace_walks_caller_chain() {
        let mut root_locals: [Value; 0] = [];
        let root = Env::new_root(&mut root_locals, "a.rb", 1);
        let mut child_locals: [Value; 0] = [];
        let child = Env::new_call(None, Some(&root), None, &mut child_locals, "b.rb", 2);
        let bt = child.backtrace_locations();
        assert_eq!(bt, vec![("b.rb".to_string(), 2), ("a.rb".to_string(), 1)]);
    }
}
