//! Blocks, Procs, and Lambdas.
//!
//! A `Block` is a captured closure: a lexical `Env` pointer plus an
//! opaque AST body pointer (owned by the compiler/parser collaborator,
//! out of this crate's scope — the dispatcher only ever needs to invoke
//! it through `BlockBody::call`, never to inspect it). A `Proc` is a
//! reified `Block`; a `Lambda` additionally enforces strict arity and
//! turns `return` into a local return instead of a method-level one.

use rbcore::Value;

use crate::args::ParamSpec;
use crate::error::RResult;

/// How a captured block's body is invoked. Native closures exist so
/// Rust-implemented iterators (`each`, `map`, ...) can hand the
/// dispatcher a block without going through the AST interpreter at all.
pub enum BlockBody {
    Ast {
        /// Owned and interpreted by the compiler/parser collaborator;
        /// `rbruntime` treats it as opaque and invokes it only via the
        /// `call` function pointer stored alongside it.
        ast: *mut std::ffi::c_void,
        call: fn(ast: *mut std::ffi::c_void, args: &[Value]) -> RResult<Value>,
    },
    Native(Box<dyn Fn(&[Value]) -> RResult<Value>>),
}

pub struct Block {
    pub params: ParamSpec,
    pub body: BlockBody,
    /// Whether a `break` inside this block should propagate as a
    /// non-local unwind to the iterating call (true for ordinary blocks)
    /// or be rejected (true lambdas convert `break` into a plain local
    /// return instead, see `Kind::Lambda`).
    pub kind: Kind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Block,
    Proc,
    Lambda,
}

/// Sentinel distinguishing a non-local control transfer from an ordinary
/// returned `Value`. The dispatcher's call-site for a block-accepting
/// method inspects this before treating a `BreakMarker` result as its
/// own return value.
#[derive(Debug, Clone)]
pub enum BlockOutcome {
    Value(Value),
    /// `break` was hit inside the block; carries the value passed to
    /// `break` and unwinds to the call that invoked the block with this
    /// iteration (not just this block call).
    Break(Value),
    /// `next` was hit: equivalent to an ordinary return from the block
    /// body for this single invocation.
    Next(Value),
}

impl Block {
    pub fn call(&self, args: &[Value]) -> RResult<Value> {
        if self.kind == Kind::Lambda {
            self.params.check_arity(args.len()).map_err(|e| {
                crate::error::RaisedException {
                    error: e,
                    exception: None,
                    backtrace: Vec::new(),
                }
            })?;
        }
        match &self.body {
            BlockBody::Ast { ast, call } => call(*ast, args),
            BlockBody::Native(f) => f(args),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lambda_enforces_strict_arity() {
        let block = Block {
            params: ParamSpec {
                required: 1,
                ..Default::default()
            },
            body: BlockBody::Native(Box::new(|args| Ok(args[0]))),
            kind: Kind::Lambda,
        };
        assert!(block.call(&[]).is_err());
        assert!(block.call(&[Value::from_int(1).unwrap()]).is_ok());
    }

    #[test]
    fn plain_block_does_not_enforce_arity() {
        let block = Block {
            params: ParamSpec {
                required: 2,
                ..Default::default()
            },
            body: BlockBody::Native(Box::new(|_args| Ok(Value::nil()))),
            kind: Kind::Block,
        };
        assert!(block.call(&[]).is_ok());
    }
}
