//! Calling convention, dispatch, and concurrency for a Ruby-compatible
//! runtime, built on the object model and GC in `rbcore`.
//!
//! # Modules
//!
//! - `args`: positional/keyword/block argument binding against a `ParamSpec`
//! - `block`: blocks, procs, and lambdas, and their arity/return semantics
//! - `constants`: the four-phase constant resolution algorithm
//! - `diagnostics`: SIGQUIT-triggered fiber status dump (feature `diagnostics`)
//! - `dispatch`: method resolution, visibility, `super`, exception raising
//! - `env`: call-frame locals, lexical/caller chains, backtraces
//! - `error`: `RResult`, backtrace capture, re-exports of `rbcore`'s error types
//! - `fiber`: stackful coroutines with hand-written context switches
//! - `globals`: process-wide global variables (`$VERBOSE` and friends)
//! - `mutex`: fiber-aware mutual exclusion
//! - `numeric`: Float arithmetic and Integer/Float coercion at the dispatch boundary

pub mod args;
pub mod block;
pub mod constants;
#[cfg(feature = "diagnostics")]
pub mod diagnostics;
pub mod dispatch;
pub mod env;
pub mod error;
pub mod fiber;
pub mod globals;
pub mod mutex;
pub mod numeric;

pub use args::{Args, BoundArgs, ParamSpec};
pub use block::{Block, BlockBody, BlockOutcome, Kind as BlockKind};
pub use constants::{AutoloadFn, Lookup};
pub use dispatch::{CallMode, dispatch, resolve_super};
pub use env::Env;
pub use error::{RResult, RaisedException, RubyError, capture_backtrace, raise};
pub use fiber::{Fiber, FiberError, FiberId, Status as FiberStatus};
pub use mutex::Mutex;
