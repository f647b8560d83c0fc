//! Error taxonomy and thread-local error channel
//!
//! `RubyError` enumerates the raiseable condition kinds shared by the
//! object model (frozen checks, singleton-class checks) and the dispatcher.
//! Library code propagates it as an ordinary `Result<_, RubyError>` and
//! never panics across the FFI boundary; the handful of `extern "C"`
//! entry points collapse a `RubyError` into the thread-local slot below
//! instead, for collaborator code that cannot itself propagate a `Result`.

use std::cell::RefCell;
use std::ffi::CString;
use std::fmt;
use std::ptr;

use crate::value::Value;

/// The raiseable exception kinds the core and dispatcher can produce.
///
/// Each variant carries the message Ruby programs would see via
/// `exception.message`; the boxed exception `Value` (once one has been
/// materialized on the heap) is attached separately by the caller that
/// turns a `RubyError` into a raised exception object.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RubyError {
    #[error("ArgumentError: {0}")]
    ArgumentError(String),
    #[error("TypeError: {0}")]
    TypeError(String),
    #[error("NameError: {0}")]
    NameError(String),
    #[error("NoMethodError: {0}")]
    NoMethodError(String),
    #[error("FrozenError: {0}")]
    FrozenError(String),
    #[error("RangeError: {0}")]
    RangeError(String),
    #[error("FloatDomainError: {0}")]
    FloatDomainError(String),
    #[error("LocalJumpError: {0}")]
    LocalJumpError(String),
    #[error("ZeroDivisionError: {0}")]
    ZeroDivisionError(String),
    #[error("FiberError: {0}")]
    FiberError(String),
    #[error("ThreadError: {0}")]
    ThreadError(String),
    #[error("SystemCallError: {0}")]
    SystemCallError(String),
    #[error("RuntimeError: {0}")]
    RuntimeError(String),
}

impl RubyError {
    /// The bare class name Ruby code would see from `exception.class.name`.
    pub fn class_name(&self) -> &'static str {
        match self {
            RubyError::ArgumentError(_) => "ArgumentError",
            RubyError::TypeError(_) => "TypeError",
            RubyError::NameError(_) => "NameError",
            RubyError::NoMethodError(_) => "NoMethodError",
            RubyError::FrozenError(_) => "FrozenError",
            RubyError::RangeError(_) => "RangeError",
            RubyError::FloatDomainError(_) => "FloatDomainError",
            RubyError::LocalJumpError(_) => "LocalJumpError",
            RubyError::ZeroDivisionError(_) => "ZeroDivisionError",
            RubyError::FiberError(_) => "FiberError",
            RubyError::ThreadError(_) => "ThreadError",
            RubyError::SystemCallError(_) => "SystemCallError",
            RubyError::RuntimeError(_) => "RuntimeError",
        }
    }

    pub fn message(&self) -> String {
        match self {
            RubyError::ArgumentError(m)
            | RubyError::TypeError(m)
            | RubyError::NameError(m)
            | RubyError::NoMethodError(m)
            | RubyError::FrozenError(m)
            | RubyError::RangeError(m)
            | RubyError::FloatDomainError(m)
            | RubyError::LocalJumpError(m)
            | RubyError::ZeroDivisionError(m)
            | RubyError::FiberError(m)
            | RubyError::ThreadError(m)
            | RubyError::SystemCallError(m)
            | RubyError::RuntimeError(m) => m.clone(),
        }
    }
}

/// A `RubyError` paired with the exception `Value` it has been raised as,
/// once the dispatcher has materialized a real Exception object for it.
/// Carried on the Env's exception slot during unwind.
#[derive(Debug, Clone)]
pub struct RaisedException {
    pub error: RubyError,
    pub exception: Option<Value>,
    pub backtrace: Vec<String>,
}

impl fmt::Display for RaisedException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<RubyError>> = const { RefCell::new(None) };
    static ERROR_CSTRING: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Record the last error for this OS thread, for collaborator code that
/// crosses the `extern "C"` boundary and cannot propagate a `Result`.
pub fn set_runtime_error(err: RubyError) {
    ERROR_CSTRING.with(|cs| *cs.borrow_mut() = None);
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(err));
}

pub fn take_runtime_error() -> Option<RubyError> {
    LAST_ERROR.with(|e| e.borrow_mut().take())
}

pub fn has_runtime_error() -> bool {
    LAST_ERROR.with(|e| e.borrow().is_some())
}

pub fn clear_runtime_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
    ERROR_CSTRING.with(|e| *e.borrow_mut() = None);
}

/// FFI-safe accessor returning the last error's formatted message as a
/// stable C string pointer, valid until the next call into this module.
#[unsafe(no_mangle)]
pub extern "C" fn rb_has_error() -> bool {
    has_runtime_error()
}

#[unsafe(no_mangle)]
pub extern "C" fn rb_take_error() -> *const i8 {
    match take_runtime_error() {
        Some(err) => ERROR_CSTRING.with(|cs| {
            let safe_msg: String = err
                .to_string()
                .chars()
                .map(|c| if c == '\0' { '?' } else { c })
                .collect();
            let cstring = CString::new(safe_msg).expect("null bytes already replaced");
            let ptr = cstring.as_ptr();
            *cs.borrow_mut() = Some(cstring);
            ptr
        }),
        None => ptr::null(),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn rb_clear_error() {
    clear_runtime_error();
}
