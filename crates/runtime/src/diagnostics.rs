//! SIGQUIT-triggered runtime diagnostics, mirroring a JVM thread dump.
//!
//! ```bash
//! kill -3 <pid>
//! ```
//!
//! dumps fiber status to stderr and the process keeps running. Only
//! built when the `diagnostics` feature is enabled.

use std::sync::Once;

static SIGNAL_HANDLER_INIT: Once = Once::new();

/// Installs the SIGQUIT handler. Idempotent; call once during runtime
/// bootstrap.
pub fn install_signal_handler() {
    SIGNAL_HANDLER_INIT.call_once(|| {
        #[cfg(unix)]
        unsafe {
            let _ = signal_hook::low_level::register(signal_hook::consts::SIGQUIT, || {
                crate::fiber::dump_diagnostics();
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_idempotent() {
        install_signal_handler();
        install_signal_handler();
    }
}
