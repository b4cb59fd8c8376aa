use std::sync::atomic::{AtomicBool, Ordering};

/// Set once SIGINT or SIGTERM arrives; the daemon loop polls it.
pub static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Route SIGINT/SIGTERM to [`SHUTDOWN`].
///
/// The handler puts the default disposition back, so a second signal
/// terminates the process even if shutdown is stuck draining.
pub fn install_signal_handlers() {
    // Safety: the handler only stores to an atomic and calls signal(2),
    // both async-signal-safe.
    unsafe {
        for sig in [libc::SIGTERM, libc::SIGINT] {
            libc::signal(sig, on_signal as *const () as libc::sighandler_t);
        }
    }
}

extern "C" fn on_signal(sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}
