//! Termination signals. The handler only flips an atomic flag; the reactor
//! polls it once per tick and asks every session to stop cooperatively.

use nix::libc::c_int;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signo: c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

/// Installs SIGTERM/SIGINT handlers. Safe to call more than once.
pub fn install() {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        let _ = sigaction(Signal::SIGTERM, &action);
        let _ = sigaction(Signal::SIGINT, &action);
    }
}

/// True once a termination signal has arrived; resets the flag.
pub fn triggered() -> bool {
    STOP_REQUESTED.swap(false, Ordering::SeqCst)
}

/// Test hook: raise the flag without an actual signal.
pub fn request_stop() {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}
