//! Process shutdown hook.
//!
//! SIGINT and SIGTERM set a flag and wake the event loop's poll, so the loop
//! re-checks its stop condition even when the signal lands between that
//! check and the next wait. The handler is installed without `SA_RESTART`,
//! so a poll already blocked also returns `EINTR`.

use mio::Waker;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Exit status after an interrupt (128 + SIGINT).
pub const EXIT_INTERRUPTED: i32 = 130;

static REQUESTED: AtomicBool = AtomicBool::new(false);
static WAKER: OnceLock<Arc<Waker>> = OnceLock::new();

extern "C" fn on_signal(_signal: libc::c_int) {
    REQUESTED.store(true, Ordering::SeqCst);
    if let Some(waker) = WAKER.get() {
        // A single write(2) on the poll's eventfd/pipe.
        let _ = waker.wake();
    }
}

/// Install the handler for SIGINT and SIGTERM, waking `waker` on delivery.
///
/// Only the first waker handed in is kept.
pub fn install(waker: Arc<Waker>) -> io::Result<()> {
    let _ = WAKER.set(waker);

    for signal in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only touches an atomic and an initialised
        // `OnceLock`, then makes one write syscall; `action` is fully
        // initialised.
        let rc = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = 0;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signal, &action, std::ptr::null_mut())
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Whether a shutdown signal has arrived.
pub fn requested() -> bool {
    REQUESTED.load(Ordering::SeqCst)
}
