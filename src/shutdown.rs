//! Process-wide termination flag.
//!
//! SIGINT and SIGTERM only raise an atomic flag; every loop in the
//! process (the accept loop, each session's poll loop) observes it at
//! its next iteration and winds down through the ordinary disconnect
//! path. The handler itself does nothing else, so it is async-signal
//! safe.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Installs the handlers. Call once at startup, before the listener.
pub fn install() -> io::Result<()> {
    let handler = handle_signal as extern "C" fn(libc::c_int);

    for signum in [libc::SIGINT, libc::SIGTERM] {
        let previous = unsafe { libc::signal(signum, handler as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

pub fn requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Raises the flag from inside the process, used by tests and by fatal
/// paths that want the same orderly exit as a signal.
pub fn request() {
    SHUTDOWN.store(true, Ordering::SeqCst);
}
