//! Signal handling.
//!
//! Termination signals set a flag polled by the request loop; the loop
//! drains, releases resources in order, and re-raises the signal to the
//! process group so a supervisor observes the real cause. SEGV/ABRT write
//! a marker to stderr and abort so a supervising parent does not respawn a
//! crash-looping core silently.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

static STOP: AtomicBool = AtomicBool::new(false);
static SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn term_handler(signum: libc::c_int) {
    SIGNAL.store(signum, Ordering::SeqCst);
    STOP.store(true, Ordering::SeqCst);
}

extern "C" fn crash_handler(signum: libc::c_int) {
    // Only async-signal-safe calls here.
    let msg = match signum {
        libc::SIGSEGV => b"petrel-client: segmentation fault, aborting\n".as_slice(),
        _ => b"petrel-client: fatal signal, aborting\n".as_slice(),
    };
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
        libc::signal(signum, libc::SIG_DFL);
        libc::abort();
    }
}

/// Install all handlers. Called once at startup, before the device opens.
pub fn install() {
    unsafe {
        libc::signal(libc::SIGSEGV, crash_handler as libc::sighandler_t);
        libc::signal(libc::SIGABRT, crash_handler as libc::sighandler_t);

        for sig in [
            libc::SIGHUP,
            libc::SIGINT,
            libc::SIGPIPE,
            libc::SIGILL,
            libc::SIGTERM,
        ] {
            libc::signal(sig, term_handler as libc::sighandler_t);
        }
    }
}

/// Whether a termination signal has been observed.
pub fn stop_requested() -> bool {
    STOP.load(Ordering::SeqCst)
}

/// The terminating signal number, or 0.
pub fn last_signal() -> i32 {
    SIGNAL.load(Ordering::SeqCst)
}

/// Request a stop without a signal (used by tests and clean shutdown).
pub fn request_stop() {
    STOP.store(true, Ordering::SeqCst);
}

#[cfg(test)]
pub fn reset_for_tests() {
    STOP.store(false, Ordering::SeqCst);
    SIGNAL.store(0, Ordering::SeqCst);
}

/// Forward the terminating signal to the process group on the way out.
pub fn reraise_to_group() {
    let sig = last_signal();
    if sig != 0 {
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
            libc::kill(0, sig);
        }
    }
}
