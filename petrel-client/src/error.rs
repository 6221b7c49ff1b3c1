//! Error helpers for the client core.
//!
//! Operation status travels as negative errnos (`petrel_abi::err`); this
//! module provides the daemon-level error type and the conversions between
//! `io::Error` and wire status codes.

use std::io;

use petrel_abi::err;

/// Result alias for functions returning a wire status on failure.
pub type SysResult<T> = Result<T, i32>;

/// Fatal daemon errors. Everything here terminates the process; the exit
/// code tells the supervisor whether a restart is worthwhile.
#[derive(Debug)]
pub enum RunError {
    /// Could not open or configure the request device.
    DeviceInit(io::Error),
    /// Could not acquire the shared buffer regions.
    MappedRegion(io::Error),
    /// The remount handshake failed; a restart may succeed.
    RemountFailed,
    /// Could not spawn the remount helper thread.
    ThreadSpawn(io::Error),
}

impl RunError {
    /// Process exit code for this error.
    ///
    /// `EXIT_RETRY` tells the supervisor to restart the daemon.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::DeviceInit(_) | RunError::MappedRegion(_) | RunError::RemountFailed => {
                EXIT_RETRY
            }
            RunError::ThreadSpawn(_) => 1,
        }
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::DeviceInit(e) => write!(f, "device initialization failed: {e}"),
            RunError::MappedRegion(e) => write!(f, "mapped region acquisition failed: {e}"),
            RunError::RemountFailed => write!(f, "remount handshake failed"),
            RunError::ThreadSpawn(e) => write!(f, "could not spawn remount thread: {e}"),
        }
    }
}

/// Exit code signalling a retriable failure to the supervisor.
pub const EXIT_RETRY: i32 = 11;

/// Map an `io::Error` onto a wire status code.
pub fn status_from_io(e: &io::Error) -> i32 {
    match e.raw_os_error() {
        Some(code) if code > 0 => -code,
        _ => err::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_maps_to_negative_errno() {
        let e = io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(status_from_io(&e), err::ENOENT);
    }

    #[test]
    fn opaque_io_error_maps_to_eio() {
        let e = io::Error::other("no errno here");
        assert_eq!(status_from_io(&e), err::EIO);
    }

    #[test]
    fn retriable_errors_use_the_retry_exit_code() {
        assert_eq!(RunError::RemountFailed.exit_code(), EXIT_RETRY);
        assert_eq!(
            RunError::ThreadSpawn(io::Error::other("spawn")).exit_code(),
            1
        );
    }
}
