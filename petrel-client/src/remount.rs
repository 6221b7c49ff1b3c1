//! Remount coordination.
//!
//! On startup the kernel module may hold mounts from a previous daemon
//! incarnation. A blocking ioctl asks it to replay them; servicing the
//! resulting mount upcalls requires the main loop to be running, so the
//! ioctl is issued from a helper thread. A mutex held by the main loop
//! gates the ioctl until the initial batch of unexpected receives is
//! posted.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use log::error;

use crate::device::Remounter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemountStatus {
    NotCompleted,
    Completed,
    Failed,
}

pub struct RemountState {
    status: Mutex<RemountStatus>,
    gate: Mutex<()>,
}

impl RemountState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(RemountStatus::NotCompleted),
            gate: Mutex::new(()),
        })
    }

    /// State with the handshake already finished, for tests that start the
    /// loop in steady state.
    pub fn completed() -> Arc<Self> {
        let state = Self::new();
        *state.status.lock().unwrap() = RemountStatus::Completed;
        state
    }

    pub fn status(&self) -> RemountStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_status(&self, status: RemountStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// Take the gate. The main loop holds this across helper-thread spawn
    /// and releases it only after its initial unexpected receives are
    /// posted.
    pub fn hold_gate(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().unwrap()
    }
}

/// Spawn the helper thread that performs the blocking remount ioctl once
/// the gate opens.
pub fn spawn(
    state: Arc<RemountState>,
    remounter: Box<dyn Remounter>,
) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(String::from("petrel-remount"))
        .spawn(move || {
            let _gate = state.hold_gate();
            match remounter.remount() {
                Ok(()) => state.set_status(RemountStatus::Completed),
                Err(e) => {
                    error!("failed to remount filesystems: {e}");
                    state.set_status(RemountStatus::Failed);
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct OkRemounter;
    impl Remounter for OkRemounter {
        fn remount(&self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FailRemounter;
    impl Remounter for FailRemounter {
        fn remount(&self) -> io::Result<()> {
            Err(io::Error::other("replay failed"))
        }
    }

    fn wait_for(state: &RemountState, want: RemountStatus) {
        for _ in 0..200 {
            if state.status() == want {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("remount status never became {want:?}");
    }

    #[test]
    fn ioctl_waits_for_the_gate() {
        let state = RemountState::new();
        let gate = state.hold_gate();
        let handle = spawn(Arc::clone(&state), Box::new(OkRemounter)).unwrap();
        // While the gate is held the handshake cannot complete.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(state.status(), RemountStatus::NotCompleted);
        drop(gate);
        wait_for(&state, RemountStatus::Completed);
        handle.join().unwrap();
    }

    #[test]
    fn failure_is_observable() {
        let state = RemountState::new();
        let handle = spawn(Arc::clone(&state), Box::new(FailRemounter)).unwrap();
        wait_for(&state, RemountStatus::Failed);
        handle.join().unwrap();
    }
}
