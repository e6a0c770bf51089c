//! Event-channel binding: waking the guest after responses are published.

use std::cell::Cell;
use thiserror::Error;

/// Event-channel notify failure. Logged and counted by the caller; never a
/// per-request error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to notify event channel: {0}")]
pub struct NotifyError(pub String);

/// Event-channel operations consumed from the hypervisor binding.
pub trait EventChannel {
    fn notify(&self, port: u32) -> Result<(), NotifyError>;
}

/// Event channel that only records notifications — the in-process analogue
/// of a bound inter-domain port, for tests, demos, and loopback setups.
#[derive(Debug, Default)]
pub struct CountingEventChannel {
    notified: Cell<u64>,
}

impl CountingEventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications delivered so far.
    pub fn notified(&self) -> u64 {
        self.notified.get()
    }
}

impl EventChannel for CountingEventChannel {
    fn notify(&self, _port: u32) -> Result<(), NotifyError> {
        self.notified.set(self.notified.get() + 1);
        Ok(())
    }
}
