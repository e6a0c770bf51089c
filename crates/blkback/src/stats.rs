//! Per-interface counters, readable at any time by an observability
//! collector.

/// Counters for one block interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlkifStats {
    /// Requests consumed from the ring.
    pub reqs_in: u64,
    /// Responses published (success or failure).
    pub reqs_out: u64,
    /// Ring wakeups handled.
    pub kicks_in: u64,
    /// Event-channel notifications delivered to the guest.
    pub kicks_out: u64,
    /// Requests that failed translation (bad op, bad segments, grant map).
    pub map_errors: u64,
    /// Requests the image subsystem rejected synchronously.
    pub submit_errors: u64,
    /// Requests the image subsystem failed asynchronously.
    pub image_errors: u64,
    /// Event-channel notifies that failed (responses were already pushed).
    pub notify_errors: u64,
}

impl BlkifStats {
    pub fn new() -> Self {
        Self::default()
    }
}
