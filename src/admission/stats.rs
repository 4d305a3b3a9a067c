use serde::Serialize;

/// Admission queue statistics
///
/// Counters only grow; `current_active` and `queue_length` are gauges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    /// Calls dispatched to their work function.
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    /// Calls that had to wait for a slot.
    pub queued: u64,
    /// Failed calls whose failure was the request deadline.
    pub timeout_count: u64,
    /// Calls refused because the queue was full.
    pub rejected: u64,
    /// Longest time a queued call waited before dispatch.
    pub peak_wait_ms: u64,
    pub current_active: usize,
    pub peak_active: usize,
    pub queue_length: usize,
}

impl AdmissionStats {
    pub fn settled(&self) -> u64 {
        self.success + self.failed
    }

    pub fn in_flight(&self) -> u64 {
        self.total - self.settled()
    }
}

impl std::fmt::Display for AdmissionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Admission Stats: {} active (peak {}), {} waiting, {} total, {} ok, {} failed ({} timeouts), {} rejected",
            self.current_active,
            self.peak_active,
            self.queue_length,
            self.total,
            self.success,
            self.failed,
            self.timeout_count,
            self.rejected
        )
    }
}
