//! Passive health monitoring: staleness, error rate and capacity alerts.

pub mod monitor;
pub mod worker;

pub use monitor::{HealthMonitor, HealthReport};
pub use worker::HealthWorker;

/// Counters a call source exposes to the monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeSample {
    /// Calls that finished, successfully or not.
    pub settled: u64,
    pub failed: u64,
    /// Calls currently in flight.
    pub active: usize,
}

pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;
    fn sample(&self) -> ProbeSample;
}
