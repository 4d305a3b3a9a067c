//! Request admission: bounds how many outbound calls run concurrently.
//!
//! The backend serialises on row locks, so a single device firing a burst of
//! calls mostly produces lock contention. Calls are therefore admitted a few
//! at a time, the rest wait by priority, and overflow is refused outright.

pub mod queue;
pub mod stats;

pub use queue::{AdmissionQueue, CleanupReport, DEFAULT_PRIORITY};
pub use stats::AdmissionStats;
