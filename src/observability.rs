//! Structured events emitted by every component of the resilience layer.
//!
//! Components never log ad hoc strings for operator-relevant conditions; they
//! build an [`Event`] and hand it to the configured [`EventSink`]. The default
//! sink forwards to `tracing`, tests use [`MemorySink`] to assert on what was
//! observed.

use crate::socket::ConnectionState;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{Level, event};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum Event {
    QueueRejected {
        queue_limit: usize,
    },
    CallTimedOut {
        id: String,
        timeout_ms: u64,
    },
    /// `discarded` counts slots, passes and waiters; ledger entries are
    /// reported separately since a timed-out call keeps its entry.
    ForcedCleanup {
        component: &'static str,
        discarded: usize,
        ledger_cleared: usize,
    },
    /// Staleness alert: a ledger entry outlived its threshold.
    LongRunning {
        id: String,
        url: String,
        method: String,
        age_ms: u64,
        threshold_ms: u64,
    },
    ErrorRateAlert {
        source: String,
        failed: u64,
        total: u64,
        rate: f64,
        threshold: f64,
    },
    CapacityAlert {
        source: String,
        active: usize,
        ceiling: usize,
    },
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    ReconnectScheduled {
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
    },
    ReconnectExhausted {
        attempts: u32,
    },
    HeartbeatFailed {
        error: String,
    },
    TransportLost {
        reason: String,
    },
    AuthMissing {
        missing: Vec<String>,
    },
}

impl Event {
    pub fn category(&self) -> &'static str {
        match self {
            Self::QueueRejected { .. } => "queue_rejected",
            Self::CallTimedOut { .. } => "call_timed_out",
            Self::ForcedCleanup { .. } => "forced_cleanup",
            Self::LongRunning { .. } => "long_running",
            Self::ErrorRateAlert { .. } => "error_rate_alert",
            Self::CapacityAlert { .. } => "capacity_alert",
            Self::StateChanged { .. } => "state_changed",
            Self::ReconnectScheduled { .. } => "reconnect_scheduled",
            Self::ReconnectExhausted { .. } => "reconnect_exhausted",
            Self::HeartbeatFailed { .. } => "heartbeat_failed",
            Self::TransportLost { .. } => "transport_lost",
            Self::AuthMissing { .. } => "auth_missing",
        }
    }

    /// Alerts are the health monitor's output; everything else is lifecycle noise.
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            Self::LongRunning { .. } | Self::ErrorRateAlert { .. } | Self::CapacityAlert { .. }
        )
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

pub type SharedSink = Arc<dyn EventSink>;

/// Routes events to `tracing` with the event serialized as a `payload` field.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, ev: Event) {
        let category = ev.category();
        let payload = serde_json::to_string(&ev).unwrap_or_default();
        match ev {
            Event::LongRunning { .. }
            | Event::ErrorRateAlert { .. }
            | Event::CapacityAlert { .. }
            | Event::ReconnectExhausted { .. }
            | Event::AuthMissing { .. } => {
                event!(Level::WARN, category, %payload, "netguard alert");
            }
            Event::HeartbeatFailed { .. }
            | Event::TransportLost { .. }
            | Event::QueueRejected { .. }
            | Event::CallTimedOut { .. } => {
                event!(Level::INFO, category, %payload, "netguard event");
            }
            _ => {
                event!(Level::DEBUG, category, %payload, "netguard event");
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: Event) {}
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, category: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.category() == category)
            .count()
    }

    /// Every `StateChanged` transition in emission order.
    pub fn transitions(&self) -> Vec<(ConnectionState, ConnectionState)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::StateChanged { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

pub fn default_sink() -> SharedSink {
    Arc::new(TracingSink)
}
