//! Scripted in-memory transport.
//!
//! Lets tests and demos drive the socket client through handshakes, drops and
//! failing sends without a network.

use super::transport::{Transport, TransportConnection, TransportEvent, TransportSink};
use crate::core::{NetError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// How the next connect attempt resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accept,
    Refuse(String),
}

/// Test-side view of one accepted connection.
#[derive(Clone)]
pub struct MockHandle {
    events: mpsc::Sender<TransportEvent>,
    sent: Arc<Mutex<Vec<String>>>,
    fail_sends: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl MockHandle {
    /// Deliver an inbound frame.
    pub async fn push(&self, raw: &str) -> bool {
        self.events
            .send(TransportEvent::Message(raw.to_string()))
            .await
            .is_ok()
    }

    /// Simulate the peer going away.
    pub async fn drop_connection(&self, reason: &str) {
        let _ = self
            .events
            .send(TransportEvent::Closed {
                reason: reason.to_string(),
            })
            .await;
    }

    pub async fn raise_error(&self, error: &str) {
        let _ = self
            .events
            .send(TransportEvent::Error(error.to_string()))
            .await;
    }

    /// Make every following send on this connection fail.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MockSink {
    sent: Arc<Mutex<Vec<String>>>,
    fail_sends: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl TransportSink for MockSink {
    async fn send(&mut self, payload: String) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetError::Transport("send on closed connection".into()));
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(NetError::Transport("broken pipe".into()));
        }
        self.sent.lock()?.push(payload);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MockSink {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockState {
    script: VecDeque<ConnectOutcome>,
    refuse_by_default: bool,
    attempts: Vec<(String, Vec<(String, String)>)>,
    handles: Vec<MockHandle>,
}

/// Transport whose connect attempts follow a script.
///
/// Once the script runs out every attempt is accepted, or refused after
/// [`MockTransport::refuse_all`].
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_all(self) -> Self {
        self.lock().refuse_by_default = true;
        self
    }

    pub fn push_outcome(&self, outcome: ConnectOutcome) {
        self.lock().script.push_back(outcome);
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().attempts.len()
    }

    /// Headers sent with the `index`-th connect attempt.
    pub fn attempt_headers(&self, index: usize) -> Option<Vec<(String, String)>> {
        self.lock().attempts.get(index).map(|(_, headers)| headers.clone())
    }

    pub fn handles(&self) -> Vec<MockHandle> {
        self.lock().handles.clone()
    }

    pub fn last_handle(&self) -> Option<MockHandle> {
        self.lock().handles.last().cloned()
    }

    /// Connections accepted and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.lock().handles.iter().filter(|h| !h.is_closed()).count()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, url: &str, headers: &[(String, String)]) -> Result<TransportConnection> {
        let mut state = self.lock();
        state.attempts.push((url.to_string(), headers.to_vec()));

        let outcome = state.script.pop_front().unwrap_or(if state.refuse_by_default {
            ConnectOutcome::Refuse("connection refused".into())
        } else {
            ConnectOutcome::Accept
        });
        if let ConnectOutcome::Refuse(reason) = outcome {
            return Err(NetError::Transport(reason));
        }

        let (tx, events) = mpsc::channel(64);
        let handle = MockHandle {
            events: tx,
            sent: Arc::new(Mutex::new(Vec::new())),
            fail_sends: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
        };
        let sink = MockSink {
            sent: Arc::clone(&handle.sent),
            fail_sends: Arc::clone(&handle.fail_sends),
            closed: Arc::clone(&handle.closed),
        };
        state.handles.push(handle);

        Ok(TransportConnection {
            sink: Box::new(sink),
            events,
        })
    }
}
