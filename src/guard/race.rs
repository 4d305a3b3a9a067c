use crate::config::GuardConfig;
use crate::core::{NetError, Result, request_id};
use crate::health::{HealthProbe, ProbeSample};
use crate::ledger::{CallMeta, ConnectionLedger, EntryKind};
use crate::observability::{Event, SharedSink, default_sink};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{Level, event};

/// Timeout guard statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GuardStats {
    pub concurrent: usize,
    pub peak_concurrent: usize,
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub timeouts: u64,
}

impl std::fmt::Display for GuardStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Guard Stats: {} concurrent (peak {}), {} total, {} ok, {} failed, {} timeouts",
            self.concurrent, self.peak_concurrent, self.total, self.success, self.failed, self.timeouts
        )
    }
}

#[derive(Default)]
struct GateState {
    concurrent: usize,
    epoch: u64,
    stats: GuardStats,
}

/// One pass through the secondary gate.
struct GatePass {
    state: Arc<Mutex<GateState>>,
    epoch: u64,
    settled: bool,
}

impl GatePass {
    fn finish<T>(mut self, result: &Result<T>) {
        self.settled = true;
        let mut state = lock_gate(&self.state);
        match result {
            Ok(_) => state.stats.success += 1,
            Err(err) => {
                state.stats.failed += 1;
                if err.is_timeout() {
                    state.stats.timeouts += 1;
                }
            }
        }
    }
}

impl Drop for GatePass {
    fn drop(&mut self) {
        let mut state = lock_gate(&self.state);
        if !self.settled {
            state.stats.failed += 1;
        }
        if self.epoch == state.epoch {
            state.concurrent = state.concurrent.saturating_sub(1);
        }
    }
}

fn lock_gate(state: &Mutex<GateState>) -> MutexGuard<'_, GateState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Races calls against a deadline behind a polling concurrency gate.
///
/// The guarded call runs as its own task. When the deadline wins, the caller
/// gets [`NetError::Timeout`] and the call is left to finish on its own: its
/// result is discarded, and its ledger entry stays until it settles so the
/// health monitor can report it as long-running.
pub struct TimeoutGuard {
    config: GuardConfig,
    state: Arc<Mutex<GateState>>,
    ledger: Arc<ConnectionLedger>,
    sink: SharedSink,
}

impl TimeoutGuard {
    pub fn new(config: GuardConfig) -> Result<Self> {
        Self::with_parts(config, Arc::new(ConnectionLedger::new()), default_sink())
    }

    /// Fails with [`NetError::InvalidConfig`] on a zero cap, poll interval or
    /// default timeout.
    pub fn with_parts(
        config: GuardConfig,
        ledger: Arc<ConnectionLedger>,
        sink: SharedSink,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Arc::new(Mutex::new(GateState::default())),
            ledger,
            sink,
        })
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.config.default_timeout_ms)
    }

    pub async fn guard<T, F, Fut>(&self, call: F, timeout: Duration) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.guard_with(call, timeout, CallMeta::default()).await
    }

    pub async fn guard_with<T, F, Fut>(&self, call: F, timeout: Duration, meta: CallMeta) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let pass = self.enter().await;

        let id = request_id();
        self.ledger.insert(id.clone(), EntryKind::Request, meta);

        let fut = call();
        let ledger = Arc::clone(&self.ledger);
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            let result = fut.await;
            ledger.remove(&task_id);
            result
        });

        let result = match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                self.ledger.remove(&id);
                Err(NetError::Call(format!("guarded call aborted: {}", join_err)))
            }
            Err(_) => {
                let timeout_ms = timeout.as_millis() as u64;
                event!(Level::DEBUG, id = %id, timeout_ms, "guarded call lost the race");
                self.sink.emit(Event::CallTimedOut { id, timeout_ms });
                Err(NetError::Timeout { timeout_ms })
            }
        };

        pass.finish(&result);
        result
    }

    /// Wait until the gate has room, re-checking every `poll_interval_ms`.
    async fn enter(&self) -> GatePass {
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            {
                let mut state = self.lock();
                if state.concurrent < self.config.max_concurrent_requests {
                    state.concurrent += 1;
                    state.stats.total += 1;
                    state.stats.peak_concurrent = state.stats.peak_concurrent.max(state.concurrent);
                    return GatePass {
                        state: Arc::clone(&self.state),
                        epoch: state.epoch,
                        settled: false,
                    };
                }
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub fn concurrent(&self) -> usize {
        self.lock().concurrent
    }

    pub fn stats(&self) -> GuardStats {
        let state = self.lock();
        let mut stats = state.stats.clone();
        stats.concurrent = state.concurrent;
        stats
    }

    /// Reset the gate and drop every request entry from the ledger.
    ///
    /// Returns how many gate passes were reclaimed. Safe to call repeatedly.
    pub fn force_close_all(&self) -> usize {
        let reclaimed = {
            let mut state = self.lock();
            let reclaimed = state.concurrent;
            state.concurrent = 0;
            state.epoch += 1;
            reclaimed
        };
        let cleared = self.ledger.force_clear_kind(EntryKind::Request);
        if reclaimed + cleared > 0 {
            self.sink.emit(Event::ForcedCleanup {
                component: "guard",
                discarded: reclaimed,
                ledger_cleared: cleared,
            });
        }
        reclaimed
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        lock_gate(&self.state)
    }
}

impl HealthProbe for TimeoutGuard {
    fn name(&self) -> &str {
        "guard"
    }

    fn sample(&self) -> ProbeSample {
        let stats = self.stats();
        ProbeSample {
            settled: stats.success + stats.failed,
            failed: stats.failed,
            active: stats.concurrent,
        }
    }
}
