use super::stats::AdmissionStats;
use crate::config::AdmissionConfig;
use crate::core::{NetError, Result, call_id};
use crate::health::{HealthProbe, ProbeSample};
use crate::ledger::{CallMeta, ConnectionLedger, EntryKind};
use crate::observability::{Event, SharedSink, default_sink};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::time::Instant;

pub const DEFAULT_PRIORITY: i32 = 1;

/// A caller waiting for a slot.
struct QueuedCall {
    priority: i32,
    enqueued_at: Instant,
    grant: oneshot::Sender<u64>,
}

/// Counters, waiting list and slot count, guarded as one unit.
struct QueueState {
    max_concurrent: usize,
    active: usize,
    /// Bumped by forced cleanup so orphaned calls don't release slots twice.
    epoch: u64,
    waiting: VecDeque<QueuedCall>,
    stats: AdmissionStats,
}

impl QueueState {
    fn try_acquire(&mut self) -> Option<u64> {
        if self.active < self.max_concurrent {
            self.occupy();
            Some(self.epoch)
        } else {
            None
        }
    }

    fn occupy(&mut self) {
        self.active += 1;
        self.stats.total += 1;
        self.stats.peak_active = self.stats.peak_active.max(self.active);
    }

    /// Insert behind every waiter of equal or higher priority.
    fn enqueue(&mut self, call: QueuedCall) {
        let pos = self
            .waiting
            .iter()
            .position(|queued| queued.priority < call.priority)
            .unwrap_or(self.waiting.len());
        self.waiting.insert(pos, call);
        self.stats.queued += 1;
    }

    fn prune_abandoned(&mut self) {
        self.waiting.retain(|queued| !queued.grant.is_closed());
    }

    /// Hand free slots to waiters, highest priority first.
    fn dispatch_waiting(&mut self) {
        while self.active < self.max_concurrent {
            let Some(next) = self.waiting.pop_front() else {
                break;
            };
            // A closed receiver means the waiter was dropped; its slot goes to the next one.
            if next.grant.send(self.epoch).is_ok() {
                let waited = next.enqueued_at.elapsed().as_millis() as u64;
                self.stats.peak_wait_ms = self.stats.peak_wait_ms.max(waited);
                self.occupy();
            }
        }
    }

    fn settle(&mut self, epoch: u64, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.stats.success += 1,
            Outcome::Failed => self.stats.failed += 1,
            Outcome::TimedOut => {
                self.stats.failed += 1;
                self.stats.timeout_count += 1;
            }
        }
        if epoch == self.epoch {
            self.active = self.active.saturating_sub(1);
        }
        self.dispatch_waiting();
    }
}

enum Admission {
    Ready(u64),
    Waiting(PendingGrant),
}

/// Receiver side of a queued call.
///
/// If the caller goes away after a slot was granted but before it was
/// observed, the slot is handed back on drop.
struct PendingGrant {
    granted: Option<oneshot::Receiver<u64>>,
    state: Arc<Mutex<QueueState>>,
}

impl PendingGrant {
    async fn wait(mut self) -> Result<u64> {
        let Some(granted) = self.granted.as_mut() else {
            return Err(NetError::Cleared);
        };
        // The sender is dropped only by forced cleanup.
        let epoch = granted.await.map_err(|_| NetError::Cleared)?;
        self.granted = None;
        Ok(epoch)
    }
}

impl Drop for PendingGrant {
    fn drop(&mut self) {
        if let Some(mut granted) = self.granted.take() {
            granted.close();
            if let Ok(epoch) = granted.try_recv() {
                lock_state(&self.state).settle(epoch, Outcome::Failed);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Failed,
    TimedOut,
}

/// Holds one admission slot; releasing it dispatches the next waiter.
///
/// Dropping an unsettled slot (the caller abandoned the call mid-flight)
/// counts the call as failed.
struct Slot {
    state: Arc<Mutex<QueueState>>,
    ledger: Arc<ConnectionLedger>,
    id: String,
    epoch: u64,
    settled: bool,
}

impl Slot {
    fn settle(mut self, outcome: Outcome) {
        self.release(outcome);
    }

    fn release(&mut self, outcome: Outcome) {
        if self.settled {
            return;
        }
        self.settled = true;
        self.ledger.remove(&self.id);
        lock_state(&self.state).settle(self.epoch, outcome);
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.release(Outcome::Failed);
    }
}

/// What a forced cleanup discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub waiters_rejected: usize,
    pub slots_reclaimed: usize,
    pub ledger_entries_cleared: usize,
}

/// Bounded-concurrency admission controller
///
/// At most `max_concurrent` submitted calls run at once; up to `queue_limit`
/// more wait in priority order (higher first, FIFO among equals). Anything
/// beyond that is refused with [`NetError::QueueFull`] without being run.
///
/// When `request_timeout_ms` is set, a call that outlives it is cancelled:
/// its future is dropped at the deadline, the caller gets
/// [`NetError::Timeout`] and the slot goes to the next waiter. Use
/// [`TimeoutGuard`](crate::guard::TimeoutGuard) for calls that must run to
/// completion even after their caller gave up.
pub struct AdmissionQueue {
    config: AdmissionConfig,
    state: Arc<Mutex<QueueState>>,
    ledger: Arc<ConnectionLedger>,
    sink: SharedSink,
}

impl AdmissionQueue {
    pub fn new(config: AdmissionConfig) -> Result<Self> {
        Self::with_parts(config, Arc::new(ConnectionLedger::new()), default_sink())
    }

    /// Create a queue that records into a shared ledger and sink.
    pub fn with_parts(
        config: AdmissionConfig,
        ledger: Arc<ConnectionLedger>,
        sink: SharedSink,
    ) -> Result<Self> {
        config.validate()?;

        let state = QueueState {
            max_concurrent: config.max_concurrent,
            active: 0,
            epoch: 0,
            waiting: VecDeque::new(),
            stats: AdmissionStats::default(),
        };

        Ok(Self {
            config,
            state: Arc::new(Mutex::new(state)),
            ledger,
            sink,
        })
    }

    /// Run `work` once a slot is free.
    pub async fn submit<T, F, Fut>(&self, work: F, priority: i32) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.submit_with(work, priority, CallMeta::default()).await
    }

    /// Like [`submit`](Self::submit), recording `meta` in the ledger while the call runs.
    pub async fn submit_with<T, F, Fut>(&self, work: F, priority: i32, meta: CallMeta) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = {
            let mut state = self.lock();
            match state.try_acquire() {
                Some(epoch) => Admission::Ready(epoch),
                None => {
                    state.prune_abandoned();
                    if state.waiting.len() >= self.config.queue_limit {
                        state.stats.rejected += 1;
                        drop(state);
                        self.sink.emit(Event::QueueRejected {
                            queue_limit: self.config.queue_limit,
                        });
                        return Err(NetError::QueueFull {
                            limit: self.config.queue_limit,
                        });
                    }
                    let (grant, granted) = oneshot::channel();
                    state.enqueue(QueuedCall {
                        priority,
                        enqueued_at: Instant::now(),
                        grant,
                    });
                    Admission::Waiting(PendingGrant {
                        granted: Some(granted),
                        state: Arc::clone(&self.state),
                    })
                }
            }
        };

        let epoch = match admission {
            Admission::Ready(epoch) => epoch,
            Admission::Waiting(pending) => pending.wait().await?,
        };

        let id = call_id();
        self.ledger.insert(id.clone(), EntryKind::Call, meta);
        let slot = Slot {
            state: Arc::clone(&self.state),
            ledger: Arc::clone(&self.ledger),
            id,
            epoch,
            settled: false,
        };

        let result = match self.config.request_timeout_duration() {
            Some(limit) => match tokio::time::timeout(limit, work()).await {
                Ok(result) => result,
                Err(_) => {
                    let timeout_ms = limit.as_millis() as u64;
                    self.sink.emit(Event::CallTimedOut {
                        id: slot.id.clone(),
                        timeout_ms,
                    });
                    Err(NetError::Timeout { timeout_ms })
                }
            },
            None => work().await,
        };

        slot.settle(match &result {
            Ok(_) => Outcome::Success,
            Err(err) if err.is_timeout() => Outcome::TimedOut,
            Err(_) => Outcome::Failed,
        });
        result
    }

    pub fn stats(&self) -> AdmissionStats {
        let state = self.lock();
        let mut stats = state.stats.clone();
        stats.current_active = state.active;
        stats.queue_length = state.waiting.len();
        stats
    }

    pub fn active_count(&self) -> usize {
        self.lock().active
    }

    pub fn queue_len(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Leak recovery: reject every waiter, forget every running call, clear
    /// this queue's ledger entries.
    ///
    /// Calls still running keep going; when they settle they are counted but
    /// no longer release a slot. Safe to call repeatedly.
    pub fn force_cleanup(&self) -> CleanupReport {
        let (waiters_rejected, slots_reclaimed) = {
            let mut state = self.lock();
            let waiters = state.waiting.len();
            // Dropping the senders wakes each waiter with `Cleared`.
            state.waiting.clear();
            let reclaimed = state.active;
            state.active = 0;
            state.epoch += 1;
            (waiters, reclaimed)
        };
        let ledger_entries_cleared = self.ledger.force_clear_kind(EntryKind::Call);

        let report = CleanupReport {
            waiters_rejected,
            slots_reclaimed,
            ledger_entries_cleared,
        };
        if report != CleanupReport::default() {
            self.sink.emit(Event::ForcedCleanup {
                component: "admission",
                discarded: waiters_rejected + slots_reclaimed,
                ledger_cleared: ledger_entries_cleared,
            });
        }
        report
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        lock_state(&self.state)
    }
}

fn lock_state(state: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl HealthProbe for AdmissionQueue {
    fn name(&self) -> &str {
        "admission"
    }

    fn sample(&self) -> ProbeSample {
        let stats = self.stats();
        ProbeSample {
            settled: stats.settled(),
            failed: stats.failed,
            active: stats.current_active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue(max: usize, limit: usize) -> AdmissionQueue {
        AdmissionQueue::new(
            AdmissionConfig::default()
                .max_concurrent(max)
                .queue_limit(limit),
        )
        .unwrap()
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        assert!(AdmissionQueue::new(AdmissionConfig::default().max_concurrent(0)).is_err());
    }

    #[test]
    fn test_zero_queue_limit_rejected() {
        let result = AdmissionQueue::new(AdmissionConfig::default().queue_limit(0));
        assert!(matches!(result, Err(NetError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_immediate_dispatch() {
        let queue = queue(2, 5);
        let value = queue.submit(|| async { Ok(7) }, DEFAULT_PRIORITY).await.unwrap();
        assert_eq!(value, 7);

        let stats = queue.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.current_active, 0);
    }

    #[tokio::test]
    async fn test_failure_surfaces_without_retry() {
        let queue = queue(1, 5);
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let result: Result<()> = queue
            .submit(
                || async {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Err(NetError::Call("boom".into()))
                },
                DEFAULT_PRIORITY,
            )
            .await;

        assert_eq!(result, Err(NetError::Call("boom".into())));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(queue.stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_counts() {
        let queue = AdmissionQueue::new(
            AdmissionConfig::default().request_timeout(Some(Duration::from_millis(100))),
        )
        .unwrap();

        let result: Result<()> = queue
            .submit(
                || async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(())
                },
                DEFAULT_PRIORITY,
            )
            .await;

        assert_eq!(result, Err(NetError::Timeout { timeout_ms: 100 }));
        let stats = queue.stats();
        assert_eq!(stats.timeout_count, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.current_active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_cancels_the_work() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let queue = AdmissionQueue::new(
            AdmissionConfig::default().request_timeout(Some(Duration::from_millis(100))),
        )
        .unwrap();
        let finished = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&finished);
        let result: Result<()> = queue
            .submit(
                move || async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                },
                DEFAULT_PRIORITY,
            )
            .await;
        assert_eq!(result, Err(NetError::Timeout { timeout_ms: 100 }));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!finished.load(Ordering::SeqCst));
        assert!(queue.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_force_cleanup_on_empty_queue() {
        let queue = queue(3, 50);
        assert_eq!(queue.force_cleanup(), CleanupReport::default());
        assert_eq!(queue.force_cleanup(), CleanupReport::default());
        assert_eq!(queue.active_count(), 0);
        assert_eq!(queue.queue_len(), 0);
    }

    #[test]
    fn test_enqueue_orders_by_priority_then_fifo() {
        let mut state = QueueState {
            max_concurrent: 1,
            active: 1,
            epoch: 0,
            waiting: VecDeque::new(),
            stats: AdmissionStats::default(),
        };
        let mut receivers = Vec::new();
        for priority in [1, 5, 1, 3] {
            let (grant, rx) = oneshot::channel();
            receivers.push(rx);
            state.enqueue(QueuedCall {
                priority,
                enqueued_at: Instant::now(),
                grant,
            });
        }
        let order: Vec<i32> = state.waiting.iter().map(|q| q.priority).collect();
        assert_eq!(order, vec![5, 3, 1, 1]);
        assert_eq!(state.stats.queued, 4);
    }
}
