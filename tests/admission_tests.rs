/// Admission queue tests
///
/// Concurrency bound, priority dispatch, overflow rejection and forced cleanup.
/// Run with: cargo test --test admission_tests

use netguard::{
    AdmissionConfig, AdmissionQueue, CallMeta, ConnectionLedger, DEFAULT_PRIORITY, EntryKind,
    MemorySink, NetError, Result,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

fn queue(max: usize, limit: usize) -> Arc<AdmissionQueue> {
    let config = AdmissionConfig::default()
        .max_concurrent(max)
        .queue_limit(limit)
        .request_timeout(None);
    Arc::new(AdmissionQueue::new(config).unwrap())
}

/// Occupy one slot until the returned sender fires.
fn block_slot(queue: &Arc<AdmissionQueue>) -> (oneshot::Sender<()>, tokio::task::JoinHandle<Result<()>>) {
    let (release, released) = oneshot::channel::<()>();
    let queue = Arc::clone(queue);
    let handle = tokio::spawn(async move {
        queue
            .submit(
                move || async move {
                    let _ = released.await;
                    Ok(())
                },
                DEFAULT_PRIORITY,
            )
            .await
    });
    (release, handle)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::task::yield_now().await;
    }
}

/// Small deterministic generator so arrival patterns are reproducible per seed.
struct Lcg64 {
    state: u64,
}

impl Lcg64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state >> 11
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }
}

#[tokio::test(start_paused = true)]
async fn test_active_never_exceeds_max_concurrent() {
    for seed in [7u64, 42, 1_234, 0xdead_beef] {
        let queue = queue(3, 50);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut rng = Lcg64::new(seed);

        let mut handles = vec![];
        for i in 0..20u64 {
            let arrival = Duration::from_millis(rng.below(60));
            let latency = Duration::from_millis(5 + rng.below(40));
            let priority = rng.below(3) as i32;
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(arrival).await;
                queue
                    .submit(
                        move || async move {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(latency).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                            Ok(i)
                        },
                        priority,
                    )
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3, "seed {}", seed);
        let stats = queue.stats();
        assert_eq!(stats.total, 20, "seed {}", seed);
        assert_eq!(stats.success, 20, "seed {}", seed);
        assert!(stats.peak_active <= 3, "seed {}", seed);
        assert_eq!(stats.current_active, 0, "seed {}", seed);
        assert_eq!(stats.queue_length, 0, "seed {}", seed);
    }
}

#[tokio::test]
async fn test_waiters_dispatch_by_priority_then_fifo() {
    let queue = queue(1, 10);
    let (release, blocker) = block_slot(&queue);
    wait_until(|| queue.active_count() == 1).await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = vec![];
    for (index, priority) in [1, 5, 1, 3].into_iter().enumerate() {
        let queue_for_task = Arc::clone(&queue);
        let order = Arc::clone(&order);
        handles.push(tokio::spawn(async move {
            queue_for_task
                .submit(
                    move || async move {
                        order.lock().unwrap().push((index, priority));
                        Ok(())
                    },
                    priority,
                )
                .await
        }));
        wait_until(|| queue.queue_len() == index + 1).await;
    }

    release.send(()).unwrap();
    blocker.await.unwrap().unwrap();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let order = order.lock().unwrap().clone();
    assert_eq!(order, vec![(1, 5), (3, 3), (0, 1), (2, 1)]);
    assert_eq!(queue.stats().queued, 4);
}

#[tokio::test]
async fn test_overflow_rejected_without_running_work() {
    let sink = MemorySink::new();
    let config = AdmissionConfig::default().max_concurrent(1).queue_limit(2);
    let queue = Arc::new(
        AdmissionQueue::with_parts(config, Arc::new(ConnectionLedger::new()), sink.clone()).unwrap(),
    );

    let (release, blocker) = block_slot(&queue);
    wait_until(|| queue.active_count() == 1).await;

    let mut waiters = vec![];
    for n in 0..2 {
        let queue_for_task = Arc::clone(&queue);
        waiters.push(tokio::spawn(async move {
            queue_for_task.submit(|| async { Ok(()) }, DEFAULT_PRIORITY).await
        }));
        wait_until(|| queue.queue_len() == n + 1).await;
    }

    let invoked = AtomicBool::new(false);
    let result = queue
        .submit(
            || async {
                invoked.store(true, Ordering::SeqCst);
                Ok(())
            },
            DEFAULT_PRIORITY,
        )
        .await;

    assert_eq!(result, Err(NetError::QueueFull { limit: 2 }));
    assert!(!invoked.load(Ordering::SeqCst));
    assert_eq!(queue.stats().rejected, 1);
    assert_eq!(sink.count("queue_rejected"), 1);

    release.send(()).unwrap();
    blocker.await.unwrap().unwrap();
    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }

    let stats = queue.stats();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.total, stats.success + stats.failed);
}

#[tokio::test(start_paused = true)]
async fn test_totals_balance_after_mixed_outcomes() {
    let config = AdmissionConfig::default()
        .max_concurrent(2)
        .queue_limit(50)
        .request_timeout(Some(Duration::from_millis(100)));
    let queue = Arc::new(AdmissionQueue::new(config).unwrap());

    let mut handles = vec![];
    for i in 0..12u64 {
        let queue = Arc::clone(&queue);
        handles.push(tokio::spawn(async move {
            queue
                .submit(
                    move || async move {
                        match i % 3 {
                            0 => Ok(()),
                            1 => Err(NetError::Call(format!("call {} failed", i))),
                            _ => {
                                tokio::time::sleep(Duration::from_millis(500)).await;
                                Ok(())
                            }
                        }
                    },
                    DEFAULT_PRIORITY,
                )
                .await
        }));
    }

    let mut timeouts = 0;
    for handle in handles {
        if let Err(err) = handle.await.unwrap() {
            if err.is_timeout() {
                timeouts += 1;
            }
        }
    }

    let stats = queue.stats();
    assert_eq!(timeouts, 4);
    assert_eq!(stats.total, 12);
    assert_eq!(stats.success, 4);
    assert_eq!(stats.failed, 8);
    assert_eq!(stats.timeout_count, 4);
    assert_eq!(stats.total, stats.success + stats.failed);
}

#[tokio::test]
async fn test_ledger_tracks_running_calls() {
    let ledger = Arc::new(ConnectionLedger::new());
    let queue = Arc::new(
        AdmissionQueue::with_parts(
            AdmissionConfig::default(),
            Arc::clone(&ledger),
            Arc::new(netguard::NoopSink),
        )
        .unwrap(),
    );

    let (release, released) = oneshot::channel::<()>();
    let queue_for_task = Arc::clone(&queue);
    let handle = tokio::spawn(async move {
        queue_for_task
            .submit_with(
                move || async move {
                    let _ = released.await;
                    Ok(())
                },
                DEFAULT_PRIORITY,
                CallMeta::new("/api/orders", "POST"),
            )
            .await
    });
    wait_until(|| ledger.len() == 1).await;

    let records = ledger.snapshot();
    assert_eq!(records[0].kind, EntryKind::Call);
    assert_eq!(records[0].url, "/api/orders");
    assert_eq!(records[0].method, "POST");

    release.send(()).unwrap();
    handle.await.unwrap().unwrap();
    assert!(ledger.is_empty());
}

#[tokio::test]
async fn test_force_cleanup_rejects_waiters_and_is_idempotent() {
    let queue = queue(1, 10);
    let (release, blocker) = block_slot(&queue);
    wait_until(|| queue.active_count() == 1).await;

    let queue_for_task = Arc::clone(&queue);
    let waiter = tokio::spawn(async move {
        queue_for_task.submit(|| async { Ok(()) }, DEFAULT_PRIORITY).await
    });
    wait_until(|| queue.queue_len() == 1).await;

    let report = queue.force_cleanup();
    assert_eq!(report.waiters_rejected, 1);
    assert_eq!(report.slots_reclaimed, 1);
    assert_eq!(report.ledger_entries_cleared, 1);
    assert_eq!(waiter.await.unwrap(), Err(NetError::Cleared));

    let again = queue.force_cleanup();
    assert_eq!(again, netguard::CleanupReport::default());
    assert_eq!(queue.active_count(), 0);
    assert_eq!(queue.queue_len(), 0);

    // The orphaned call settles without pushing the slot count below zero.
    release.send(()).unwrap();
    blocker.await.unwrap().unwrap();
    assert_eq!(queue.active_count(), 0);

    let value = queue.submit(|| async { Ok(9) }, DEFAULT_PRIORITY).await.unwrap();
    assert_eq!(value, 9);
}
