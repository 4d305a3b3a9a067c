use super::monitor::HealthMonitor;
use crate::core::{NetError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

/// Background task running [`HealthMonitor::check`] on a fixed period.
///
/// Owned by whoever spawned it; dropping the worker aborts the task.
pub struct HealthWorker {
    sweeps: Arc<AtomicU64>,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl HealthWorker {
    /// Fails with [`NetError::InvalidConfig`] when the monitor's check
    /// interval is zero.
    pub fn spawn(monitor: Arc<HealthMonitor>) -> Result<Self> {
        monitor.config().validate()?;
        let period = monitor.interval();
        let sweeps = Arc::new(AtomicU64::new(0));
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let sweeps_for_worker = Arc::clone(&sweeps);

        let join_handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = monitor.check();
                        sweeps_for_worker.fetch_add(1, Ordering::Relaxed);
                        if !report.is_healthy() {
                            log::debug!("health sweep raised {} alert(s)", report.alerts.len());
                        }
                    }
                }
            }
        });

        Ok(Self {
            sweeps,
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        })
    }

    /// Sweeps completed so far.
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    /// Signals the worker to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| NetError::Call(format!("health worker join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for HealthWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}
