use super::{HealthProbe, ProbeSample};
use crate::config::HealthConfig;
use crate::ledger::{ConnectionLedger, EntryKind, LedgerRecord};
use crate::observability::{Event, SharedSink};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    pub ledger_size: usize,
    pub long_running: Vec<LedgerRecord>,
    /// Every alert emitted during the sweep, in emission order.
    pub alerts: Vec<Event>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.alerts.is_empty()
    }

    pub fn alert_count(&self, category: &str) -> usize {
        self.alerts
            .iter()
            .filter(|alert| alert.category() == category)
            .count()
    }
}

/// Passive observer over the ledger and the registered probes.
///
/// Never cancels or retries anything; it only emits alerts.
pub struct HealthMonitor {
    config: HealthConfig,
    ledger: Arc<ConnectionLedger>,
    probes: Vec<Arc<dyn HealthProbe>>,
    /// Probe samples at the start of each probe's current window.
    baselines: Mutex<HashMap<String, ProbeSample>>,
    sink: SharedSink,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, ledger: Arc<ConnectionLedger>, sink: SharedSink) -> Self {
        Self {
            config,
            ledger,
            probes: Vec::new(),
            baselines: Mutex::new(HashMap::new()),
            sink,
        }
    }

    /// Add a call source whose error rate and active count are checked each sweep.
    pub fn watch(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.config.check_interval_ms)
    }

    fn threshold_for(&self, kind: EntryKind) -> Duration {
        match kind {
            EntryKind::Request => Duration::from_millis(self.config.stale_request_threshold_ms),
            EntryKind::Call | EntryKind::Connection => {
                Duration::from_millis(self.config.stale_connection_threshold_ms)
            }
        }
    }

    /// Run one sweep and emit whatever it finds.
    pub fn check(&self) -> HealthReport {
        let mut report = HealthReport::default();

        let records = self.ledger.snapshot();
        report.ledger_size = records.len();
        for record in records {
            let threshold = self.threshold_for(record.kind);
            if record.age > threshold {
                report.alerts.push(Event::LongRunning {
                    id: record.id.clone(),
                    url: record.url.clone(),
                    method: record.method.clone(),
                    age_ms: record.age.as_millis() as u64,
                    threshold_ms: threshold.as_millis() as u64,
                });
                report.long_running.push(record);
            }
        }

        for probe in &self.probes {
            let sample = probe.sample();
            if let Some(alert) = self.judge_error_rate(probe.name(), sample) {
                report.alerts.push(alert);
            }
            if sample.active > self.config.active_ceiling {
                report.alerts.push(Event::CapacityAlert {
                    source: probe.name().to_string(),
                    active: sample.active,
                    ceiling: self.config.active_ceiling,
                });
            }
        }

        for alert in &report.alerts {
            self.sink.emit(alert.clone());
        }
        report
    }

    /// Error rate over the calls settled since the probe's last judged window.
    ///
    /// Windows smaller than the minimum sample keep accumulating instead of
    /// being discarded, so low-traffic periods are still judged eventually.
    fn judge_error_rate(&self, name: &str, sample: ProbeSample) -> Option<Event> {
        let mut baselines = self
            .baselines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let baseline = baselines.entry(name.to_string()).or_default();

        // A probe whose counters went backwards was replaced; restart its window.
        if sample.settled < baseline.settled || sample.failed < baseline.failed {
            *baseline = ProbeSample::default();
        }

        let total = sample.settled - baseline.settled;
        let failed = sample.failed - baseline.failed;
        if total <= self.config.min_sample_size {
            return None;
        }
        *baseline = sample;

        let rate = failed as f64 / total as f64;
        (rate > self.config.error_rate_threshold).then(|| Event::ErrorRateAlert {
            source: name.to_string(),
            failed,
            total,
            rate,
            threshold: self.config.error_rate_threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::CallMeta;
    use crate::observability::MemorySink;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeProbe {
        settled: AtomicU64,
        failed: AtomicU64,
        active: AtomicUsize,
    }

    impl FakeProbe {
        fn record(&self, ok: u64, failed: u64) {
            self.settled.fetch_add(ok + failed, Ordering::SeqCst);
            self.failed.fetch_add(failed, Ordering::SeqCst);
        }
    }

    impl HealthProbe for FakeProbe {
        fn name(&self) -> &str {
            "fake"
        }

        fn sample(&self) -> ProbeSample {
            ProbeSample {
                settled: self.settled.load(Ordering::SeqCst),
                failed: self.failed.load(Ordering::SeqCst),
                active: self.active.load(Ordering::SeqCst),
            }
        }
    }

    fn monitor_with(probe: Arc<FakeProbe>) -> (HealthMonitor, Arc<ConnectionLedger>, Arc<MemorySink>) {
        let ledger = Arc::new(ConnectionLedger::new());
        let sink = MemorySink::new();
        let monitor = HealthMonitor::new(HealthConfig::default(), Arc::clone(&ledger), sink.clone())
            .watch(probe);
        (monitor, ledger, sink)
    }

    #[test]
    fn test_healthy_when_idle() {
        let (monitor, _, sink) = monitor_with(Arc::new(FakeProbe::default()));
        let report = monitor.check();
        assert!(report.is_healthy());
        assert_eq!(report.ledger_size, 0);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_error_rate_needs_minimum_sample() {
        let probe = Arc::new(FakeProbe::default());
        let (monitor, _, _) = monitor_with(Arc::clone(&probe));

        probe.record(2, 8);
        assert!(monitor.check().is_healthy());

        probe.record(0, 1);
        let report = monitor.check();
        assert_eq!(report.alert_count("error_rate_alert"), 1);
        match &report.alerts[0] {
            Event::ErrorRateAlert { failed, total, .. } => {
                assert_eq!((*failed, *total), (9, 11));
            }
            other => panic!("unexpected alert {:?}", other),
        }
    }

    #[test]
    fn test_error_rate_window_advances() {
        let probe = Arc::new(FakeProbe::default());
        let (monitor, _, _) = monitor_with(Arc::clone(&probe));

        probe.record(5, 7);
        assert_eq!(monitor.check().alert_count("error_rate_alert"), 1);

        // The next window is healthy even though lifetime failures stay high.
        probe.record(20, 0);
        assert!(monitor.check().is_healthy());
    }

    #[test]
    fn test_low_error_rate_is_quiet() {
        let probe = Arc::new(FakeProbe::default());
        let (monitor, _, _) = monitor_with(Arc::clone(&probe));
        probe.record(18, 2);
        assert!(monitor.check().is_healthy());
    }

    #[test]
    fn test_capacity_ceiling() {
        let probe = Arc::new(FakeProbe::default());
        probe.active.store(11, Ordering::SeqCst);
        let (monitor, _, sink) = monitor_with(Arc::clone(&probe));

        let report = monitor.check();
        assert_eq!(report.alert_count("capacity_alert"), 1);
        assert_eq!(sink.count("capacity_alert"), 1);

        probe.active.store(10, Ordering::SeqCst);
        assert!(monitor.check().is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_thresholds_per_kind() {
        let (monitor, ledger, _) = monitor_with(Arc::new(FakeProbe::default()));
        ledger.insert("req", EntryKind::Request, CallMeta::new("/pay", "POST"));
        ledger.insert("call", EntryKind::Call, CallMeta::new("/menu", "GET"));

        tokio::time::advance(Duration::from_secs(11)).await;
        let report = monitor.check();
        assert_eq!(report.long_running.len(), 1);
        assert_eq!(report.long_running[0].id, "req");

        tokio::time::advance(Duration::from_secs(5)).await;
        let report = monitor.check();
        assert_eq!(report.alert_count("long_running"), 2);
        // Reporting never removes anything.
        assert_eq!(ledger.len(), 2);
    }
}
