// ============================================================================
// netguard: client-side network resilience
// ============================================================================

pub mod admission;
pub mod config;
pub mod core;
pub mod credentials;
pub mod guard;
pub mod health;
pub mod ledger;
pub mod observability;
pub mod socket;

pub use admission::{AdmissionQueue, AdmissionStats, CleanupReport, DEFAULT_PRIORITY};
pub use config::{AdmissionConfig, GuardConfig, HealthConfig, ResilienceConfig, SocketConfig};
pub use core::{NetError, Result};
pub use credentials::{JsonFileStore, KeyValueStore, MemoryStore};
pub use guard::{
    GuardStats, HttpRequester, RequestOptions, ReqwestRequester, Response, SafeRequest,
    TimeoutGuard,
};
pub use health::{HealthMonitor, HealthProbe, HealthReport, HealthWorker, ProbeSample};
pub use ledger::{CallMeta, ConnectionLedger, EntryKind, LedgerRecord};
pub use observability::{Event, EventSink, MemorySink, NoopSink, SharedSink, TracingSink};
pub use socket::{ConnectionState, InboundMessage, SocketClient, Transport, WsTransport};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Composition root
// ============================================================================

/// What a client-wide forced cleanup discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientCleanup {
    pub admission: CleanupReport,
    pub guard_passes_reclaimed: usize,
}

/// Resilience client
///
/// Owns one ledger, one admission queue and one timeout guard, all reporting
/// into the same event sink. Health monitors and socket clients built from it
/// share that ledger, so a single report covers every outstanding call.
///
/// # Examples
///
/// ```
/// use netguard::{NetClient, ResilienceConfig, DEFAULT_PRIORITY};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> netguard::Result<()> {
/// let client = NetClient::from_config(ResilienceConfig::default())?;
///
/// let total = client
///     .submit(|| async { Ok::<_, netguard::NetError>(40 + 2) }, DEFAULT_PRIORITY)
///     .await?;
/// assert_eq!(total, 42);
/// assert_eq!(client.admission_stats().success, 1);
/// # Ok(())
/// # }
/// ```
pub struct NetClient {
    config: ResilienceConfig,
    ledger: Arc<ConnectionLedger>,
    sink: SharedSink,
    queue: Arc<AdmissionQueue>,
    guard: Arc<TimeoutGuard>,
}

impl NetClient {
    /// Build a client reporting into `sink`. The configuration is validated first.
    pub fn new(config: ResilienceConfig, sink: SharedSink) -> Result<Self> {
        config.validate()?;

        let ledger = Arc::new(ConnectionLedger::new());
        let queue = AdmissionQueue::with_parts(
            config.admission.clone(),
            Arc::clone(&ledger),
            Arc::clone(&sink),
        )?;
        let guard =
            TimeoutGuard::with_parts(config.guard.clone(), Arc::clone(&ledger), Arc::clone(&sink))?;

        Ok(Self {
            config,
            ledger,
            sink,
            queue: Arc::new(queue),
            guard: Arc::new(guard),
        })
    }

    /// Build a client that logs its events through `tracing`.
    pub fn from_config(config: ResilienceConfig) -> Result<Self> {
        Self::new(config, observability::default_sink())
    }

    /// Run `work` through the admission queue.
    pub async fn submit<T, F, Fut>(&self, work: F, priority: i32) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.queue.submit(work, priority).await
    }

    pub async fn submit_with<T, F, Fut>(&self, work: F, priority: i32, meta: CallMeta) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.queue.submit_with(work, priority, meta).await
    }

    /// Race `call` against `timeout` through the timeout guard.
    pub async fn guard<T, F, Fut>(&self, call: F, timeout: Duration) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.guard.guard(call, timeout).await
    }

    /// Wrap `requester` so every request it makes is timeout-guarded.
    pub fn safe_request<R: HttpRequester>(&self, requester: R) -> SafeRequest<R> {
        SafeRequest::new(requester, Arc::clone(&self.guard))
    }

    /// Admit a request through the queue, then run it through the guard.
    pub async fn request_queued<R: HttpRequester>(
        &self,
        safe: &SafeRequest<R>,
        options: RequestOptions,
        priority: i32,
    ) -> Result<Response> {
        let meta = options.meta();
        let safe = safe.clone();
        self.queue
            .submit_with(move || async move { safe.request(options).await }, priority, meta)
            .await
    }

    pub fn admission_stats(&self) -> AdmissionStats {
        self.queue.stats()
    }

    pub fn guard_stats(&self) -> GuardStats {
        self.guard.stats()
    }

    /// Reset both the admission queue and the timeout guard.
    pub fn force_cleanup(&self) -> ClientCleanup {
        ClientCleanup {
            admission: self.queue.force_cleanup(),
            guard_passes_reclaimed: self.guard.force_close_all(),
        }
    }

    /// A health monitor over this client's ledger, queue and guard.
    pub fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(self.config.health.clone(), Arc::clone(&self.ledger), Arc::clone(&self.sink))
            .watch(Arc::clone(&self.queue) as Arc<dyn HealthProbe>)
            .watch(Arc::clone(&self.guard) as Arc<dyn HealthProbe>)
    }

    /// Start periodic health sweeps in the background.
    pub fn spawn_health_worker(&self) -> Result<HealthWorker> {
        HealthWorker::spawn(Arc::new(self.health_monitor()))
    }

    /// A socket client sharing this client's ledger and sink.
    pub fn socket_client(
        &self,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn KeyValueStore>,
    ) -> Result<SocketClient> {
        SocketClient::with_parts(
            self.config.socket.clone(),
            transport,
            credentials,
            Arc::clone(&self.ledger),
            Arc::clone(&self.sink),
        )
    }

    pub fn ledger(&self) -> &Arc<ConnectionLedger> {
        &self.ledger
    }

    pub fn queue(&self) -> &Arc<AdmissionQueue> {
        &self.queue
    }

    pub fn timeout_guard(&self) -> &Arc<TimeoutGuard> {
        &self.guard
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_submit_and_stats() {
        let client = NetClient::new(ResilienceConfig::default(), Arc::new(NoopSink)).unwrap();

        let value = client
            .submit(|| async { Ok::<_, NetError>("done") }, DEFAULT_PRIORITY)
            .await
            .unwrap();
        assert_eq!(value, "done");

        let err = client
            .submit(
                || async { Err::<(), _>(NetError::Call("boom".into())) },
                DEFAULT_PRIORITY,
            )
            .await
            .unwrap_err();
        assert_eq!(err, NetError::Call("boom".into()));

        let stats = client.admission_stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.failed, 1);
        assert!(client.ledger().is_empty());
    }

    #[test]
    fn test_client_rejects_invalid_config() {
        let config = ResilienceConfig::default()
            .admission(AdmissionConfig::default().max_concurrent(0));
        assert!(matches!(
            NetClient::new(config, Arc::new(NoopSink)),
            Err(NetError::InvalidConfig(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_guard_timeout() {
        let client = NetClient::new(ResilienceConfig::default(), Arc::new(NoopSink)).unwrap();
        let err = client
            .guard(
                || async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(1)
                },
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert_eq!(err, NetError::Timeout { timeout_ms: 100 });
        assert_eq!(client.guard_stats().timeouts, 1);
    }

    #[test]
    fn test_force_cleanup_on_idle_client() {
        let client = NetClient::new(ResilienceConfig::default(), Arc::new(NoopSink)).unwrap();
        assert_eq!(client.force_cleanup(), ClientCleanup::default());
        assert_eq!(client.force_cleanup(), ClientCleanup::default());
    }
}
