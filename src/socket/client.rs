use super::ConnectionState;
use super::message::{InboundMessage, MessageFilter};
use super::transport::{Transport, TransportConnection, TransportEvent};
use crate::config::SocketConfig;
use crate::core::{NetError, Result, connection_id};
use crate::credentials::{KeyValueStore, connection_headers};
use crate::ledger::{CallMeta, ConnectionLedger, EntryKind};
use crate::observability::{Event, SharedSink, default_sink};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, timeout};
use tracing::{Level, event};

/// Capacity of the outbound queue feeding the driver.
const OUTBOUND_CAPACITY: usize = 64;

pub type MessageCallback = Arc<dyn Fn(InboundMessage) + Send + Sync>;

type Headers = Vec<(String, String)>;

struct Outbound {
    payload: String,
    reply: oneshot::Sender<Result<()>>,
}

/// Why the open phase ended.
enum OpenExit {
    Shutdown,
    Lost(String),
}

/// State shared between the client handle and its driver task.
struct Shared {
    config: SocketConfig,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn KeyValueStore>,
    ledger: Arc<ConnectionLedger>,
    sink: SharedSink,
    filter: MessageFilter,
    state: watch::Sender<ConnectionState>,
    callback: RwLock<Option<MessageCallback>>,
    attempts: AtomicU32,
}

impl Shared {
    fn set_state(&self, to: ConnectionState) {
        let from = self.state.send_replace(to);
        if from != to {
            event!(Level::DEBUG, %from, %to, "socket state changed");
            self.sink.emit(Event::StateChanged { from, to });
        }
    }

    fn dispatch(&self, raw: String) {
        let Some(message) = self.filter.accept(raw) else {
            return;
        };
        let callback = self
            .callback
            .read()
            .ok()
            .and_then(|slot| slot.clone());
        if let Some(callback) = callback {
            callback(message);
        }
    }

    /// Connect, stay open, reconnect; until shut down or out of attempts.
    async fn drive(
        self: Arc<Self>,
        mut headers: Headers,
        mut shutdown: watch::Receiver<bool>,
        mut outbound: mpsc::Receiver<Outbound>,
    ) {
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let backoff = Duration::from_millis(self.config.reconnect_interval_ms);

        loop {
            // Pick up a refreshed session; keep the last good one otherwise.
            if let Ok(fresh) = connection_headers(self.credentials.as_ref()) {
                headers = fresh;
            }

            let attempt_id = connection_id();
            self.ledger.insert(
                attempt_id.clone(),
                EntryKind::Connection,
                CallMeta::new(self.config.url.clone(), "CONNECT"),
            );
            let handshake = timeout(connect_timeout, self.transport.connect(&self.config.url, &headers));
            let outcome = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => {
                    self.ledger.remove(&attempt_id);
                    return;
                }
                outcome = handshake => outcome,
            };
            self.ledger.remove(&attempt_id);

            let reason = match outcome {
                Ok(Ok(connection)) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    self.set_state(ConnectionState::Open);
                    match self.run_open(connection, &mut shutdown, &mut outbound).await {
                        OpenExit::Shutdown => return,
                        OpenExit::Lost(reason) => reason,
                    }
                }
                Ok(Err(err)) => err.to_string(),
                Err(_) => format!("handshake timed out after {}ms", connect_timeout.as_millis()),
            };

            self.sink.emit(Event::TransportLost {
                reason: reason.clone(),
            });
            self.set_state(ConnectionState::Reconnecting);
            reject_pending(&mut outbound);

            let attempts = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempts >= self.config.max_reconnect_attempts {
                event!(Level::WARN, attempts, reason = %reason, "socket reconnect attempts exhausted");
                self.sink.emit(Event::ReconnectExhausted { attempts });
                self.set_state(ConnectionState::Closed);
                return;
            }

            self.sink.emit(Event::ReconnectScheduled {
                attempt: attempts,
                max_attempts: self.config.max_reconnect_attempts,
                delay_ms: backoff.as_millis() as u64,
            });
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => return,
                _ = sleep(backoff) => {}
            }
            self.set_state(ConnectionState::Connecting);
        }
    }

    /// Pump one open connection. The heartbeat timer lives only in here.
    async fn run_open(
        &self,
        connection: TransportConnection,
        shutdown: &mut watch::Receiver<bool>,
        outbound: &mut mpsc::Receiver<Outbound>,
    ) -> OpenExit {
        let TransportConnection {
            mut sink,
            mut events,
        } = connection;
        let period = Duration::from_millis(self.config.heartbeat_interval_ms);
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                _ = shutdown_requested(shutdown) => break OpenExit::Shutdown,
                inbound = events.recv() => match inbound {
                    Some(TransportEvent::Message(raw)) => self.dispatch(raw),
                    Some(TransportEvent::Closed { reason }) => break OpenExit::Lost(reason),
                    Some(TransportEvent::Error(err)) => break OpenExit::Lost(err),
                    None => break OpenExit::Lost("event stream ended".to_string()),
                },
                Some(message) = outbound.recv() => {
                    let result = sink.send(message.payload).await;
                    let failure = result.as_ref().err().map(|err| err.to_string());
                    let _ = message.reply.send(result);
                    if let Some(err) = failure {
                        break OpenExit::Lost(err);
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(err) = sink.send(self.config.heartbeat_payload.clone()).await {
                        self.sink.emit(Event::HeartbeatFailed { error: err.to_string() });
                        break OpenExit::Lost(format!("heartbeat failed: {}", err));
                    }
                }
            }
        };

        if let Err(err) = sink.close().await {
            log::debug!("socket close after {}: {}", exit_label(&exit), err);
        }
        exit
    }
}

fn exit_label(exit: &OpenExit) -> &str {
    match exit {
        OpenExit::Shutdown => "shutdown",
        OpenExit::Lost(reason) => reason,
    }
}

/// Resolves once shutdown is requested or the client handle is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn reject_pending(outbound: &mut mpsc::Receiver<Outbound>) {
    while let Ok(message) = outbound.try_recv() {
        let _ = message.reply.send(Err(NetError::NotConnected));
    }
}

struct Driver {
    shutdown: watch::Sender<bool>,
    outbound: mpsc::Sender<Outbound>,
    handle: JoinHandle<()>,
}

/// Persistent connection client
///
/// Owns at most one transport connection at a time. After [`init`](Self::init)
/// it connects, sends a heartbeat while open, and on any failure reconnects
/// after a constant delay until `max_reconnect_attempts` consecutive attempts
/// have failed, at which point it is `Closed` and stays so until the next
/// `init`. The message callback survives reconnects.
pub struct SocketClient {
    shared: Arc<Shared>,
    driver: Mutex<Option<Driver>>,
}

impl SocketClient {
    pub fn new(
        config: SocketConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        Self::with_parts(
            config,
            transport,
            credentials,
            Arc::new(ConnectionLedger::new()),
            default_sink(),
        )
    }

    /// Fails with [`NetError::InvalidConfig`] on an empty url or a zero
    /// heartbeat interval or connect timeout.
    pub fn with_parts(
        config: SocketConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn KeyValueStore>,
        ledger: Arc<ConnectionLedger>,
        sink: SharedSink,
    ) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(ConnectionState::Idle);
        let filter = MessageFilter::from_config(&config);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                transport,
                credentials,
                ledger,
                sink,
                filter,
                state,
                callback: RwLock::new(None),
                attempts: AtomicU32::new(0),
            }),
            driver: Mutex::new(None),
        })
    }

    /// Start connecting.
    ///
    /// A no-op while a connection is being kept alive. Fails with
    /// [`NetError::AuthMissing`] and stays `Idle` when the credential store
    /// lacks any required value; nothing is scheduled in that case.
    pub async fn init(&self) -> Result<()> {
        let mut driver = self.driver.lock().await;
        if self.state().is_running() {
            return Ok(());
        }
        if let Some(finished) = driver.take() {
            finished.handle.abort();
        }

        let headers = match connection_headers(self.shared.credentials.as_ref()) {
            Ok(headers) => headers,
            Err(err) => {
                if let NetError::AuthMissing(missing) = &err {
                    event!(Level::WARN, ?missing, "socket init aborted: credentials missing");
                    self.shared.sink.emit(Event::AuthMissing {
                        missing: missing.clone(),
                    });
                }
                self.shared.set_state(ConnectionState::Idle);
                return Err(err);
            }
        };

        self.shared.attempts.store(0, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Connecting);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let handle = tokio::spawn(Arc::clone(&self.shared).drive(headers, shutdown_rx, outbound_rx));

        *driver = Some(Driver {
            shutdown,
            outbound,
            handle,
        });
        Ok(())
    }

    /// Register the message callback, replacing any previous one.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        self.set_callback(Some(Arc::new(callback)));
    }

    pub fn set_callback(&self, callback: Option<MessageCallback>) {
        match self.shared.callback.write() {
            Ok(mut slot) => *slot = callback,
            Err(poisoned) => *poisoned.into_inner() = callback,
        }
    }

    /// Send a payload over the open connection.
    pub async fn send(&self, payload: impl Into<String>) -> Result<()> {
        if self.state() != ConnectionState::Open {
            return Err(NetError::NotConnected);
        }
        let outbound = {
            let driver = self.driver.lock().await;
            match driver.as_ref() {
                Some(driver) => driver.outbound.clone(),
                None => return Err(NetError::NotConnected),
            }
        };

        let (reply, replied) = oneshot::channel();
        outbound
            .send(Outbound {
                payload: payload.into(),
                reply,
            })
            .await
            .map_err(|_| NetError::NotConnected)?;
        replied.await.map_err(|_| NetError::NotConnected)?
    }

    /// Stop for good: tear down heartbeat and transport, never reconnect.
    pub async fn close(&self) {
        let driver = self.driver.lock().await.take();
        if let Some(driver) = driver {
            let _ = driver.shutdown.send(true);
            if let Err(err) = driver.handle.await {
                log::warn!("socket driver ended abnormally: {}", err);
            }
        }
        self.shared.set_state(ConnectionState::Closed);
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the client reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState, limit: Duration) -> Result<()> {
        let mut states = self.subscribe();
        let wait = async {
            loop {
                if *states.borrow_and_update() == target {
                    return Ok(());
                }
                if states.changed().await.is_err() {
                    return Err(NetError::NotConnected);
                }
            }
        };
        timeout(limit, wait).await.map_err(|_| NetError::Timeout {
            timeout_ms: limit.as_millis() as u64,
        })?
    }

    /// Consecutive failed connection attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &SocketConfig {
        &self.shared.config
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            let _ = driver.shutdown.send(true);
            driver.handle.abort();
        }
    }
}
