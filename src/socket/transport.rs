use crate::core::{NetError, Result};
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Capacity of the inbound event channel of one connection.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What an open connection reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    Closed { reason: String },
    Error(String),
}

/// Write half of an open connection.
#[async_trait]
pub trait TransportSink: Send {
    async fn send(&mut self, payload: String) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// An open connection: its write half plus the stream of what happens on it.
pub struct TransportConnection {
    pub sink: Box<dyn TransportSink>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens persistent connections. Returning `Ok` means the handshake completed.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, url: &str, headers: &[(String, String)]) -> Result<TransportConnection>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &str, headers: &[(String, String)]) -> Result<TransportConnection> {
        let mut request = url.into_client_request()?;
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| NetError::Transport(format!("invalid header '{}': {}", name, err)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| NetError::Transport(format!("invalid header value: {}", err)))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request).await?;
        let (write, mut read) = stream.split();
        let (tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let event = match frame {
                    Ok(Message::Text(text)) => TransportEvent::Message(text),
                    Ok(Message::Binary(bytes)) => {
                        TransportEvent::Message(String::from_utf8_lossy(&bytes).into_owned())
                    }
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.into_owned())
                            .unwrap_or_else(|| "closed by peer".to_string());
                        let _ = tx.send(TransportEvent::Closed { reason }).await;
                        return;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        let _ = tx.send(TransportEvent::Error(err.to_string())).await;
                        return;
                    }
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            let _ = tx
                .send(TransportEvent::Closed {
                    reason: "stream ended".to_string(),
                })
                .await;
        });

        Ok(TransportConnection {
            sink: Box::new(WsSink { write, reader }),
            events,
        })
    }
}

struct WsSink {
    write: SplitSink<WsStream, Message>,
    reader: JoinHandle<()>,
}

#[async_trait]
impl TransportSink for WsSink {
    async fn send(&mut self, payload: String) -> Result<()> {
        self.write.send(Message::Text(payload)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let result = self.write.close().await;
        self.reader.abort();
        result.map_err(NetError::from)
    }
}

impl Drop for WsSink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
