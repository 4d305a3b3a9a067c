/// WebSocket transport tests
///
/// Runs the socket client over a real loopback WebSocket server.
/// Run with: cargo test --test ws_transport_tests

use futures::{SinkExt, StreamExt};
use netguard::{ConnectionState, MemoryStore, SocketClient, SocketConfig, WsTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

#[tokio::test]
async fn test_ws_round_trip_with_session_headers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (headers_tx, headers_rx) = oneshot::channel::<(String, String)>();
    let (received_tx, mut received_rx) = mpsc::unbounded_channel::<String>();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            let header = |name: &str| {
                req.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            };
            let _ = headers_tx.send((header("authorization"), header("tenant-id")));
            Ok::<_, ErrorResponse>(resp)
        })
        .await
        .unwrap();

        let (mut write, mut read) = ws.split();
        write.send(Message::Text("success".into())).await.unwrap();
        write
            .send(Message::Text(r#"{"type":"login","user":"pos"}"#.into()))
            .await
            .unwrap();
        write
            .send(Message::Text(r#"{"type":"order","id":5}"#.into()))
            .await
            .unwrap();

        while let Some(Ok(frame)) = read.next().await {
            if let Message::Text(text) = frame {
                let _ = received_tx.send(text);
            }
        }
    });

    let client = SocketClient::new(
        SocketConfig::new(&format!("ws://{}/ws", addr)),
        Arc::new(WsTransport::new()),
        Arc::new(MemoryStore::with_session("tok", "tenant-1", "store-1")),
    )
    .unwrap();
    let (messages_tx, mut messages_rx) = mpsc::unbounded_channel();
    client.on_message(move |message| {
        let _ = messages_tx.send(message);
    });

    client.init().await.unwrap();
    client
        .wait_for_state(ConnectionState::Open, Duration::from_secs(5))
        .await
        .unwrap();

    let (authorization, tenant) = headers_rx.await.unwrap();
    assert_eq!(authorization, "Bearer tok");
    assert_eq!(tenant, "tenant-1");

    let message = tokio::time::timeout(Duration::from_secs(5), messages_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.message_type(), Some("order"));

    client.send("ping").await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(5), received_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, "ping");

    client.close().await;
    assert_eq!(client.state(), ConnectionState::Closed);
    let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
}

#[tokio::test]
async fn test_refused_connection_reconnects_then_closes() {
    // Bind then drop to get a port nothing listens on.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let client = SocketClient::new(
        SocketConfig::new(&format!("ws://{}/ws", addr))
            .max_reconnect_attempts(2)
            .reconnect_interval(Duration::from_millis(50)),
        Arc::new(WsTransport::new()),
        Arc::new(MemoryStore::with_session("tok", "t", "s")),
    )
    .unwrap();

    client.init().await.unwrap();
    client
        .wait_for_state(ConnectionState::Closed, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(client.reconnect_attempts(), 2);
}
