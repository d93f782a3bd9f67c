//! Daemon Server Implementation
//!
//! This module provides the WebSocket server loop for the daemon:
//! - Accepts TCP connections and upgrades them to WebSocket
//! - Spawns a handler task per connection
//! - Tracks active connections and enforces the connection limit
//! - Supports graceful shutdown
//!
//! # Multi-Client Architecture
//!
//! ```text
//!                     DaemonServer
//!                          │
//!          ┌───────────────┼───────────────┐
//!          │               │               │
//!    Capture page      Viewer tab      Viewer tab
//!     (conn-1)          (conn-2)        (conn-3)
//!          │               │               │
//!          └───────────────┴───────────────┘
//!                          │
//!                       Gateway
//!                (with ClientRegistry)
//! ```
//!
//! Each handler owns the receiving end of its client's outbound queue. When
//! the slow-client policy drops the client from the registry the queue
//! closes and the handler ends the connection.
//!
//! On shutdown the in-flight sessions are cancelled first and given time to
//! emit their `end`; only then do handlers flush their queues and send a
//! close frame.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use askrelay_core::config::ServerSettings;
use askrelay_core::{
    ClientHandle, ConnectionId, Gateway, JsonCodec, LlmBackend, OutboundMessage,
};

/// How long shutdown waits for sessions, then for handlers
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Connection state tracking (internal to server, separate from ClientHandle)
struct ConnectionState {
    /// When the connection was accepted
    connected_at: Instant,
    /// Remote address
    peer_addr: SocketAddr,
}

/// Configuration for the daemon server
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Per-connection outbound queue capacity
    pub connection_channel_capacity: usize,
    /// Frame codec
    pub codec: JsonCodec,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            connection_channel_capacity: 256,
            codec: JsonCodec::default(),
        }
    }
}

impl ServerConfig {
    /// Derive from the `[server]` configuration section
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            max_connections: settings.max_connections,
            connection_channel_capacity: settings.connection_channel_capacity,
            ..Self::default()
        }
    }
}

/// The main daemon server
pub struct DaemonServer<B: LlmBackend + ?Sized + 'static = dyn LlmBackend> {
    /// Gateway receiving client events
    gateway: Gateway<B>,
    /// Server configuration
    server_config: ServerConfig,
    /// Active connection state (peer info)
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl<B: LlmBackend + ?Sized + 'static> DaemonServer<B> {
    /// Create a new daemon server
    pub fn new(gateway: Gateway<B>, server_config: ServerConfig) -> Self {
        Self {
            gateway,
            server_config,
            connection_states: Arc::new(DashMap::new()),
        }
    }

    /// Run the accept loop until `shutdown` is cancelled
    pub async fn run(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "Listening for connections");

        let mut tasks = JoinSet::new();
        // Tells handlers to flush and close, after sessions have ended
        let closing = CancellationToken::new();

        loop {
            let (stream, peer_addr) = tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping accept loop");
                    break;
                }
                // Reap finished handlers
                Some(_) = tasks.join_next(), if !tasks.is_empty() => continue,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            // Check connection limit
            if self.connection_states.len() >= self.server_config.max_connections {
                warn!(
                    peer_addr = %peer_addr,
                    max_connections = self.server_config.max_connections,
                    "Connection limit reached, rejecting new connection"
                );
                drop(stream);
                continue;
            }

            let conn_id = ConnectionId::new();
            self.connection_states.insert(
                conn_id,
                ConnectionState {
                    connected_at: Instant::now(),
                    peer_addr,
                },
            );

            info!(
                conn_id = %conn_id,
                peer_addr = %peer_addr,
                active_connections = self.connection_states.len(),
                "New connection accepted"
            );

            tasks.spawn(
                Self::handle_connection(
                    conn_id,
                    stream,
                    peer_addr,
                    self.gateway.clone(),
                    self.server_config.clone(),
                    Arc::clone(&self.connection_states),
                    closing.clone(),
                )
                .instrument(tracing::info_span!("connection", %conn_id)),
            );
        }

        // Graceful shutdown
        self.shutdown(&mut tasks, &closing).await;
        Ok(())
    }

    /// Handle a single client connection
    ///
    /// Inbound frames are decoded and handed to the gateway; the client's
    /// outbound queue is forwarded to the socket.
    async fn handle_connection(
        conn_id: ConnectionId,
        stream: TcpStream,
        peer_addr: SocketAddr,
        gateway: Gateway<B>,
        server_config: ServerConfig,
        connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
        closing: CancellationToken,
    ) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "WebSocket handshake failed");
                connection_states.remove(&conn_id);
                return;
            }
        };

        let (client_tx, mut client_rx) =
            mpsc::channel::<OutboundMessage>(server_config.connection_channel_capacity);
        let clients = gateway.emitter().clients().clone();
        clients.register(ClientHandle::new(conn_id, client_tx).with_peer_addr(peer_addr));
        info!("Connection handler started");

        let codec = server_config.codec;
        let (mut sink, mut source) = ws.split();

        loop {
            tokio::select! {
                // Read from client
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => match codec.decode(text.as_str()) {
                        Ok(event) => {
                            debug!(event = event.name(), "Received event");
                            gateway.handle_event(Some(conn_id), event);
                        }
                        Err(e) => warn!(error = %e, "Ignoring malformed frame"),
                    },
                    Some(Ok(Message::Binary(_))) => debug!("Ignoring binary frame"),
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Client disconnected");
                        break;
                    }
                    // Ping/pong are answered by the protocol layer
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Read error");
                        break;
                    }
                },

                // Write messages to this specific client
                outbound = client_rx.recv() => match outbound {
                    Some(message) => {
                        if !Self::forward(&mut sink, codec, &message).await {
                            break;
                        }
                    }
                    None => {
                        // Dropped from the registry by the slow-client policy
                        warn!("Outbound queue closed");
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                },

                () = closing.cancelled() => {
                    while let Ok(message) = client_rx.try_recv() {
                        if !Self::forward(&mut sink, codec, &message).await {
                            break;
                        }
                    }
                    let _ = sink.send(Message::Close(None)).await;
                    debug!("Sent close frame for shutdown");
                    break;
                }
            }
        }

        clients.unregister(&conn_id);
        let uptime_secs = connection_states
            .remove(&conn_id)
            .map(|(_, state)| state.connected_at.elapsed().as_secs());
        let cancelled = gateway.handle_disconnect(conn_id);

        info!(
            cancelled_sessions = cancelled,
            uptime_secs = ?uptime_secs,
            active_connections = connection_states.len(),
            "Connection handler finished"
        );
    }

    /// Encode and write one message; false once the socket is unusable
    async fn forward(sink: &mut WsSink, codec: JsonCodec, message: &OutboundMessage) -> bool {
        match codec.encode(message) {
            Ok(frame) => {
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    warn!(error = %e, "Write error");
                    return false;
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode message"),
        }
        true
    }

    /// Graceful shutdown
    ///
    /// Cancelled sessions emit their `end` before any socket is closed.
    async fn shutdown(&self, tasks: &mut JoinSet<()>, closing: &CancellationToken) {
        info!(
            active_connections = self.connection_count(),
            "Initiating graceful shutdown"
        );
        for (conn_id, stats) in self.connection_stats() {
            debug!(
                conn_id = %conn_id,
                peer_addr = %stats.peer_addr,
                uptime_secs = stats.uptime_secs,
                "Closing connection"
            );
        }

        let cancelled = self.gateway.shutdown();
        if !self.gateway.wait_for_sessions(SHUTDOWN_GRACE).await {
            warn!(
                remaining = self.gateway.sessions().len(),
                "Sessions still running after grace period"
            );
        }

        closing.cancel();
        let joined = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if joined.is_err() {
            warn!(remaining = tasks.len(), "Aborting connection handlers");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        let clients = self.gateway.emitter().clients();
        for conn_id in clients.connection_ids() {
            clients.unregister(&conn_id);
        }
        self.connection_states.clear();

        info!(cancelled_sessions = cancelled, "Shutdown complete");
    }

    /// Get number of active connections
    pub fn connection_count(&self) -> usize {
        self.connection_states.len()
    }

    /// Get connection statistics
    pub fn connection_stats(&self) -> HashMap<ConnectionId, ConnectionStats> {
        self.connection_states
            .iter()
            .map(|r| {
                let conn_id = *r.key();
                let conn_state = r.value();
                (
                    conn_id,
                    ConnectionStats {
                        peer_addr: conn_state.peer_addr,
                        uptime_secs: conn_state.connected_at.elapsed().as_secs(),
                    },
                )
            })
            .collect()
    }
}

/// Statistics for a single connection
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// Remote address
    pub peer_addr: SocketAddr,
    /// Connection uptime in seconds
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    use askrelay_core::backend::{ScriptStep, ScriptedBackend};
    use askrelay_core::{BroadcastEmitter, ClientRegistry, GatewayConfig};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tokio::net::TcpStream;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct TestServer {
        addr: SocketAddr,
        server: Arc<DaemonServer<ScriptedBackend>>,
        shutdown: CancellationToken,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    async fn start_server(backend: ScriptedBackend, server_config: ServerConfig) -> TestServer {
        let gateway = Gateway::new(
            Arc::new(backend),
            BroadcastEmitter::new(ClientRegistry::new()),
            GatewayConfig::default(),
        );
        let server = Arc::new(DaemonServer::new(gateway, server_config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();

        let task = {
            let server = Arc::clone(&server);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.run(listener, shutdown).await })
        };

        TestServer {
            addr,
            server,
            shutdown,
            task,
        }
    }

    impl TestServer {
        async fn connect(&self) -> Client {
            let before = self.registered();
            let (ws, _) = connect_async(format!("ws://{}", self.addr)).await.unwrap();
            self.wait_for_clients(before + 1).await;
            ws
        }

        fn registered(&self) -> usize {
            self.server.gateway.emitter().clients().count()
        }

        async fn wait_for_clients(&self, n: usize) {
            for _ in 0..200 {
                if self.registered() == n {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("expected {n} registered clients, have {}", self.registered());
        }
    }

    async fn send(ws: &mut Client, value: Value) {
        ws.send(Message::Text(value.to_string())).await.unwrap();
    }

    /// Next text frame as JSON
    async fn recv(ws: &mut Client) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("Timeout waiting for message")
                .expect("Stream closed")
                .expect("Message error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    /// Frames up to and including the `end` of one session
    async fn recv_session(ws: &mut Client) -> Vec<Value> {
        let mut frames = Vec::new();
        loop {
            let frame = recv(ws).await;
            let done = frame["event"] == "stream_response" && frame["data"]["status"] == "end";
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }

    fn question(id: &str) -> Value {
        json!({
            "event": "streaming_event",
            "data": { "text": "What is Rust?", "type": "screenshot", "id": id }
        })
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.connection_channel_capacity, 256);
    }

    #[test]
    fn test_server_config_from_settings() {
        let settings = ServerSettings {
            max_connections: 3,
            connection_channel_capacity: 8,
            ..ServerSettings::default()
        };
        let config = ServerConfig::from_settings(&settings);
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.connection_channel_capacity, 8);
    }

    #[tokio::test]
    async fn test_stream_is_broadcast_to_all_clients() {
        let server = start_server(
            ScriptedBackend::tokens(["Hello", " world"]),
            ServerConfig::default(),
        )
        .await;
        let mut capture = server.connect().await;
        let mut viewer = server.connect().await;

        send(&mut capture, question("q1")).await;

        for ws in [&mut capture, &mut viewer] {
            let frames = recv_session(ws).await;
            let statuses: Vec<&str> = frames
                .iter()
                .map(|f| f["data"]["status"].as_str().unwrap())
                .collect();
            assert_eq!(statuses, vec!["start", "streaming", "streaming", "end"]);

            assert_eq!(frames[0]["data"]["question"], "What is Rust?");
            assert_eq!(frames[0]["data"]["type"], "screenshot");
            assert_eq!(frames[1]["data"]["content"], "Hello");
            assert_eq!(frames[2]["data"]["content"], " world");
            assert_eq!(frames[3]["data"]["isError"], false);
            assert!(frames.iter().all(|f| f["data"]["id"] == "q1"));
        }

        assert_eq!(server.server.connection_count(), 2);
        server.shutdown.cancel();
        server.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_relay_events_and_malformed_frames() {
        let server = start_server(ScriptedBackend::tokens(["x"]), ServerConfig::default()).await;
        let mut a = server.connect().await;
        let mut b = server.connect().await;

        // Garbage is ignored and the connection stays usable
        a.send(Message::Text("{not json".to_string())).await.unwrap();
        send(&mut a, json!({ "event": "launch_rockets" })).await;
        a.send(Message::Binary(vec![1, 2, 3])).await.unwrap();

        send(&mut a, json!({ "event": "recording_event", "data": true })).await;
        send(&mut a, json!({ "event": "take_screenshot" })).await;

        for ws in [&mut a, &mut b] {
            assert_eq!(recv(ws).await, json!({ "event": "recording_event", "data": true }));
            assert_eq!(recv(ws).await, json!({ "event": "take_screenshot" }));
        }

        server.shutdown.cancel();
        server.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_rejection_goes_to_sender_only() {
        let server = start_server(
            ScriptedBackend::tokens(["a", "b"]).with_step_delay(Duration::from_millis(30)),
            ServerConfig::default(),
        )
        .await;
        let mut sender = server.connect().await;
        let mut viewer = server.connect().await;

        send(&mut sender, question("dup")).await;
        send(&mut sender, question("dup")).await;

        let sender_frames = recv_session(&mut sender).await;
        let rejected: Vec<&Value> = sender_frames
            .iter()
            .filter(|f| f["event"] == "request_rejected")
            .collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0]["data"]["id"], "dup");
        assert_eq!(rejected[0]["data"]["type"], "screenshot");

        let viewer_frames = recv_session(&mut viewer).await;
        assert!(viewer_frames.iter().all(|f| f["event"] == "stream_response"));
        assert_eq!(viewer_frames.len(), 4);

        server.shutdown.cancel();
        server.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_cancels_sender_sessions() {
        let server = start_server(
            ScriptedBackend::new(vec![ScriptStep::Token("partial".into()), ScriptStep::Hang]),
            ServerConfig::default(),
        )
        .await;
        let mut sender = server.connect().await;
        let mut viewer = server.connect().await;

        send(&mut sender, question("q1")).await;
        assert_eq!(recv(&mut viewer).await["data"]["status"], "start");
        assert_eq!(recv(&mut viewer).await["data"]["content"], "partial");

        sender.close(None).await.unwrap();

        let end = recv(&mut viewer).await;
        assert_eq!(end["data"]["status"], "end");
        assert_eq!(end["data"]["isError"], true);
        assert_eq!(end["data"]["content"], "request cancelled");

        server.wait_for_clients(1).await;
        server.shutdown.cancel();
        server.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let config = ServerConfig {
            max_connections: 1,
            ..ServerConfig::default()
        };
        let server = start_server(ScriptedBackend::tokens(["x"]), config).await;
        let _first = server.connect().await;

        let second = connect_async(format!("ws://{}", server.addr)).await;
        assert!(second.is_err());
        assert_eq!(server.server.connection_count(), 1);

        let stats = server.server.connection_stats();
        assert_eq!(stats.len(), 1);
        assert!(stats.values().all(|s| s.peer_addr.ip().is_loopback()));

        server.shutdown.cancel();
        server.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_sessions_and_clears_clients() {
        let mut server = start_server(
            ScriptedBackend::new(vec![ScriptStep::Hang]),
            ServerConfig::default(),
        )
        .await;
        let mut client = server.connect().await;

        send(&mut client, question("q1")).await;
        assert_eq!(recv(&mut client).await["data"]["status"], "start");
        assert_eq!(server.server.gateway.sessions().len(), 1);

        server.shutdown.cancel();
        (&mut server.task).await.unwrap().unwrap();

        assert_eq!(server.registered(), 0);
        assert_eq!(server.server.connection_count(), 0);
        assert!(server.server.gateway.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_sends_cancelled_end_before_close() {
        let mut server = start_server(
            ScriptedBackend::new(vec![ScriptStep::Token("partial".into()), ScriptStep::Hang]),
            ServerConfig::default(),
        )
        .await;
        let mut capture = server.connect().await;
        let mut viewer = server.connect().await;

        send(&mut capture, question("q1")).await;
        for ws in [&mut capture, &mut viewer] {
            assert_eq!(recv(ws).await["data"]["status"], "start");
            assert_eq!(recv(ws).await["data"]["content"], "partial");
        }

        server.shutdown.cancel();

        for ws in [&mut capture, &mut viewer] {
            let end = recv(ws).await;
            assert_eq!(end["data"]["id"], "q1");
            assert_eq!(end["data"]["status"], "end");
            assert_eq!(end["data"]["isError"], true);
            assert_eq!(end["data"]["content"], "request cancelled");

            let next = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("Timeout waiting for close frame");
            assert!(
                matches!(next, Some(Ok(Message::Close(_)))),
                "expected close frame, got {next:?}"
            );
        }

        (&mut server.task).await.unwrap().unwrap();
        assert_eq!(server.registered(), 0);
    }
}
