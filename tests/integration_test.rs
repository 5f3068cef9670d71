//! End-to-end tests over in-memory streams
//!
//! These tests drive a full connection (transport, framing, dispatch, the
//! game-state store and delta sync) over raw streams and WebSocket, the way
//! a game client would:
//! - Authenticated updates mutate state and are acknowledged
//! - Expired sessions are rejected without a reply and logged once
//! - Unknown commands and corrupt frames are handled without crashing the server
//! - Pending requests complete on reply and fail on close

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use idlesync_server::auth::{Principal, StaticSessionValidator};
use idlesync_server::error::{NetworkError, SyncError};
use idlesync_server::game::sync::SnapshotCache;
use idlesync_server::game::{CharacterState, GameStateStore, InMemoryGameStore};
use idlesync_server::net::handler::ConnectionHandler;
use idlesync_server::net::transport::{split_stream, split_websocket};
use idlesync_server::protocol::messages::{AuthToken, CharacterStateDelta, CharacterStateUpdate, TimeSync};
use idlesync_server::protocol::{CorrelationId, FrameAssembler, Packet, Payload};
use idlesync_server::{AppState, ServerConfig};

const QUIET: Duration = Duration::from_millis(200);
const REPLY_WAIT: Duration = Duration::from_secs(2);

struct TestServer {
    state: Arc<AppState>,
    store: Arc<InMemoryGameStore>,
    user_id: Uuid,
}

fn server() -> TestServer {
    let user = Principal {
        user_id: Uuid::new_v4(),
        username: "streamer".to_string(),
    };
    let validator = Arc::new(StaticSessionValidator::new());
    validator.insert("live", user.clone(), Utc::now() + chrono::Duration::hours(1));
    validator.insert("stale", user.clone(), Utc::now() - chrono::Duration::minutes(5));

    let store = Arc::new(InMemoryGameStore::new());
    let config = ServerConfig {
        dev_mode: true,
        ..Default::default()
    };
    let (shutdown_tx, _) = broadcast::channel(1);
    let state = AppState::with_collaborators(config, shutdown_tx, validator, store.clone()).unwrap();

    TestServer {
        state: Arc::new(state),
        store,
        user_id: user.user_id,
    }
}

/// Client side of one connection
struct Client {
    io: DuplexStream,
    assembler: FrameAssembler,
    state: Arc<AppState>,
    task: JoinHandle<idlesync_server::Result<()>>,
}

impl Client {
    fn connect(state: &Arc<AppState>) -> Self {
        let (io, server_io) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = split_stream(server_io);
        let handler = ConnectionHandler::new(Arc::clone(state));
        let addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let task = tokio::spawn(async move { handler.serve(reader, writer, addr).await });

        Self {
            io,
            assembler: FrameAssembler::new(),
            state: Arc::clone(state),
            task,
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let frame = self.state.codec.encode(packet).unwrap();
        self.io.write_all(&frame).await.unwrap();
    }

    /// Send a request and return its correlation id
    async fn request(&mut self, id: &str, payload: impl Into<Payload>) -> CorrelationId {
        let correlation_id = CorrelationId::new();
        self.send(&Packet::new(id, payload).with_correlation_id(correlation_id))
            .await;
        correlation_id
    }

    /// Next packet from the server, or `None` on EOF or after `wait`
    async fn recv(&mut self, wait: Duration) -> Option<Packet> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(packet) = self.assembler.next_packet(&self.state.codec).unwrap() {
                return Some(packet);
            }
            let mut buf = [0u8; 4096];
            let n = tokio::time::timeout_at(deadline, self.io.read(&mut buf))
                .await
                .ok()?
                .ok()?;
            if n == 0 {
                return None;
            }
            self.assembler.push(&buf[..n]);
        }
    }

    async fn authenticate(&mut self, token: &str) -> Packet {
        let correlation_id = self
            .request(
                "authenticate",
                AuthToken {
                    token: token.to_string(),
                },
            )
            .await;
        let reply = self.recv(REPLY_WAIT).await.unwrap();
        assert_eq!(reply.correlation_id, Some(correlation_id));
        reply
    }
}

/// Client side of one WebSocket connection
struct WsClient {
    ws: WebSocketStream<DuplexStream>,
    state: Arc<AppState>,
    task: JoinHandle<idlesync_server::Result<()>>,
}

impl WsClient {
    async fn connect(state: &Arc<AppState>) -> Self {
        let (io, server_io) = tokio::io::duplex(64 * 1024);
        let handler = ConnectionHandler::new(Arc::clone(state));
        let addr: SocketAddr = "127.0.0.1:50001".parse().unwrap();
        let task = tokio::spawn(async move {
            let ws = tokio_tungstenite::accept_async(server_io).await.unwrap();
            let (reader, writer) = split_websocket(ws);
            handler.serve(reader, writer, addr).await
        });
        let (ws, _) = tokio_tungstenite::client_async("ws://localhost/", io).await.unwrap();

        Self {
            ws,
            state: Arc::clone(state),
            task,
        }
    }

    async fn send_frame(&mut self, frame: Vec<u8>) {
        self.ws.send(Message::Binary(frame)).await.unwrap();
    }

    async fn request(&mut self, id: &str, payload: impl Into<Payload>) -> CorrelationId {
        let correlation_id = CorrelationId::new();
        let packet = Packet::new(id, payload).with_correlation_id(correlation_id);
        let frame = self.state.codec.encode(&packet).unwrap();
        self.send_frame(frame.to_vec()).await;
        correlation_id
    }

    /// Next packet from the server, skipping control frames
    async fn recv(&mut self, wait: Duration) -> Option<Packet> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let message = tokio::time::timeout_at(deadline, self.ws.next()).await.ok()??.ok()?;
            match message {
                Message::Binary(data) => return Some(self.state.codec.decode(&data).unwrap()),
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }
}

/// Collects formatted log output written while it is the default subscriber
#[derive(Clone, Default)]
struct LogCapture(Arc<parking_lot::Mutex<Vec<u8>>>);

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl LogCapture {
    fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
        let writer = self.clone();
        tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish()
    }

    fn lines_containing(&self, needle: &str) -> usize {
        let output = String::from_utf8_lossy(&self.0.lock()).to_lowercase();
        output.lines().filter(|line| line.contains(needle)).count()
    }
}

/// A frame with a valid id and type, then a correlation id length that is neither 0 nor 16
fn corrupt_frame() -> Vec<u8> {
    let mut frame = vec![4u8];
    frame.extend_from_slice(b"ping");
    frame.push(0);
    frame.extend_from_slice(&7i32.to_le_bytes());
    frame
}

fn time_sync() -> TimeSync {
    TimeSync {
        server_time: Utc::now(),
        client_time: Some(Utc::now()),
        offset_ms: 0,
    }
}

fn away_state() -> CharacterState {
    CharacterState {
        health: 42,
        island: "Away".to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_valid_session_updates_state_and_replies() {
    let server = server();
    let mut client = Client::connect(&server.state);

    let reply = client.authenticate("live").await;
    assert_eq!(reply.payload, Payload::Bool(true));

    let character_id = Uuid::new_v4();
    let correlation_id = client
        .request(
            "update_character_state",
            CharacterStateUpdate {
                character_id,
                state: away_state(),
            },
        )
        .await;

    let reply = client.recv(REPLY_WAIT).await.unwrap();
    assert_eq!(reply.id, "update_character_state");
    assert_eq!(reply.correlation_id, Some(correlation_id));
    assert_eq!(reply.payload, Payload::Bool(true));

    let stored = server.store.character_state(character_id).unwrap();
    assert_eq!(stored.health, 42);
    assert_eq!(stored.island, "Away");
    assert_eq!(server.store.character_owner(character_id), Some(server.user_id));
}

#[tokio::test]
async fn test_expired_session_is_rejected_silently() {
    let server = server();
    let mut client = Client::connect(&server.state);

    let reply = client.authenticate("stale").await;
    assert_eq!(reply.payload, Payload::Bool(false));

    let character_id = Uuid::new_v4();
    client
        .request(
            "update_character_state",
            CharacterStateUpdate {
                character_id,
                state: away_state(),
            },
        )
        .await;

    assert!(client.recv(QUIET).await.is_none());
    assert!(server.store.character_state(character_id).is_none());
    assert!(!client.task.is_finished());
}

#[tokio::test]
async fn test_expired_session_rejection_is_logged_once() {
    let server = server();
    let mut client = Client::connect(&server.state);
    client.authenticate("stale").await;

    let logs = LogCapture::default();
    let _guard = tracing::subscriber::set_default(logs.subscriber());

    client
        .request(
            "update_character_state",
            CharacterStateUpdate {
                character_id: Uuid::new_v4(),
                state: away_state(),
            },
        )
        .await;
    // The server task runs on this thread, so its logs land in the capture
    let correlation_id = client.request("sync_time", time_sync()).await;
    let reply = client.recv(REPLY_WAIT).await.unwrap();
    assert_eq!(reply.correlation_id, Some(correlation_id));

    assert_eq!(logs.lines_containing("expired"), 1);
    assert_eq!(logs.lines_containing("session rejected"), 1);
}

#[tokio::test]
async fn test_unknown_command_is_dropped() {
    let server = server();
    let mut client = Client::connect(&server.state);

    client.send(&Packet::new("fly_to_moon", true)).await;

    // Packets are handled in arrival order, so this reply means the push was processed
    let correlation_id = client.request("sync_time", time_sync()).await;
    let reply = client.recv(REPLY_WAIT).await.unwrap();
    assert_eq!(reply.correlation_id, Some(correlation_id));
    assert!(matches!(reply.payload, Payload::TimeSync(_)));

    assert_eq!(server.state.dispatcher.unsupported().count(), 1);
    assert_eq!(server.state.sessions.count(), 1);
}

#[tokio::test]
async fn test_corrupt_stream_frame_closes_connection() {
    let server = server();
    let mut client = Client::connect(&server.state);

    client.io.write_all(&corrupt_frame()).await.unwrap();

    assert!(client.recv(REPLY_WAIT).await.is_none());
    let result = tokio::time::timeout(REPLY_WAIT, client.task).await.unwrap().unwrap();
    assert!(result.is_err());
    assert_eq!(server.state.sessions.count(), 0);
}

#[tokio::test]
async fn test_server_request_completes_on_reply() {
    let server = server();
    let mut client = Client::connect(&server.state);
    client.authenticate("live").await;

    let connection = server.state.sessions.get_by_user(server.user_id).unwrap();
    let request = tokio::spawn(async move { connection.send_request("confirm_raid", true).await });

    let incoming = client.recv(REPLY_WAIT).await.unwrap();
    assert_eq!(incoming.id, "confirm_raid");
    let correlation_id = incoming.correlation_id.unwrap();
    client
        .send(&Packet::new("confirm_raid", false).with_correlation_id(correlation_id))
        .await;

    let reply = request.await.unwrap().unwrap();
    assert_eq!(reply.payload, Payload::Bool(false));
    // The reply went to the waiting request, not to dispatch
    assert_eq!(server.state.dispatcher.unsupported().count(), 0);
}

#[tokio::test]
async fn test_pending_request_fails_when_connection_closes() {
    let server = server();
    let mut client = Client::connect(&server.state);
    client.authenticate("live").await;

    let connection = server.state.sessions.get_by_user(server.user_id).unwrap();
    let waiting = Arc::clone(&connection);
    let request = tokio::spawn(async move { waiting.send_request("confirm_raid", true).await });

    // Wait until the request is on the wire, then hang up
    assert!(client.recv(REPLY_WAIT).await.is_some());
    drop(client);

    let result = tokio::time::timeout(REPLY_WAIT, request).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(SyncError::Network(NetworkError::ConnectionClosed))
    ));
    assert!(connection.is_closed());
}

#[tokio::test]
async fn test_sync_tick_pushes_state_delta() {
    let server = server();
    let mut client = Client::connect(&server.state);
    client.authenticate("live").await;

    let character_id = Uuid::new_v4();
    server
        .store
        .store_character_state(server.user_id, character_id, away_state())
        .unwrap();

    let report = server.state.run_sync_tick();
    assert_eq!(report.state_deltas, 1);

    let pushed = client.recv(REPLY_WAIT).await.unwrap();
    assert_eq!(pushed.id, "update_character_state");
    assert_eq!(pushed.correlation_id, None);
    let Payload::CharacterStateDelta(CharacterStateDelta { deltas }) = pushed.payload else {
        panic!("expected a state delta, got {:?}", pushed.payload);
    };

    let mut snapshots = SnapshotCache::<CharacterState>::new();
    snapshots.apply_all(&deltas).unwrap();
    assert_eq!(snapshots.get(character_id), Some(&away_state()));

    // Nothing changed since the last tick
    assert!(server.state.run_sync_tick().is_empty());
}

#[tokio::test]
async fn test_websocket_request_gets_reply() {
    let server = server();
    let mut client = WsClient::connect(&server.state).await;

    let correlation_id = client
        .request(
            "authenticate",
            AuthToken {
                token: "live".to_string(),
            },
        )
        .await;
    let reply = client.recv(REPLY_WAIT).await.unwrap();
    assert_eq!(reply.correlation_id, Some(correlation_id));
    assert_eq!(reply.payload, Payload::Bool(true));

    let character_id = Uuid::new_v4();
    let correlation_id = client
        .request(
            "update_character_state",
            CharacterStateUpdate {
                character_id,
                state: away_state(),
            },
        )
        .await;
    let reply = client.recv(REPLY_WAIT).await.unwrap();
    assert_eq!(reply.correlation_id, Some(correlation_id));
    assert_eq!(server.store.character_state(character_id), Some(away_state()));
}

#[tokio::test]
async fn test_corrupt_websocket_frame_is_dropped() {
    let server = server();
    let mut client = WsClient::connect(&server.state).await;

    client.send_frame(corrupt_frame()).await;
    // Control traffic on its own keeps the connection alive too
    client.ws.send(Message::Ping(Vec::new())).await.unwrap();

    let correlation_id = client.request("sync_time", time_sync()).await;
    let reply = client.recv(REPLY_WAIT).await.unwrap();
    assert_eq!(reply.correlation_id, Some(correlation_id));
    assert!(matches!(reply.payload, Payload::TimeSync(_)));

    assert!(!client.task.is_finished());
    assert_eq!(server.state.sessions.count(), 1);
}
