//! Connection handler module
//!
//! Handles the lifecycle of client connections including:
//! - Initial connection setup (TCP or WebSocket)
//! - Reassembling frames and routing decoded packets
//! - Handing replies to waiting requests, everything else to dispatch
//! - The writer task that owns the transport's write half
//! - Graceful disconnection

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, trace, warn};

use crate::error::{NetworkError, Result, SyncError};
use crate::net::connection::{Connection, Outbound, OutboundQueue};
use crate::net::transport::{split_stream, split_websocket, TransportReader, TransportWriter};
use crate::protocol::dispatch::DispatchOutcome;
use crate::protocol::frame::FrameAssembler;
use crate::protocol::packet::Packet;
use crate::AppState;

/// Runs one client connection from accept to teardown
pub struct ConnectionHandler {
    /// Shared application state
    state: Arc<AppState>,
}

impl ConnectionHandler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Handle a raw TCP connection
    pub async fn handle_tcp(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        debug!(address = %addr, "Handling TCP connection");
        stream.set_nodelay(true)?;

        let (reader, writer) = split_stream(stream);
        self.serve(reader, writer, addr).await
    }

    /// Handle a WebSocket connection
    pub async fn handle_websocket(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        debug!(address = %addr, "Handling WebSocket connection");

        // Set TCP options before upgrade
        stream.set_nodelay(true)?;

        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| SyncError::Network(NetworkError::WebSocket(e.to_string())))?;

        info!(address = %addr, "WebSocket connection established");

        let (reader, writer) = split_websocket(ws_stream);
        self.serve(reader, writer, addr).await
    }

    /// Serve a connection over already split transport halves
    pub async fn serve(&self, reader: TransportReader, writer: TransportWriter, addr: SocketAddr) -> Result<()> {
        let (connection, queue) = self.state.sessions.create_connection(
            addr,
            reader.kind(),
            Arc::clone(&self.state.codec),
            self.state.connection_options(),
        )?;

        debug!(
            connection_id = connection.id(),
            address = %addr,
            transport = %reader.kind(),
            "Starting connection handler"
        );

        let writer_task = tokio::spawn(run_writer(Arc::clone(&connection), queue, writer));

        let result = self.read_loop(&connection, reader).await;

        // Cleanup
        debug!(connection_id = connection.id(), "Connection handler ending");
        connection.close();
        if let Err(e) = writer_task.await {
            warn!(connection_id = connection.id(), error = %e, "Writer task failed");
        }
        if let Some((_, Some(user_id))) = self.state.sessions.remove(connection.id()) {
            self.state.sync.forget_user(self.state.store.as_ref(), user_id);
        }

        result
    }

    /// Read, reassemble and route until the peer or the server closes the connection
    async fn read_loop(&self, connection: &Arc<Connection>, mut reader: TransportReader) -> Result<()> {
        let kind = reader.kind();
        let mut assembler = FrameAssembler::new();

        loop {
            let chunk = tokio::select! {
                chunk = reader.next_chunk() => chunk?,
                _ = connection.closed() => {
                    debug!(connection_id = connection.id(), "Connection closed by server");
                    return Ok(());
                }
            };
            let Some(chunk) = chunk else {
                debug!(connection_id = connection.id(), "Connection closed by peer");
                return Ok(());
            };

            connection.touch();
            if chunk.is_empty() {
                continue;
            }
            assembler.push(&chunk);

            loop {
                match assembler.next_packet(&self.state.codec) {
                    Ok(Some(packet)) => {
                        self.route(connection, packet).await;
                    }
                    Ok(None) => break,
                    Err(SyncError::Codec(e)) => {
                        // Already logged with full context by the codec
                        debug!(connection_id = connection.id(), error = %e, "Dropped undecodable packet");
                    }
                    Err(e) if kind.preserves_message_boundaries() => {
                        warn!(connection_id = connection.id(), error = %e, "Dropped corrupt frame");
                        break;
                    }
                    Err(e) => {
                        warn!(
                            connection_id = connection.id(),
                            error = %e,
                            "Corrupt frame on stream transport, closing connection"
                        );
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Complete a waiting request or dispatch the packet
    pub async fn route(&self, connection: &Arc<Connection>, packet: Packet) -> Option<DispatchOutcome> {
        let packet = match connection.complete_request(packet) {
            Some(packet) => packet,
            None => {
                trace!(connection_id = connection.id(), "Reply delivered to waiting request");
                return None;
            }
        };

        let outcome = self
            .state
            .dispatcher
            .dispatch(&self.state.handler_context, connection, packet)
            .await;
        // Failures were already reported by the dispatcher
        trace!(connection_id = connection.id(), handled = outcome.is_handled(), "Packet dispatched");
        Some(outcome)
    }
}

/// Drain the outbound queue into the transport, in order
async fn run_writer(connection: Arc<Connection>, mut queue: OutboundQueue, mut writer: TransportWriter) {
    loop {
        let item = tokio::select! {
            biased;
            item = queue.recv() => item,
            _ = connection.closed() => None,
        };
        let Some(item) = item else {
            break;
        };
        if let Err(e) = write_outbound(&mut writer, item).await {
            debug!(connection_id = connection.id(), error = %e, "Write failed");
            connection.close();
            break;
        }
    }

    // Flush whatever was queued before the close
    while let Some(item) = queue.try_recv() {
        if write_outbound(&mut writer, item).await.is_err() {
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        trace!(connection_id = connection.id(), error = %e, "Error during transport shutdown");
    }
}

async fn write_outbound(writer: &mut TransportWriter, item: Outbound) -> Result<()> {
    match item {
        Outbound::Frame(frame) => writer.write_frame(&frame).await,
        Outbound::KeepAlive(frame) => writer.write_keep_alive(&frame).await,
    }
}
