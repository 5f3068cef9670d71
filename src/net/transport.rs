//! Transport abstraction module
//!
//! Splits a raw TCP stream or an upgraded WebSocket into a reader half and a
//! writer half with the same interface, so the connection loop does not care
//! which one carries the protocol.
//!
//! TCP is a byte stream: frames may be split or coalesced across reads.
//! WebSocket preserves message boundaries.

use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

use crate::error::{NetworkError, Result, SyncError};

/// Read buffer size (64KB)
const READ_BUFFER_SIZE: usize = 65536;

type WsSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;

/// Which transport carries a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    WebSocket,
}

impl TransportKind {
    /// Whether each read yields exactly the bytes the peer sent in one message
    pub fn preserves_message_boundaries(&self) -> bool {
        matches!(self, TransportKind::WebSocket)
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::WebSocket => write!(f, "websocket"),
        }
    }
}

enum ReaderInner {
    Stream(Box<dyn AsyncRead + Send + Unpin>),
    WebSocket(BoxStream<'static, std::result::Result<Message, tungstenite::Error>>),
}

enum WriterInner {
    Stream(Box<dyn AsyncWrite + Send + Unpin>),
    WebSocket(WsSink),
}

/// Inbound half of a transport
pub struct TransportReader {
    kind: TransportKind,
    inner: ReaderInner,
    read_buf: BytesMut,
}

/// Outbound half of a transport
pub struct TransportWriter {
    kind: TransportKind,
    inner: WriterInner,
}

/// Split a byte stream (TCP, or any in-memory duplex) into halves
pub fn split_stream<S>(stream: S) -> (TransportReader, TransportWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    (
        TransportReader {
            kind: TransportKind::Tcp,
            inner: ReaderInner::Stream(Box::new(reader)),
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
        },
        TransportWriter {
            kind: TransportKind::Tcp,
            inner: WriterInner::Stream(Box::new(writer)),
        },
    )
}

/// Split an upgraded WebSocket into halves
pub fn split_websocket<S>(ws: WebSocketStream<S>) -> (TransportReader, TransportWriter)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    (
        TransportReader {
            kind: TransportKind::WebSocket,
            inner: ReaderInner::WebSocket(stream.boxed()),
            read_buf: BytesMut::new(),
        },
        TransportWriter {
            kind: TransportKind::WebSocket,
            inner: WriterInner::WebSocket(Box::pin(sink)),
        },
    )
}

impl TransportReader {
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Read the next chunk of inbound bytes; `None` once the peer closed
    ///
    /// An empty chunk means the peer sent WebSocket control traffic: it
    /// carries no protocol bytes but still counts as activity.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match &mut self.inner {
            ReaderInner::Stream(stream) => {
                // Reclaims the previous chunk's allocation once the caller dropped it
                self.read_buf.reserve(READ_BUFFER_SIZE);
                let n = stream
                    .read_buf(&mut self.read_buf)
                    .await
                    .map_err(|e| SyncError::Network(NetworkError::ReadError(e.to_string())))?;
                if n == 0 {
                    return Ok(None);
                }
                Ok(Some(self.read_buf.split().freeze()))
            }
            ReaderInner::WebSocket(stream) => loop {
                match stream.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        trace!(len = data.len(), "Received binary WebSocket message");
                        return Ok(Some(Bytes::from(data)));
                    }
                    Some(Ok(Message::Text(text))) => {
                        trace!(len = text.len(), "Received text WebSocket message");
                        return Ok(Some(Bytes::from(text.into_bytes())));
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("WebSocket close message received");
                        return Ok(None);
                    }
                    // Pongs to pings are queued by tungstenite and flushed with the next write
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        trace!("Received WebSocket control frame");
                        return Ok(Some(Bytes::new()));
                    }
                    Some(Ok(Message::Frame(_))) => continue,
                    Some(Err(tungstenite::Error::ConnectionClosed)) | None => return Ok(None),
                    Some(Err(e)) => {
                        return Err(SyncError::Network(NetworkError::WebSocket(e.to_string())));
                    }
                }
            },
        }
    }
}

impl TransportWriter {
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Write one complete frame
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        match &mut self.inner {
            WriterInner::Stream(stream) => write_stream(stream.as_mut(), frame).await,
            WriterInner::WebSocket(sink) => sink
                .send(Message::Binary(frame.to_vec()))
                .await
                .map_err(|e| SyncError::Network(NetworkError::WebSocket(e.to_string()))),
        }
    }

    /// Send a liveness check
    ///
    /// WebSocket peers get a Ping control frame; stream peers get `fallback_frame`.
    pub async fn write_keep_alive(&mut self, fallback_frame: &[u8]) -> Result<()> {
        match &mut self.inner {
            WriterInner::Stream(stream) => write_stream(stream.as_mut(), fallback_frame).await,
            WriterInner::WebSocket(sink) => sink
                .send(Message::Ping(Vec::new()))
                .await
                .map_err(|e| SyncError::Network(NetworkError::WebSocket(e.to_string()))),
        }
    }

    /// Shut the outbound half down
    pub async fn shutdown(&mut self) -> Result<()> {
        match &mut self.inner {
            WriterInner::Stream(stream) => stream
                .shutdown()
                .await
                .map_err(|e| SyncError::Network(NetworkError::WriteError(e.to_string()))),
            WriterInner::WebSocket(sink) => match sink.close().await {
                Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
                Err(e) => Err(SyncError::Network(NetworkError::WebSocket(e.to_string()))),
            },
        }
    }
}

async fn write_stream(stream: &mut (dyn AsyncWrite + Send + Unpin), frame: &[u8]) -> Result<()> {
    stream
        .write_all(frame)
        .await
        .map_err(|e| SyncError::Network(NetworkError::WriteError(e.to_string())))?;
    stream
        .flush()
        .await
        .map_err(|e| SyncError::Network(NetworkError::WriteError(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_transport_kind() {
        assert!(TransportKind::WebSocket.preserves_message_boundaries());
        assert!(!TransportKind::Tcp.preserves_message_boundaries());
        assert_eq!(TransportKind::Tcp.to_string(), "tcp");
    }

    #[tokio::test]
    async fn test_stream_halves() {
        let (client, server) = tokio::io::duplex(1024);
        let (mut server_reader, mut server_writer) = split_stream(server);
        let (mut client_reader, mut client_writer) = split_stream(client);

        client_writer.write_frame(b"hello").await.unwrap();
        assert_eq!(server_reader.next_chunk().await.unwrap().unwrap(), Bytes::from_static(b"hello"));

        server_writer.write_keep_alive(b"ka").await.unwrap();
        assert_eq!(client_reader.next_chunk().await.unwrap().unwrap(), Bytes::from_static(b"ka"));

        client_writer.shutdown().await.unwrap();
        assert_eq!(server_reader.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stream_reader_keeps_partial_reads() {
        let mock = tokio_test::io::Builder::new()
            .read(b"\x04pi")
            .read(b"ng")
            .write(b"pong")
            .build();
        let (mut reader, mut writer) = split_stream(mock);

        // Stream chunks carry no frame boundaries
        assert_eq!(reader.next_chunk().await.unwrap().unwrap(), Bytes::from_static(b"\x04pi"));
        assert!(reader.read_buf.is_empty());
        assert_eq!(reader.next_chunk().await.unwrap().unwrap(), Bytes::from_static(b"ng"));
        assert!(reader.read_buf.capacity() >= READ_BUFFER_SIZE - 2);
        writer.write_frame(b"pong").await.unwrap();
    }

    #[tokio::test]
    async fn test_websocket_halves() {
        let (client, server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move { tokio_tungstenite::accept_async(server).await.unwrap() });
        let (client_ws, _) = tokio_tungstenite::client_async("ws://localhost/", client).await.unwrap();
        let server_ws = server_task.await.unwrap();

        let (mut server_reader, _server_writer) = split_websocket(server_ws);
        let (_client_reader, mut client_writer) = split_websocket(client_ws);
        assert_eq!(server_reader.kind(), TransportKind::WebSocket);

        client_writer.write_frame(&[1, 2, 3]).await.unwrap();
        client_writer.write_keep_alive(&[]).await.unwrap();
        client_writer.write_frame(&[4]).await.unwrap();

        // The ping surfaces as an empty chunk; message boundaries survive
        assert_eq!(server_reader.next_chunk().await.unwrap().unwrap(), Bytes::from_static(&[1, 2, 3]));
        assert_eq!(server_reader.next_chunk().await.unwrap().unwrap(), Bytes::new());
        assert_eq!(server_reader.next_chunk().await.unwrap().unwrap(), Bytes::from_static(&[4]));
    }
}
