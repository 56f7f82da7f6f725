//! Connection wrapper over a duplex byte stream
//!
//! Wraps any bidirectional stream (TCP, TLS, or an in-memory pipe in tests)
//! with a buffered frame reader and a serialized frame writer. Writes take
//! an internal mutex so at most one frame is in flight per connection, and
//! the writer flushes before returning. Per-operation deadlines are applied
//! with [`tokio::time::timeout`] around the whole frame operation.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::error::ProtocolError;
use crate::frame::{decode_header, HEADER_SIZE};
use crate::message::Message;

/// Any bidirectional byte stream usable as a transport
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Boxed transport, so TCP and TLS streams share one connection type
pub type BoxedTransport = Box<dyn Transport>;

/// Read one frame: exactly 8 header bytes, then exactly `length` payload
/// bytes. EOF before a full frame is a closed connection.
async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, ProtocolError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let (kind, payload_len) = decode_header(&header)?;

    let mut payload = vec![0u8; payload_len as usize];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await?;
    }

    Ok(Message {
        kind,
        payload: payload.into(),
    })
}

async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), ProtocolError> {
    writer.write_all(&msg.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// A framed, full-duplex connection with serialized writes
pub struct Connection {
    reader: Mutex<BufReader<ReadHalf<BoxedTransport>>>,
    writer: Mutex<BufWriter<WriteHalf<BoxedTransport>>>,
    closed: AtomicBool,
    peer_addr: Option<SocketAddr>,
}

impl Connection {
    /// Wrap a stream without a known peer address (tests, pipes)
    pub fn new(stream: BoxedTransport) -> Self {
        Self::build(stream, None)
    }

    /// Wrap a network stream with its peer address
    pub fn with_peer_addr(stream: BoxedTransport, peer_addr: SocketAddr) -> Self {
        Self::build(stream, Some(peer_addr))
    }

    fn build(stream: BoxedTransport, peer_addr: Option<SocketAddr>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(BufWriter::new(write_half)),
            closed: AtomicBool::new(false),
            peer_addr,
        }
    }

    /// Remote address, when the transport has one
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Send one frame, flushing before returning
    pub async fn send(&self, msg: &Message) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, msg).await
    }

    /// Send one frame under an absolute deadline
    pub async fn send_with_timeout(
        &self,
        msg: &Message,
        deadline: Duration,
    ) -> Result<(), ProtocolError> {
        match tokio::time::timeout(deadline, self.send(msg)).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::WriteTimeout),
        }
    }

    /// Receive the next frame
    pub async fn receive(&self) -> Result<Message, ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let mut reader = self.reader.lock().await;
        read_message(&mut *reader).await
    }

    /// Receive the next frame under an absolute deadline.
    ///
    /// An expired deadline yields [`ProtocolError::ReadTimeout`]. The read
    /// is abandoned mid-frame in that case, so callers treating the timeout
    /// as transient must only do so on idle connections.
    pub async fn receive_with_timeout(&self, deadline: Duration) -> Result<Message, ProtocolError> {
        match tokio::time::timeout(deadline, self.receive()).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::ReadTimeout),
        }
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the connection. Idempotent; any subsequent send or receive
    /// fails with [`ProtocolError::ConnectionClosed`]. Shuts down the write
    /// half so the peer observes EOF.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}
