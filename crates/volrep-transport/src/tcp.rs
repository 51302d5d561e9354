//! Sidecar link: one TCP stream carrying length-prefixed frames in both directions.
//!
//! The controller dials each storage-driver sidecar once and multiplexes every volume's
//! calls over that stream, so reads and writes are guarded separately and a frame is
//! always written whole. Socket failures are folded into the connection-level
//! [`TransportError`] variants the channel registry keys its health decisions on.

use std::io::ErrorKind;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::protocol::{Frame, FrameHeader, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Socket settings for sidecar links.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Bound on dialing a sidecar, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Send small frames immediately (TCP_NODELAY).
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            nodelay: true,
        }
    }
}

/// Dials and accepts sidecar links.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Creates a transport with the given socket settings.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    /// Dials the sidecar at `addr`, bounded by the connect timeout.
    pub async fn connect(&self, addr: &str) -> Result<TcpConnection> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(connected) => connected.map_err(|e| socket_error(addr, e))?,
            Err(_) => {
                return Err(TransportError::ConnectionTimeout {
                    addr: addr.to_string(),
                    timeout_ms: self.config.connect_timeout_ms,
                })
            }
        };
        debug!(addr, "sidecar link up");
        self.link(stream)
    }

    /// Binds a sidecar listener.
    pub async fn listen(&self, addr: &str) -> Result<TcpListener> {
        Ok(TcpListener::bind(addr).await?)
    }

    /// Accepts the next controller link on `listener`.
    pub async fn accept(&self, listener: &TcpListener) -> Result<TcpConnection> {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "controller link accepted");
        self.link(stream)
    }

    fn link(&self, stream: TcpStream) -> Result<TcpConnection> {
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        let peer_addr = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        let (read, write) = stream.into_split();
        Ok(TcpConnection {
            read: Mutex::new(read),
            write: Mutex::new(write),
            peer_addr,
        })
    }
}

/// Maps socket errors onto transport errors. A peer going away mid-frame is a reset.
fn socket_error(addr: &str, e: std::io::Error) -> TransportError {
    match e.kind() {
        ErrorKind::ConnectionRefused => TransportError::ConnectionRefused {
            addr: addr.to_string(),
        },
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
            TransportError::ConnectionReset
        }
        _ => TransportError::IoError(e),
    }
}

/// An established sidecar link. Safe to share between a sender and a reader task.
pub struct TcpConnection {
    read: Mutex<OwnedReadHalf>,
    write: Mutex<OwnedWriteHalf>,
    peer_addr: String,
}

impl TcpConnection {
    /// Writes one whole frame.
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode();
        let mut write = self.write.lock().await;
        write
            .write_all(&encoded)
            .await
            .map_err(|e| socket_error(&self.peer_addr, e))?;
        write.flush().await.map_err(|e| socket_error(&self.peer_addr, e))
    }

    /// Reads the next frame, rejecting oversized payloads before allocating them and
    /// checking the payload checksum.
    pub async fn recv_frame(&self) -> Result<Frame> {
        let mut read = self.read.lock().await;
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        read.read_exact(&mut header_buf)
            .await
            .map_err(|e| socket_error(&self.peer_addr, e))?;
        let header = FrameHeader::decode(&header_buf)?;
        if header.payload_length > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: header.payload_length,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        let mut payload = vec![0u8; header.payload_length as usize];
        read.read_exact(&mut payload)
            .await
            .map_err(|e| socket_error(&self.peer_addr, e))?;
        let frame = Frame { header, payload };
        frame.validate()?;
        Ok(frame)
    }

    /// Address of the other end.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }
}
