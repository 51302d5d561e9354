//! RPC layer providing request/response semantics over TCP connections.
//!
//! A single [`RpcClient`] multiplexes any number of concurrent calls over one
//! connection: each call registers a oneshot under its request id and a background
//! reader task routes responses back.

use crate::error::{Result, TransportError};
use crate::protocol::{Frame, Opcode};
use crate::tcp::{TcpConnection, TcpTransport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

/// Configuration for RPC client.
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// Response timeout in milliseconds (default: 30000).
    pub response_timeout_ms: u64,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 30_000,
        }
    }
}

/// Trait for handling incoming RPC requests.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Handle a request and return the response payload bytes.
    async fn handle(&self, opcode: Opcode, payload: Vec<u8>) -> Result<Vec<u8>>;
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Frame>>>>;

/// RPC client for sending requests and receiving responses.
pub struct RpcClient {
    conn: Arc<TcpConnection>,
    config: RpcClientConfig,
    next_id: AtomicU64,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl RpcClient {
    /// Create a new RPC client. Starts a background reader task.
    pub fn new(conn: Arc<TcpConnection>, config: RpcClientConfig) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let reader_conn = conn.clone();
        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        let handle = tokio::spawn(async move {
            loop {
                match reader_conn.recv_frame().await {
                    Ok(frame) => {
                        let request_id = frame.request_id();
                        let mut map = reader_pending.lock().await;
                        if let Some(tx) = map.remove(&request_id) {
                            let _ = tx.send(frame);
                        } else {
                            debug!(request_id, "dropping response for abandoned request");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, peer = reader_conn.peer_addr(), "RPC reader error, closing channel");
                        reader_closed.store(true, Ordering::SeqCst);
                        // Dropping the senders wakes every waiter with ConnectionReset.
                        reader_pending.lock().await.clear();
                        break;
                    }
                }
            }
        });
        Self {
            conn,
            config,
            next_id: AtomicU64::new(1),
            pending,
            closed,
            reader_handle: handle,
        }
    }

    /// Send a request and wait for the response within the configured timeout.
    pub async fn call(&self, opcode: Opcode, payload: Vec<u8>) -> Result<Frame> {
        let deadline = Duration::from_millis(self.config.response_timeout_ms);
        self.call_with_deadline(opcode, payload, deadline).await
    }

    /// Send a request and wait at most `deadline` for the response.
    pub async fn call_with_deadline(
        &self,
        opcode: Opcode,
        payload: Vec<u8>,
        deadline: Duration,
    ) -> Result<Frame> {
        if self.is_closed() {
            return Err(TransportError::NotConnected);
        }
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::new(opcode, request_id, payload);
        let (tx, rx) = oneshot::channel();
        {
            let mut map = self.pending.lock().await;
            map.insert(request_id, tx);
        }
        if let Err(e) = self.conn.send_frame(&frame).await {
            self.pending.lock().await.remove(&request_id);
            self.closed.store(true, Ordering::SeqCst);
            return Err(e);
        }
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::ConnectionReset),
            Err(_) => {
                let mut map = self.pending.lock().await;
                map.remove(&request_id);
                Err(TransportError::RequestTimeout {
                    request_id,
                    timeout_ms: deadline.as_millis() as u64,
                })
            }
        }
    }

    /// True once the reader task observed the connection going away.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of calls currently awaiting a response.
    pub async fn in_flight(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Remote address of the underlying connection.
    pub fn peer_addr(&self) -> &str {
        self.conn.peer_addr()
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// RPC server that dispatches requests to a handler.
pub struct RpcServer;

impl RpcServer {
    /// Run the server accept loop. Spawns a task per connection and a task per
    /// request so slow operations on one volume do not stall the others.
    pub async fn serve(
        transport: &TcpTransport,
        listener: tokio::net::TcpListener,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<()> {
        loop {
            let conn = Arc::new(transport.accept(&listener).await?);
            debug!(peer = conn.peer_addr(), "Accepted connection");
            let handler = handler.clone();
            tokio::spawn(async move {
                loop {
                    let frame = match conn.recv_frame().await {
                        Ok(f) => f,
                        Err(e) => {
                            debug!(error = %e, "Connection closed");
                            break;
                        }
                    };
                    let handler = handler.clone();
                    let conn = conn.clone();
                    tokio::spawn(async move {
                        match handler.handle(frame.opcode(), frame.payload.clone()).await {
                            Ok(response_payload) => {
                                let response = frame.make_response(response_payload);
                                if let Err(e) = conn.send_frame(&response).await {
                                    warn!(error = %e, "Failed to send response");
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, opcode = ?frame.opcode(), "Handler error");
                            }
                        }
                    });
                }
            });
        }
    }
}
