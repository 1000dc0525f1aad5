//! TCP executor: invokes operations on an [`IpcServer`](super::IpcServer).
//!
//! Requests share one connection. Each call registers a oneshot under its
//! request id, writes its frame and waits; a single reader task routes every
//! response frame to the matching call, so any number of calls can be
//! outstanding and they may resolve in any order.
//!
//! When the connection drops, every outstanding and future call fails with
//! [`MuxError::ConnectionLost`].

use super::protocol::{read_frame, write_frame, IpcRequest, IpcResponse};
use crate::config::IpcConfig;
use crate::error::{MuxError, Result};
use crate::executor::Executor;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Calls waiting for a response. `None` once the connection is gone.
type PendingCalls = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<IpcResponse>>>>>;

/// [`Executor`] backed by a framed JSON-RPC connection.
#[derive(Debug)]
pub struct IpcExecutor {
    addr: SocketAddr,
    push_operation: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: PendingCalls,
    next_id: AtomicU64,
    reader_task: JoinHandle<()>,
}

impl IpcExecutor {
    /// Connect to a server.
    ///
    /// `push_operation` is the method invoked by
    /// [`receive_next`](Executor::receive_next) to wait for the next
    /// unsolicited message.
    pub async fn connect(addr: SocketAddr, push_operation: impl Into<String>) -> Result<Self> {
        let stream = tokio::time::timeout(IpcConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| MuxError::Timeout(IpcConfig::CONNECT_TIMEOUT))?
            .map_err(|_| MuxError::ConnectionLost { addr })?;
        stream.set_nodelay(true)?;

        debug!("IPC executor connected to {}", addr);

        let (reader, writer) = stream.into_split();
        let pending: PendingCalls = Arc::new(Mutex::new(Some(HashMap::new())));
        let reader_task = tokio::spawn(Self::reader_loop(reader, pending.clone(), addr));

        Ok(Self {
            addr,
            push_operation: push_operation.into(),
            writer: tokio::sync::Mutex::new(writer),
            pending,
            next_id: AtomicU64::new(1),
            reader_task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Calls currently waiting for a response.
    pub fn outstanding(&self) -> usize {
        self.pending
            .lock()
            .expect("pending calls lock poisoned")
            .as_ref()
            .map_or(0, HashMap::len)
    }

    /// Call a JSON-RPC method and wait for its result.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request_bytes = serde_json::to_vec(&IpcRequest::new(method, params, id))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending calls lock poisoned");
            match pending.as_mut() {
                Some(calls) => {
                    calls.insert(id, tx);
                }
                None => return Err(MuxError::ConnectionLost { addr: self.addr }),
            }
        }

        let written = {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &request_bytes).await
        };
        if let Err(e) = written {
            debug!("IPC write to {} failed: {}", self.addr, e);
            self.forget(id);
            return Err(MuxError::ConnectionLost { addr: self.addr });
        }

        let response = rx
            .await
            .map_err(|_| MuxError::ConnectionLost { addr: self.addr })?;
        response.into_result()
    }

    fn forget(&self, id: u64) {
        let mut pending = self.pending.lock().expect("pending calls lock poisoned");
        if let Some(calls) = pending.as_mut() {
            calls.remove(&id);
        }
    }

    async fn reader_loop(mut reader: OwnedReadHalf, pending: PendingCalls, addr: SocketAddr) {
        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("IPC server {} closed the connection", addr);
                    break;
                }
                Err(e) => {
                    warn!("IPC read from {} failed: {}", addr, e);
                    break;
                }
            };

            let response: IpcResponse = match serde_json::from_slice(&frame) {
                Ok(response) => response,
                Err(e) => {
                    warn!("Discarding unparseable IPC response from {}: {}", addr, e);
                    continue;
                }
            };

            let Some(id) = response.numeric_id() else {
                warn!("Discarding IPC response without id from {}", addr);
                continue;
            };

            let waiter = pending
                .lock()
                .expect("pending calls lock poisoned")
                .as_mut()
                .and_then(|calls| calls.remove(&id));
            match waiter {
                // The caller may have gone away; nothing to do then.
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => warn!("IPC response {} from {} matches no call", id, addr),
            }
        }

        // Dropping the senders fails every outstanding call.
        pending.lock().expect("pending calls lock poisoned").take();
    }
}

impl Drop for IpcExecutor {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[async_trait::async_trait]
impl Executor for IpcExecutor {
    async fn invoke(&self, operation: &str, args: Value) -> Result<Value> {
        self.call(operation, args).await
    }

    async fn receive_next(&self) -> Result<Value> {
        self.call(&self.push_operation, json!({})).await
    }
}
