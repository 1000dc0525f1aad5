//! TCP IPC server hosting an executor.
//!
//! Listens on `127.0.0.1:0` (OS-assigned port). Every request on a connection
//! is dispatched in its own task and its response is written as soon as it is
//! ready, so responses leave in completion order, not request order. Clients
//! match them up by request id.

use super::protocol::{read_frame, write_frame, IpcRequest, IpcResponse};
use crate::config::IpcConfig;
use crate::error::{MuxError, Result};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Handle to a running IPC server. Dropping shuts down the server.
pub struct IpcServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl IpcServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and close every open one.
    ///
    /// Requests still being dispatched are abandoned.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for IpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Serves method calls arriving over IPC.
///
/// `dispatch` runs concurrently for requests on the same connection.
#[async_trait::async_trait]
pub trait IpcDispatch: Send + Sync + 'static {
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value>;
}

/// IPC server that listens for executor connections.
pub struct IpcServer;

impl IpcServer {
    /// Start on a random local port.
    pub async fn start<D: IpcDispatch>(dispatch: Arc<D>) -> Result<IpcServerHandle> {
        Self::bind(dispatch, "127.0.0.1:0").await
    }

    /// Start on an explicit address.
    pub async fn bind<D: IpcDispatch>(dispatch: Arc<D>, addr: &str) -> Result<IpcServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        info!("IPC server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            dispatch,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok(IpcServerHandle {
            addr,
            port: addr.port(),
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<D: IpcDispatch>(
        listener: TcpListener,
        dispatch: Arc<D>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("IPC server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            if active_connections.load(Ordering::Relaxed) >= IpcConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting IPC connection from {}: at max capacity ({})",
                                    peer_addr,
                                    IpcConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let dispatch = dispatch.clone();
                            let conns = active_connections.clone();
                            let conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("IPC connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(stream, dispatch, conn_shutdown).await {
                                    debug!("IPC connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("IPC accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection<D: IpcDispatch>(
        stream: TcpStream,
        dispatch: Arc<D>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        let (mut reader, writer) = stream.into_split();
        let writer = Arc::new(Mutex::new(writer));

        // Request tasks stop when this sender is dropped on return.
        let (_closed_tx, closed_rx) = watch::channel(());

        loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => match result? {
                    Some(frame) => frame,
                    None => return Ok(()),
                },
                _ = shutdown_rx.changed() => return Ok(()),
            };

            let dispatch = dispatch.clone();
            let writer = writer.clone();
            let mut closed = closed_rx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    response = Self::process_request(&frame, &*dispatch) => {
                        if let Err(e) = Self::write_response(&writer, &response).await {
                            debug!("Failed to write IPC response: {}", e);
                        }
                    }
                    _ = closed.changed() => {}
                }
            });
        }
    }

    async fn write_response(writer: &Mutex<OwnedWriteHalf>, response: &IpcResponse) -> Result<()> {
        let bytes = serde_json::to_vec(response)?;
        let mut writer = writer.lock().await;
        write_frame(&mut *writer, &bytes).await
    }

    async fn process_request<D: IpcDispatch>(frame: &[u8], dispatch: &D) -> IpcResponse {
        let request: IpcRequest = match serde_json::from_slice(frame) {
            Ok(req) => req,
            Err(e) => return IpcResponse::error(None, -32700, format!("Parse error: {}", e)),
        };

        if request.jsonrpc != IpcConfig::JSONRPC_VERSION {
            return IpcResponse::error(
                request.id,
                -32600,
                "Invalid Request: expected jsonrpc 2.0".to_string(),
            );
        }

        let params = request.params.unwrap_or(Value::Object(Default::default()));

        match dispatch.dispatch(&request.method, params).await {
            Ok(result) => IpcResponse::success(request.id, result),
            Err(e) => {
                debug!("IPC method {} failed: {}", request.method, e);
                let code = e.to_rpc_error_code();
                let message = match e {
                    MuxError::Remote { message, .. } => message,
                    other => other.to_string(),
                };
                IpcResponse::error(request.id, code, message)
            }
        }
    }
}
