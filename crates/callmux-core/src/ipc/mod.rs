//! Loopback IPC transport for executors.
//!
//! Length-prefixed JSON-RPC 2.0 over `127.0.0.1` TCP.
//!
//! # Architecture
//!
//! - **Server**: hosts an [`IpcDispatch`] and answers requests as they complete
//! - **Client**: [`IpcExecutor`], an [`Executor`](crate::Executor) with many calls in flight
//! - **Protocol**: framing and JSON-RPC types shared by both

pub mod client;
pub mod protocol;
pub mod server;

pub use client::IpcExecutor;
pub use protocol::{IpcRequest, IpcResponse};
pub use server::{IpcDispatch, IpcServer, IpcServerHandle};
