//! Callmux Core - ordered asynchronous call multiplexer.
//!
//! A front end issues calls on named ports; each call is dispatched to an
//! [`Executor`] right away, concurrently with earlier calls, and the results
//! come back on the return port strictly in the order the calls were made.
//!
//! # Example
//!
//! ```rust,ignore
//! use callmux_core::{BindingSpec, CallMultiplexer, IpcExecutor, PortRegistry};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> callmux_core::Result<()> {
//!     let mut ports = PortRegistry::new();
//!     let calls = ports.add_source("callAdd")?;
//!     let mut results = ports.add_sink("returnAdd")?;
//!
//!     let executor = Arc::new(IpcExecutor::connect(addr, "receive_response").await?);
//!     let _binding = CallMultiplexer::bind(
//!         &mut ports,
//!         executor,
//!         BindingSpec::new("add", "callAdd", "returnAdd"),
//!     )?;
//!
//!     calls.send(serde_json::json!({"a": 1, "b": 2})).ok();
//!     println!("{:?}", results.recv().await);
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod ipc;
pub mod multiplexer;
pub mod ports;
pub mod relay;
pub mod reorder;

pub use bridge::{Bridge, BridgeHandle, BridgeManifest};
pub use config::{IpcConfig, MultiplexerConfig, PortConfig};
pub use envelope::Envelope;
pub use error::{MuxError, PortKind, Result};
pub use executor::Executor;
pub use ipc::{IpcDispatch, IpcExecutor, IpcServer, IpcServerHandle};
pub use multiplexer::{
    ArgsProjection, BindingHandle, BindingSpec, BindingStats, CallMultiplexer, DeliveryMode,
};
pub use ports::{CallSource, PortRegistry, ResultSink};
pub use relay::{PushRelay, PushRelayHandle};
pub use reorder::{ReorderStats, SequencedReorderBuffer};
