//! Centralized configuration for the multiplexer and its IPC transport.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// IPC transport limits and timeouts.
pub struct IpcConfig;

impl IpcConfig {
    pub const JSONRPC_VERSION: &'static str = "2.0";
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const MAX_CONNECTIONS: usize = 32;
}

/// Port and operation names used by the default GUI wiring.
pub struct PortConfig;

impl PortConfig {
    /// Fire-and-forget call port forwarded to [`Self::HANDLE_MESSAGE`].
    pub const SEND_CALL: &'static str = "sendCall";
    /// Sink receiving unsolicited executor messages.
    pub const RECEIVE_RESPONSE: &'static str = "receiveResponse";
    pub const HANDLE_MESSAGE: &'static str = "handle_message";
    pub const RECEIVE_RESPONSE_OP: &'static str = "receive_response";
}

/// Per-binding dispatch limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct MultiplexerConfig {
    /// Maximum number of executor calls in flight at once.
    ///
    /// `None` keeps dispatch unbounded. With `Some(n)` the subscriber stops
    /// admitting new calls until one of the `n` outstanding calls resolves.
    pub max_in_flight: Option<usize>,
}

impl MultiplexerConfig {
    pub fn bounded(max_in_flight: usize) -> Self {
        Self {
            max_in_flight: Some(max_in_flight.max(1)),
        }
    }
}
