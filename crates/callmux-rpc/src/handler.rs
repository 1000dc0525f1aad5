//! Operations served by the host.

use callmux_core::{MuxError, PortConfig, Result};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Extract an optional i64 parameter.
macro_rules! get_i64_param {
    ($params:expr, $name:literal) => {
        $params.get($name).and_then(|v| v.as_i64())
    };
}

/// Extract a required i64 parameter or return an error.
macro_rules! require_i64_param {
    ($params:expr, $name:literal) => {
        match get_i64_param!($params, $name) {
            Some(n) => n,
            None => {
                return Err(MuxError::Validation {
                    field: $name.to_string(),
                    message: format!("Missing required integer parameter: {}", $name),
                });
            }
        }
    };
}

/// Dispatch target of the host's IPC server.
///
/// Messages queued by `notify` and `handle_message` are handed out one per
/// `receive_response` call, oldest first.
pub struct HostDispatch {
    push_tx: mpsc::UnboundedSender<Value>,
    push_rx: Mutex<mpsc::UnboundedReceiver<Value>>,
}

impl HostDispatch {
    pub fn new() -> Self {
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        Self {
            push_tx,
            push_rx: Mutex::new(push_rx),
        }
    }

    fn enqueue(&self, message: Value) -> Result<Value> {
        self.push_tx.send(message).map_err(|_| MuxError::Closed {
            what: "push queue".to_string(),
        })?;
        Ok(json!({"queued": true}))
    }

    async fn next_push(&self) -> Result<Value> {
        // Concurrent receivers are served in the order they took the lock.
        let mut rx = self.push_rx.lock().await;
        rx.recv().await.ok_or_else(|| MuxError::Closed {
            what: "push queue".to_string(),
        })
    }
}

#[async_trait::async_trait]
impl callmux_core::IpcDispatch for HostDispatch {
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value> {
        debug!("Host call: {}({})", method, params);

        match method {
            "ping" => Ok(json!("pong")),

            "echo" => Ok(params),

            "add" => {
                let a = require_i64_param!(params, "a");
                let b = require_i64_param!(params, "b");
                a.checked_add(b).map(|sum| json!(sum)).ok_or_else(|| {
                    MuxError::Validation {
                        field: "b".to_string(),
                        message: format!("{} + {} overflows", a, b),
                    }
                })
            }

            "delay" => {
                let ms = get_i64_param!(params, "ms").unwrap_or(0).max(0) as u64;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(params.get("value").cloned().unwrap_or(Value::Null))
            }

            "fail" => {
                let message = params
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("requested failure");
                Err(MuxError::Executor {
                    operation: "fail".to_string(),
                    message: message.to_string(),
                })
            }

            "notify" => self.enqueue(params.get("message").cloned().unwrap_or(params)),

            m if m == PortConfig::HANDLE_MESSAGE => {
                let call = params.get("call").cloned().unwrap_or(Value::Null);
                self.enqueue(json!({"received": call}))
            }

            m if m == PortConfig::RECEIVE_RESPONSE_OP => self.next_push().await,

            _ => {
                warn!("Unknown method: {}", method);
                Err(MuxError::Remote {
                    code: -32601,
                    message: format!("Method not found: {}", method),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callmux_core::IpcDispatch;

    #[tokio::test]
    async fn test_basic_operations() {
        let host = HostDispatch::new();

        assert_eq!(host.dispatch("ping", json!({})).await.unwrap(), json!("pong"));
        assert_eq!(
            host.dispatch("echo", json!({"x": 1})).await.unwrap(),
            json!({"x": 1})
        );
        assert_eq!(
            host.dispatch("add", json!({"a": 2, "b": 40})).await.unwrap(),
            json!(42)
        );
    }

    #[tokio::test]
    async fn test_add_requires_integers() {
        let host = HostDispatch::new();
        let err = host.dispatch("add", json!({"a": 1})).await.unwrap_err();
        assert!(matches!(err, MuxError::Validation { ref field, .. } if field == "b"));
        assert_eq!(err.to_rpc_error_code(), -32602);
    }

    #[tokio::test]
    async fn test_fail_and_unknown_method() {
        let host = HostDispatch::new();

        let err = host
            .dispatch("fail", json!({"message": "disk full"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));

        match host.dispatch("nope", json!({})).await.unwrap_err() {
            MuxError::Remote { code, .. } => assert_eq!(code, -32601),
            other => panic!("Expected Remote, got: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_returns_value() {
        let host = HostDispatch::new();
        let value = host
            .dispatch("delay", json!({"ms": 500, "value": "late"}))
            .await
            .unwrap();
        assert_eq!(value, json!("late"));
    }

    #[tokio::test]
    async fn test_push_queue_is_fifo() {
        let host = HostDispatch::new();

        host.dispatch("notify", json!({"message": "first"}))
            .await
            .unwrap();
        host.dispatch(PortConfig::HANDLE_MESSAGE, json!({"call": {"op": "send"}}))
            .await
            .unwrap();

        assert_eq!(
            host.dispatch(PortConfig::RECEIVE_RESPONSE_OP, json!({}))
                .await
                .unwrap(),
            json!("first")
        );
        assert_eq!(
            host.dispatch(PortConfig::RECEIVE_RESPONSE_OP, json!({}))
                .await
                .unwrap(),
            json!({"received": {"op": "send"}})
        );
    }
}
