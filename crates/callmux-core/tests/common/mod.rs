//! Shared test fixtures: an executor whose calls resolve only when the test
//! says so.

#![allow(dead_code)]

use callmux_core::{Executor, MuxError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Executor driven by the test.
///
/// Every `invoke` parks until [`resolve`](Self::resolve) is called with the
/// `"id"` field of its arguments. Push messages are queued with
/// [`push`](Self::push) and each one is delivered after its own delay.
pub struct ScriptedExecutor {
    waiting: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    invoked: Mutex<Vec<(String, Value)>>,
    push_tx: mpsc::UnboundedSender<(Duration, Result<Value>)>,
    push_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Duration, Result<Value>)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        Self {
            waiting: Mutex::new(HashMap::new()),
            invoked: Mutex::new(Vec::new()),
            push_tx,
            push_rx: tokio::sync::Mutex::new(push_rx),
        }
    }

    /// Number of `invoke` calls seen so far.
    pub fn invoked_count(&self) -> usize {
        self.invoked.lock().unwrap().len()
    }

    pub fn invoked(&self) -> Vec<(String, Value)> {
        self.invoked.lock().unwrap().clone()
    }

    /// Wait until at least `n` calls have reached the executor.
    pub async fn wait_for_calls(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.invoked_count() < n {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {} calls, saw {}", n, self.invoked_count()));
    }

    /// Complete the parked call whose arguments carry `"id": id`.
    pub fn resolve(&self, id: u64, outcome: Result<Value>) {
        let tx = self
            .waiting
            .lock()
            .unwrap()
            .remove(&id)
            .unwrap_or_else(|| panic!("no parked call with id {}", id));
        let _ = tx.send(outcome);
    }

    pub fn push(&self, delay: Duration, message: Result<Value>) {
        self.push_tx.send((delay, message)).unwrap();
    }
}

#[async_trait::async_trait]
impl Executor for ScriptedExecutor {
    async fn invoke(&self, operation: &str, args: Value) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let id = args["id"].as_u64().expect("scripted call needs an id");
        self.waiting.lock().unwrap().insert(id, tx);
        self.invoked
            .lock()
            .unwrap()
            .push((operation.to_string(), args));

        rx.await.unwrap_or_else(|_| Err(MuxError::Other("script dropped".into())))
    }

    async fn receive_next(&self) -> Result<Value> {
        let next = self.push_rx.lock().await.recv().await;
        match next {
            Some((delay, message)) => {
                tokio::time::sleep(delay).await;
                message
            }
            None => Err(MuxError::Closed {
                what: "push queue".into(),
            }),
        }
    }
}

pub fn failure(message: &str) -> MuxError {
    MuxError::Executor {
        operation: "scripted".into(),
        message: message.into(),
    }
}

/// Receive exactly `n` values or panic after a generous timeout.
pub async fn recv_n(rx: &mut mpsc::UnboundedReceiver<Value>, n: usize) -> Vec<Value> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let value = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a result")
            .expect("return port closed");
        out.push(value);
    }
    out
}

/// Assert nothing arrives within `window`.
pub async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<Value>, window: Duration) {
    if let Ok(value) = tokio::time::timeout(window, rx.recv()).await {
        panic!("expected no result, got {:?}", value);
    }
}
