//! Push relay: forwards unsolicited executor messages to a return port.
//!
//! One await is outstanding at a time and each message is sent before the
//! next one is requested, so the port sees messages in the order the executor
//! produced them.

use crate::error::{MuxError, Result};
use crate::executor::Executor;
use crate::ports::ResultSink;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Handle to a running relay loop.
pub struct PushRelayHandle {
    relayed: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl PushRelayHandle {
    /// Number of messages forwarded so far.
    pub fn relayed(&self) -> u64 {
        self.relayed.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop at its next await.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the loop to end.
    ///
    /// Returns the executor error that terminated it, or `Ok(())` after a
    /// shutdown.
    pub async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(MuxError::Other(format!("push relay task failed: {}", e))),
        }
    }
}

/// Starts relay loops.
pub struct PushRelay;

impl PushRelay {
    /// Relay every message from `executor.receive_next()` to `sink`.
    ///
    /// The loop runs until [`PushRelayHandle::shutdown`] or the first
    /// executor error. Must be called from within a tokio runtime.
    pub fn start(executor: Arc<dyn Executor>, sink: ResultSink) -> PushRelayHandle {
        let relayed = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(Self::run(executor, sink, relayed.clone(), shutdown_rx));

        PushRelayHandle {
            relayed,
            shutdown_tx,
            task,
        }
    }

    async fn run(
        executor: Arc<dyn Executor>,
        sink: ResultSink,
        relayed: Arc<AtomicU64>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        info!("Push relay started for {}", sink.name());

        loop {
            let message = tokio::select! {
                Ok(()) = shutdown_rx.changed() => {
                    info!("Push relay for {} shutting down", sink.name());
                    return Ok(());
                }
                message = executor.receive_next() => message,
            };

            match message {
                Ok(message) => {
                    let count = relayed.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!("Relaying push message #{} to {}", count, sink.name());
                    sink.send(message);
                }
                Err(e) => {
                    error!("Push relay for {} stopped: {}", sink.name(), e);
                    return Err(e);
                }
            }
        }
    }
}
