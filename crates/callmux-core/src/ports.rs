//! Named in-process ports connecting a front end to bindings.
//!
//! A call port carries values from the front end into exactly one subscriber.
//! A return port carries values out through a synchronous `send`. Both are
//! unbounded tokio channels, so neither side ever waits on the other.

use crate::error::{MuxError, PortKind, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Table of named call ports and return ports.
#[derive(Debug, Default)]
pub struct PortRegistry {
    sources: HashMap<String, Option<mpsc::UnboundedReceiver<Value>>>,
    sinks: HashMap<String, mpsc::UnboundedSender<Value>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call port. The returned sender is the front end's end of it.
    pub fn add_source(&mut self, name: impl Into<String>) -> Result<mpsc::UnboundedSender<Value>> {
        let name = name.into();
        if self.sources.contains_key(&name) {
            return Err(MuxError::DuplicatePort {
                kind: PortKind::Source,
                name,
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        debug!("Registered call port {}", name);
        self.sources.insert(name, Some(rx));
        Ok(tx)
    }

    /// Register a return port. The returned receiver is the front end's end of it.
    pub fn add_sink(&mut self, name: impl Into<String>) -> Result<mpsc::UnboundedReceiver<Value>> {
        let name = name.into();
        if self.sinks.contains_key(&name) {
            return Err(MuxError::DuplicatePort {
                kind: PortKind::Sink,
                name,
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        debug!("Registered return port {}", name);
        self.sinks.insert(name, tx);
        Ok(rx)
    }

    pub fn has_source(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    pub fn has_sink(&self, name: &str) -> bool {
        self.sinks.contains_key(name)
    }

    /// True once [`subscribe`](Self::subscribe) has taken the call port.
    pub fn is_subscribed(&self, name: &str) -> bool {
        matches!(self.sources.get(name), Some(None))
    }

    /// Fail unless a port of `kind` called `name` exists.
    pub fn require(&self, kind: PortKind, name: &str) -> Result<()> {
        let present = match kind {
            PortKind::Source => self.has_source(name),
            PortKind::Sink => self.has_sink(name),
        };
        if present {
            Ok(())
        } else {
            Err(MuxError::missing(kind, name))
        }
    }

    /// Take the single subscription to a call port.
    pub fn subscribe(&mut self, name: &str) -> Result<CallSource> {
        let slot = self
            .sources
            .get_mut(name)
            .ok_or_else(|| MuxError::missing(PortKind::Source, name))?;
        let rx = slot.take().ok_or_else(|| MuxError::PortAlreadySubscribed {
            name: name.to_string(),
        })?;
        Ok(CallSource {
            name: Arc::from(name),
            rx,
        })
    }

    /// Get a sending handle to a return port. Any number may exist.
    pub fn sink(&self, name: &str) -> Result<ResultSink> {
        let tx = self
            .sinks
            .get(name)
            .ok_or_else(|| MuxError::missing(PortKind::Sink, name))?;
        Ok(ResultSink {
            name: Arc::from(name),
            tx: tx.clone(),
        })
    }
}

/// Subscribed end of a call port. Values arrive in the order they were sent.
#[derive(Debug)]
pub struct CallSource {
    name: Arc<str>,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl CallSource {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next call value, or `None` once every front-end sender is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

/// Sending end of a return port.
#[derive(Debug, Clone)]
pub struct ResultSink {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Value>,
}

impl ResultSink {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deliver one value. Never blocks.
    ///
    /// Returns `false` if the front end dropped its receiver; the value is
    /// discarded in that case.
    pub fn send(&self, value: Value) -> bool {
        match self.tx.send(value) {
            Ok(()) => true,
            Err(_) => {
                warn!("Return port {} has no receiver, dropping value", self.name);
                false
            }
        }
    }
}
