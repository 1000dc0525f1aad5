//! Bridge wiring: every binding, forward route and push relay of a front end
//! started from one manifest.
//!
//! The manifest is validated against the port table as a whole before
//! anything is subscribed, so a bad manifest leaves every port untouched.
//!
//! ```json
//! {
//!   "bindings": [
//!     {"operation": "open_file_dialog", "call_port": "callOpenFileDialog",
//!      "return_port": "returnOpenFileDialog", "args": {"wrap": "save"}}
//!   ],
//!   "routes": [
//!     {"operation": "handle_message", "call_port": "sendCall", "args": {"wrap": "call"}}
//!   ],
//!   "push": {"sink": "receiveResponse"}
//! }
//! ```

use crate::config::{MultiplexerConfig, PortConfig};
use crate::error::{MuxError, PortKind, Result};
use crate::executor::Executor;
use crate::multiplexer::{
    ArgsProjection, BindingHandle, BindingSpec, BindingStats, CallMultiplexer, DeliveryMode,
};
use crate::ports::{CallSource, PortRegistry};
use crate::relay::{PushRelay, PushRelayHandle};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Serializable form of [`ArgsProjection`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgsShape {
    #[default]
    Identity,
    Wrap(String),
}

impl From<&ArgsShape> for ArgsProjection {
    fn from(shape: &ArgsShape) -> Self {
        match shape {
            ArgsShape::Identity => ArgsProjection::Identity,
            ArgsShape::Wrap(key) => ArgsProjection::wrap(key.clone()),
        }
    }
}

/// One operation whose results are delivered in call order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingEntry {
    pub operation: String,
    pub call_port: String,
    pub return_port: String,
    #[serde(default)]
    pub fallible: bool,
    #[serde(default)]
    pub args: ArgsShape,
}

/// One operation invoked for every call value, with its result discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub operation: String,
    pub call_port: String,
    #[serde(default)]
    pub args: ArgsShape,
}

/// Where unsolicited executor messages go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEntry {
    pub sink: String,
}

/// Complete wiring of a front end to one executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeManifest {
    pub bindings: Vec<BindingEntry>,
    pub routes: Vec<RouteEntry>,
    pub push: Option<PushEntry>,
    /// Applied to every binding.
    pub multiplexer: MultiplexerConfig,
}

impl BridgeManifest {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Wiring of the file-transfer GUI: a file dialog binding, the message
    /// route and the response relay.
    pub fn gui_default() -> Self {
        Self {
            bindings: vec![BindingEntry {
                operation: "open_file_dialog".to_string(),
                call_port: "callOpenFileDialog".to_string(),
                return_port: "returnOpenFileDialog".to_string(),
                fallible: false,
                args: ArgsShape::Wrap("save".to_string()),
            }],
            routes: vec![RouteEntry {
                operation: PortConfig::HANDLE_MESSAGE.to_string(),
                call_port: PortConfig::SEND_CALL.to_string(),
                args: ArgsShape::Wrap("call".to_string()),
            }],
            push: Some(PushEntry {
                sink: PortConfig::RECEIVE_RESPONSE.to_string(),
            }),
            multiplexer: MultiplexerConfig::default(),
        }
    }

    /// Check every port the manifest names against `ports`.
    pub fn validate(&self, ports: &PortRegistry) -> Result<()> {
        let mut call_ports = HashSet::new();
        let bound = self
            .bindings
            .iter()
            .map(|b| b.call_port.as_str())
            .chain(self.routes.iter().map(|r| r.call_port.as_str()));

        for name in bound {
            ports.require(PortKind::Source, name)?;
            if !call_ports.insert(name) || ports.is_subscribed(name) {
                return Err(MuxError::PortAlreadySubscribed {
                    name: name.to_string(),
                });
            }
        }

        for binding in &self.bindings {
            ports.require(PortKind::Sink, &binding.return_port)?;
        }

        if let Some(push) = &self.push {
            ports.require(PortKind::Sink, &push.sink)?;
        }

        Ok(())
    }

    fn binding_specs(&self) -> impl Iterator<Item = BindingSpec> + '_ {
        self.bindings.iter().map(|entry| {
            let mode = if entry.fallible {
                DeliveryMode::Fallible
            } else {
                DeliveryMode::Direct
            };
            BindingSpec::new(&entry.operation, &entry.call_port, &entry.return_port)
                .with_args((&entry.args).into())
                .with_mode(mode)
                .with_config(self.multiplexer)
        })
    }
}

/// Handle to everything a bridge started.
pub struct BridgeHandle {
    bindings: Vec<BindingHandle>,
    routes: Vec<JoinHandle<()>>,
    relay: Option<PushRelayHandle>,
    shutdown_tx: watch::Sender<bool>,
}

impl BridgeHandle {
    pub fn bindings(&self) -> &[BindingHandle] {
        &self.bindings
    }

    pub fn binding(&self, operation: &str) -> Option<&BindingHandle> {
        self.bindings.iter().find(|b| b.operation() == operation)
    }

    pub fn stats(&self) -> Vec<BindingStats> {
        self.bindings.iter().map(BindingHandle::stats).collect()
    }

    pub fn relay(&self) -> Option<&PushRelayHandle> {
        self.relay.as_ref()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Stop admitting calls on every binding and route and stop the relay.
    pub fn shutdown(&self) {
        for binding in &self.bindings {
            binding.shutdown();
        }
        let _ = self.shutdown_tx.send(true);
        if let Some(relay) = &self.relay {
            relay.shutdown();
        }
    }

    /// Shut everything down and wait for every task to exit.
    ///
    /// Returns the relay's terminating error, if it stopped on one.
    pub async fn join(self) -> Result<()> {
        self.shutdown();

        join_all(self.bindings.into_iter().map(BindingHandle::join)).await;
        for result in join_all(self.routes).await {
            if let Err(e) = result {
                warn!("Route task ended abnormally: {}", e);
            }
        }

        match self.relay {
            Some(relay) => relay.join().await,
            None => Ok(()),
        }
    }
}

/// Starts bridges.
pub struct Bridge;

impl Bridge {
    /// Start every binding, route and relay in `manifest`.
    ///
    /// Fails with a configuration error, and subscribes nothing, if any port
    /// the manifest names is missing or already taken. Must be called from
    /// within a tokio runtime.
    pub fn start(
        ports: &mut PortRegistry,
        executor: Arc<dyn Executor>,
        manifest: &BridgeManifest,
    ) -> Result<BridgeHandle> {
        manifest.validate(ports)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut bindings = Vec::with_capacity(manifest.bindings.len());
        for spec in manifest.binding_specs() {
            bindings.push(CallMultiplexer::bind(ports, executor.clone(), spec)?);
        }

        let mut routes = Vec::with_capacity(manifest.routes.len());
        for route in &manifest.routes {
            let source = ports.subscribe(&route.call_port)?;
            routes.push(tokio::spawn(Self::forward_loop(
                source,
                executor.clone(),
                route.operation.clone(),
                (&route.args).into(),
                shutdown_rx.clone(),
            )));
        }

        let relay = match &manifest.push {
            Some(push) => Some(PushRelay::start(executor.clone(), ports.sink(&push.sink)?)),
            None => None,
        };

        info!(
            "Bridge started: {} binding(s), {} route(s), relay {}",
            bindings.len(),
            routes.len(),
            if relay.is_some() { "on" } else { "off" }
        );

        Ok(BridgeHandle {
            bindings,
            routes,
            relay,
            shutdown_tx,
        })
    }

    async fn forward_loop(
        mut source: CallSource,
        executor: Arc<dyn Executor>,
        operation: String,
        args: ArgsProjection,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let operation: Arc<str> = Arc::from(operation);
        loop {
            let value = tokio::select! {
                Ok(()) = shutdown_rx.changed() => break,
                value = source.recv() => match value {
                    Some(value) => value,
                    None => break,
                },
            };

            let executor = executor.clone();
            let operation = operation.clone();
            let call_args = args.apply(value);
            tokio::spawn(async move {
                match executor.invoke(&operation, call_args).await {
                    Ok(_) => debug!("Forwarded call to {}", operation),
                    Err(e) => warn!("Forwarded call to {} failed: {}", operation, e),
                }
            });
        }

        debug!("Route {} -> {} stopped", source.name(), operation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_from_json() {
        let manifest = BridgeManifest::from_json(
            r#"{
                "bindings": [
                    {"operation": "add", "call_port": "callAdd", "return_port": "returnAdd"},
                    {"operation": "open_file_dialog", "call_port": "callOpen",
                     "return_port": "returnOpen", "fallible": true, "args": {"wrap": "save"}}
                ],
                "push": {"sink": "receiveResponse"},
                "multiplexer": {"max_in_flight": 8}
            }"#,
        )
        .unwrap();

        assert_eq!(manifest.bindings.len(), 2);
        assert_eq!(manifest.bindings[0].args, ArgsShape::Identity);
        assert!(!manifest.bindings[0].fallible);
        assert_eq!(manifest.bindings[1].args, ArgsShape::Wrap("save".into()));
        assert!(manifest.routes.is_empty());
        assert_eq!(manifest.multiplexer.max_in_flight, Some(8));
    }

    #[test]
    fn test_gui_default_shape() {
        let manifest = BridgeManifest::gui_default();
        assert_eq!(manifest.bindings[0].operation, "open_file_dialog");
        assert_eq!(manifest.routes[0].call_port, PortConfig::SEND_CALL);
        assert_eq!(
            manifest.push.as_ref().map(|p| p.sink.as_str()),
            Some(PortConfig::RECEIVE_RESPONSE)
        );
    }

    #[test]
    fn test_validate_reports_missing_return_port() {
        let mut ports = PortRegistry::new();
        let _call = ports.add_source("callOpenFileDialog").unwrap();
        let _send = ports.add_source(PortConfig::SEND_CALL).unwrap();
        let _push = ports.add_sink(PortConfig::RECEIVE_RESPONSE).unwrap();

        let err = BridgeManifest::gui_default().validate(&ports).unwrap_err();
        match err {
            MuxError::MissingPort { kind, name } => {
                assert_eq!(kind, PortKind::Sink);
                assert_eq!(name, "returnOpenFileDialog");
            }
            other => panic!("Expected MissingPort, got: {:?}", other),
        }
        assert!(!ports.is_subscribed("callOpenFileDialog"));
    }

    #[test]
    fn test_validate_rejects_shared_call_port() {
        let mut ports = PortRegistry::new();
        let _call = ports.add_source("callAdd").unwrap();
        let _ret = ports.add_sink("returnAdd").unwrap();

        let manifest = BridgeManifest {
            bindings: vec![BindingEntry {
                operation: "add".into(),
                call_port: "callAdd".into(),
                return_port: "returnAdd".into(),
                fallible: false,
                args: ArgsShape::Identity,
            }],
            routes: vec![RouteEntry {
                operation: "log".into(),
                call_port: "callAdd".into(),
                args: ArgsShape::Identity,
            }],
            ..Default::default()
        };

        assert!(matches!(
            manifest.validate(&ports).unwrap_err(),
            MuxError::PortAlreadySubscribed { .. }
        ));
    }
}
