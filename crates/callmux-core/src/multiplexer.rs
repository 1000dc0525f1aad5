//! Call multiplexer: one remote operation bound to one call port and one
//! return port.
//!
//! Every value arriving on the call port is admitted (numbered) in arrival
//! order and dispatched to the executor in its own task without waiting for
//! earlier calls. Completions go through a [`SequencedReorderBuffer`], so the
//! return port sees results in exactly the order the calls arrived.
//!
//! ```text
//! call port ──► admit(seq) ──► spawn invoke(op, args(v)) ──► complete(seq, r)
//!                                                              │
//!                                     return port ◄── release ─┘ (in seq order)
//! ```
//!
//! A [`DeliveryMode::Direct`] binding forwards raw results. If one of its
//! calls fails, that sequence number never completes and every later result
//! stays buffered; the stall is logged and reported by
//! [`BindingHandle::stats`]. A [`DeliveryMode::Fallible`] binding wraps every
//! outcome in an [`Envelope`], so a failed call still takes its turn.

use crate::config::MultiplexerConfig;
use crate::envelope::Envelope;
use crate::error::{MuxError, PortKind, Result};
use crate::executor::Executor;
use crate::ports::{CallSource, PortRegistry, ResultSink};
use crate::reorder::SequencedReorderBuffer;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// How a binding delivers executor outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Forward the executor's result unchanged. Failures stall the binding.
    #[default]
    Direct,
    /// Deliver an [`Envelope`] for every call, success or failure.
    Fallible,
}

/// Maps a call-port value to executor arguments.
#[derive(Clone, Default)]
pub enum ArgsProjection {
    /// Pass the value through.
    #[default]
    Identity,
    /// Wrap the value as `{key: value}`.
    Wrap(String),
    /// Arbitrary pure mapping.
    Custom(Arc<dyn Fn(Value) -> Value + Send + Sync>),
}

impl ArgsProjection {
    pub fn wrap(key: impl Into<String>) -> Self {
        ArgsProjection::Wrap(key.into())
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        ArgsProjection::Custom(Arc::new(f))
    }

    pub fn apply(&self, value: Value) -> Value {
        match self {
            ArgsProjection::Identity => value,
            ArgsProjection::Wrap(key) => {
                let mut args = serde_json::Map::new();
                args.insert(key.clone(), value);
                Value::Object(args)
            }
            ArgsProjection::Custom(f) => f(value),
        }
    }
}

impl fmt::Debug for ArgsProjection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsProjection::Identity => write!(f, "Identity"),
            ArgsProjection::Wrap(key) => f.debug_tuple("Wrap").field(key).finish(),
            ArgsProjection::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Everything needed to create one binding.
#[derive(Debug, Clone)]
pub struct BindingSpec {
    pub operation: String,
    pub call_port: String,
    pub return_port: String,
    pub args: ArgsProjection,
    pub mode: DeliveryMode,
    pub config: MultiplexerConfig,
}

impl BindingSpec {
    /// A direct binding with identity arguments and unbounded dispatch.
    pub fn new(
        operation: impl Into<String>,
        call_port: impl Into<String>,
        return_port: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            call_port: call_port.into(),
            return_port: return_port.into(),
            args: ArgsProjection::Identity,
            mode: DeliveryMode::Direct,
            config: MultiplexerConfig::default(),
        }
    }

    pub fn with_args(mut self, args: ArgsProjection) -> Self {
        self.args = args;
        self
    }

    pub fn with_mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn fallible(self) -> Self {
        self.with_mode(DeliveryMode::Fallible)
    }

    pub fn with_config(mut self, config: MultiplexerConfig) -> Self {
        self.config = config;
        self
    }
}

/// Snapshot of a binding's progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingStats {
    pub operation: String,
    /// Calls admitted so far.
    pub admitted: u64,
    /// Results released to the return port so far.
    pub released: u64,
    /// Completed results waiting on an earlier call.
    pub pending: usize,
    /// Executor calls not yet resolved.
    pub in_flight: usize,
    /// Executor calls that failed.
    pub failures: u64,
    /// Lowest sequence number whose direct-mode call failed. Nothing at or
    /// above it will ever be released.
    pub stalled_at: Option<u64>,
}

struct BindingState {
    buffer: SequencedReorderBuffer<Value>,
    in_flight: usize,
    failures: u64,
    stalled_at: Option<u64>,
}

struct Shared {
    operation: Arc<str>,
    mode: DeliveryMode,
    sink: ResultSink,
    state: Mutex<BindingState>,
}

impl Shared {
    fn admit(&self) -> u64 {
        let mut state = self.state.lock().expect("binding lock poisoned");
        state.in_flight += 1;
        state.buffer.admit()
    }

    fn complete(&self, seq: u64, value: Value, failed: bool) {
        let mut state = self.state.lock().expect("binding lock poisoned");
        state.in_flight -= 1;
        if failed {
            state.failures += 1;
        }

        // Release under the lock so concurrent completions cannot interleave
        // their sends.
        let sink = &self.sink;
        match state.buffer.complete_with(seq, value, |released| {
            sink.send(released);
        }) {
            Ok(0) => debug!("{} #{} completed early, buffered", self.operation, seq),
            Ok(released) => debug!(
                "{} #{} completed, released {} result(s)",
                self.operation, seq, released
            ),
            Err(e) => error!("{} #{}: {}", self.operation, seq, e),
        }
    }

    fn fail(&self, seq: u64, err: &MuxError) {
        let mut state = self.state.lock().expect("binding lock poisoned");
        state.in_flight -= 1;
        state.failures += 1;
        let stalled_at = state.stalled_at.map_or(seq, |current| current.min(seq));
        state.stalled_at = Some(stalled_at);

        error!(
            "{} #{} failed in direct mode, delivery stalled from #{}: {}",
            self.operation, seq, stalled_at, err
        );
    }

    fn stats(&self) -> BindingStats {
        let state = self.state.lock().expect("binding lock poisoned");
        let counters = state.buffer.stats();
        BindingStats {
            operation: self.operation.to_string(),
            admitted: counters.next_admit,
            released: counters.next_release,
            pending: counters.pending,
            in_flight: state.in_flight,
            failures: state.failures,
            stalled_at: state.stalled_at,
        }
    }
}

/// Handle to a running binding.
///
/// Dropping the handle leaves the binding running for as long as its call
/// port stays open.
pub struct BindingHandle {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl BindingHandle {
    pub fn operation(&self) -> &str {
        &self.shared.operation
    }

    pub fn stats(&self) -> BindingStats {
        self.shared.stats()
    }

    pub fn is_stalled(&self) -> bool {
        self.stats().stalled_at.is_some()
    }

    /// Stop admitting new calls.
    ///
    /// Calls already dispatched still complete and are released in order.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the subscriber loop to exit, after [`shutdown`](Self::shutdown)
    /// or once the call port closes.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("{} subscriber task ended abnormally: {}", self.shared.operation, e);
            }
        }
    }
}

impl fmt::Debug for BindingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingHandle")
            .field("operation", &self.shared.operation)
            .field("mode", &self.shared.mode)
            .finish()
    }
}

/// Creates bindings.
pub struct CallMultiplexer;

impl CallMultiplexer {
    /// Bind `spec.operation` to its call and return ports.
    ///
    /// Both ports must exist; otherwise this fails with
    /// [`MuxError::MissingPort`] before anything is subscribed. Must be called
    /// from within a tokio runtime.
    pub fn bind(
        ports: &mut PortRegistry,
        executor: Arc<dyn Executor>,
        spec: BindingSpec,
    ) -> Result<BindingHandle> {
        ports.require(PortKind::Source, &spec.call_port)?;
        ports.require(PortKind::Sink, &spec.return_port)?;

        let sink = ports.sink(&spec.return_port)?;
        let source = ports.subscribe(&spec.call_port)?;

        Ok(Self::spawn(source, sink, executor, spec))
    }

    /// Start a binding over an already subscribed call port.
    pub(crate) fn spawn(
        source: CallSource,
        sink: ResultSink,
        executor: Arc<dyn Executor>,
        spec: BindingSpec,
    ) -> BindingHandle {
        debug!(
            "Binding {} ({:?}): {} -> {}",
            spec.operation,
            spec.mode,
            source.name(),
            sink.name()
        );

        let shared = Arc::new(Shared {
            operation: Arc::from(spec.operation.as_str()),
            mode: spec.mode,
            sink,
            state: Mutex::new(BindingState {
                buffer: SequencedReorderBuffer::new(),
                in_flight: 0,
                failures: 0,
                stalled_at: None,
            }),
        });

        let limiter = spec
            .config
            .max_in_flight
            .map(|limit| Arc::new(Semaphore::new(limit)));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Self::subscriber_loop(
            shared.clone(),
            source,
            executor,
            spec.args,
            limiter,
            shutdown_rx,
        ));

        BindingHandle {
            shared,
            shutdown_tx,
            task: Some(task),
        }
    }

    async fn subscriber_loop(
        shared: Arc<Shared>,
        mut source: CallSource,
        executor: Arc<dyn Executor>,
        args: ArgsProjection,
        limiter: Option<Arc<Semaphore>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        // A dropped handle closes the watch channel; only an explicit
        // shutdown stops the loop.
        loop {
            let value = tokio::select! {
                Ok(()) = shutdown_rx.changed() => break,
                value = source.recv() => match value {
                    Some(value) => value,
                    None => {
                        debug!("Call port {} closed", source.name());
                        break;
                    }
                },
            };

            // Waiting here, before admission, keeps admission order equal to
            // arrival order.
            let permit = match &limiter {
                Some(semaphore) => tokio::select! {
                    Ok(()) = shutdown_rx.changed() => break,
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                None => None,
            };

            let seq = shared.admit();
            let call_args = args.apply(value);
            debug!("{} #{} admitted", shared.operation, seq);

            tokio::spawn(Self::dispatch(
                shared.clone(),
                executor.clone(),
                seq,
                call_args,
                permit,
            ));
        }

        debug!("Binding {} stopped admitting calls", shared.operation);
    }

    async fn dispatch(
        shared: Arc<Shared>,
        executor: Arc<dyn Executor>,
        seq: u64,
        args: Value,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let outcome = executor.invoke(&shared.operation, args).await;
        drop(permit);

        match (shared.mode, outcome) {
            (DeliveryMode::Direct, Ok(value)) => shared.complete(seq, value, false),
            (DeliveryMode::Direct, Err(e)) => shared.fail(seq, &e),
            (DeliveryMode::Fallible, outcome) => {
                let failed = outcome.is_err();
                shared.complete(seq, envelope_value(outcome), failed);
            }
        }
    }
}

fn envelope_value(outcome: Result<Value>) -> Value {
    let envelope: Envelope<Value, String> = outcome.map_err(|e| e.to_string()).into();
    serde_json::to_value(&envelope)
        .unwrap_or_else(|e| json!({"status": "failure", "error": e.to_string()}))
}
