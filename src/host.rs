//! Lifecycle of a hosted pipeline.
//!
//! A [`Host`] owns the broker connection and the dispatcher for one pipeline
//! and moves through a one-way state machine:
//!
//! ```text
//! Created --start()--> Started --stop()/dispose()--> Draining --> Stopped
//!    \________________________dispose()______________________/
//! ```
//!
//! Once started, a supervisor task runs the [`Dispatcher`]. If the broker
//! connection drops, the supervisor reports `Disconnected`, reconnects with
//! exponential backoff and resumes dispatching. Every channel it opens is
//! closed exactly once.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{Mutex, watch},
    task::{JoinError, JoinHandle},
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tower::Service;
use tracing_error::SpanTrace;

use crate::{
    config::HostConfig,
    dispatcher::{
        AbandonedDelivery, DefaultDispatcherHook, DispatchSettings, Dispatcher, DispatcherHook,
        DrainReport, Health,
    },
    pipeline::{HttpRequest, HttpResponse, Pipeline},
    properties::{PropertyLayers, ValidationError},
    transport::{BrokerChannel, Connector, TransportError},
};

/// Observable lifecycle state of a [`Host`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// No broker resources held.
    Created,
    /// Subscribed and dispatching.
    Started,
    /// Unsubscribed, in-flight work finishing.
    Draining,
    /// All resources released.
    Stopped,
}

impl std::fmt::Display for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HostState::Created => "created",
            HostState::Started => "started",
            HostState::Draining => "draining",
            HostState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

enum Lifecycle<S> {
    Created(Pipeline<S>),
    Started(JoinHandle<DrainReport>),
    Stopped,
}

/// Hosts a pipeline behind a broker queue.
///
/// Generic parameters:
/// - `K`: Connector opening broker channels
/// - `S`: Pipeline service type
/// - `HK`: Dispatcher hook implementation
///
/// Dropping a running host cancels it; the supervisor then drains and closes
/// its channel in the background.
pub struct Host<K, S, HK = DefaultDispatcherHook> {
    connector: Arc<K>,
    config: HostConfig,
    hook: Arc<HK>,
    lifecycle: Mutex<Lifecycle<S>>,
    state: watch::Sender<HostState>,
    health: Arc<watch::Sender<Health>>,
    cancel: CancellationToken,
    _shutdown_on_drop: DropGuard,
}

impl<K, S> Host<K, S, DefaultDispatcherHook> {
    /// Create a host in the `Created` state. Nothing touches the broker yet.
    pub fn new(connector: K, pipeline: Pipeline<S>, config: HostConfig) -> Self {
        let cancel = CancellationToken::new();
        Self {
            connector: Arc::new(connector),
            config,
            hook: Arc::new(DefaultDispatcherHook),
            lifecycle: Mutex::new(Lifecycle::Created(pipeline)),
            state: watch::Sender::new(HostState::Created),
            health: Arc::new(watch::Sender::new(Health::Healthy)),
            _shutdown_on_drop: cancel.clone().drop_guard(),
            cancel,
        }
    }
}

impl<K, S, HK> Host<K, S, HK> {
    /// Replace the dispatcher hook.
    pub fn with_hook<HK2: DispatcherHook>(self, hook: HK2) -> Host<K, S, HK2> {
        Host {
            connector: self.connector,
            config: self.config,
            hook: Arc::new(hook),
            lifecycle: self.lifecycle,
            state: self.state,
            health: self.health,
            cancel: self.cancel,
            _shutdown_on_drop: self._shutdown_on_drop,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn state(&self) -> HostState {
        *self.state.borrow()
    }

    /// Follow lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<HostState> {
        self.state.subscribe()
    }

    /// Follow the operational health signal.
    pub fn health(&self) -> watch::Receiver<Health> {
        self.health.subscribe()
    }
}

impl<K, S, HK> Host<K, S, HK>
where
    K: Connector,
    S: Service<HttpRequest, Response = HttpResponse> + Clone + Send + 'static,
    S::Error: Into<tower::BoxError>,
    S::Future: Send + 'static,
    HK: DispatcherHook,
{
    /// Connect and begin dispatching.
    ///
    /// Only valid from `Created`. Validation and connection failures leave
    /// the host in `Created` so `start` can be retried.
    #[tracing::instrument(skip_all, fields(queue = %self.config.queue))]
    pub async fn start(&self) -> Result<(), HostError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let pipeline = match &*lifecycle {
            Lifecycle::Created(pipeline) => pipeline.clone(),
            _ => return Err(HostError::invalid_state("start", self.state())),
        };

        self.config.validate().map_err(HostError::validation)?;
        let channel = self
            .connector
            .connect()
            .await
            .map_err(HostError::connectivity)?;

        let supervisor = Supervisor {
            connector: Arc::clone(&self.connector),
            pipeline,
            layers: Arc::new(self.config.property_layers()),
            settings: self.config.dispatch_settings(),
            initial_backoff: self.config.reconnect_initial_backoff(),
            max_backoff: self.config.reconnect_max_backoff(),
            hook: Arc::clone(&self.hook),
            health: Arc::clone(&self.health),
            cancel: self.cancel.clone(),
        };
        self.health.send_replace(Health::Healthy);
        *lifecycle = Lifecycle::Started(tokio::spawn(supervisor.run(channel)));
        self.state.send_replace(HostState::Started);
        tracing::info!("Host started");
        Ok(())
    }

    /// Stop dispatching and drain in-flight work.
    ///
    /// Only valid from `Started`. Returns the drain report, or
    /// [`HostErrorKind::ShutdownTimeout`] when the drain timeout abandoned
    /// deliveries. The host ends in `Stopped` either way.
    pub async fn stop(&self) -> Result<DrainReport, HostError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let handle = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Started(handle) => handle,
            other => {
                *lifecycle = other;
                return Err(HostError::invalid_state("stop", self.state()));
            }
        };
        self.drain(handle).await
    }

    /// Reach `Stopped` from any state. Calling it again is a no-op.
    pub async fn dispose(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Started(handle) => {
                if let Err(err) = self.drain(handle).await {
                    tracing::warn!(error = %err, "Host disposed with unfinished work");
                }
            }
            Lifecycle::Created(_) => {
                self.cancel.cancel();
                self.state.send_replace(HostState::Stopped);
            }
            Lifecycle::Stopped => {}
        }
    }

    async fn drain(&self, supervisor: JoinHandle<DrainReport>) -> Result<DrainReport, HostError> {
        self.state.send_replace(HostState::Draining);
        self.cancel.cancel();
        let outcome = supervisor.await;
        self.state.send_replace(HostState::Stopped);

        let report = outcome.map_err(HostError::supervisor)?;
        tracing::info!(processed = report.processed, "Host stopped");
        if report.abandoned.is_empty() {
            Ok(report)
        } else {
            Err(HostError::shutdown_timeout(report.abandoned))
        }
    }
}

/// Background task owning the broker channel while the host runs.
struct Supervisor<K, S, HK> {
    connector: Arc<K>,
    pipeline: Pipeline<S>,
    layers: Arc<PropertyLayers>,
    settings: DispatchSettings,
    initial_backoff: Duration,
    max_backoff: Duration,
    hook: Arc<HK>,
    health: Arc<watch::Sender<Health>>,
    cancel: CancellationToken,
}

impl<K, S, HK> Supervisor<K, S, HK>
where
    K: Connector,
    S: Service<HttpRequest, Response = HttpResponse> + Clone + Send + 'static,
    S::Error: Into<tower::BoxError>,
    S::Future: Send + 'static,
    HK: DispatcherHook,
{
    #[tracing::instrument(name = "supervisor", skip_all, fields(queue = %self.settings.queue))]
    async fn run(self, mut channel: K::Channel) -> DrainReport {
        loop {
            let shared = Arc::new(Mutex::new(channel));
            let dispatcher = Dispatcher::new(
                Arc::clone(&shared),
                self.pipeline.clone(),
                Arc::clone(&self.layers),
                self.settings.clone(),
            )
            .with_hook(Arc::clone(&self.hook))
            .with_health(Arc::clone(&self.health));
            let cancel = self.cancel.clone();
            let result = dispatcher.run(cancel).await;

            if let Err(err) = shared.lock().await.close().await {
                tracing::warn!(error = %err, "Failed to close broker channel");
            }

            match result {
                Ok(report) => return report,
                Err(err) => {
                    tracing::warn!(error = %err, "Dispatch interrupted, reconnecting");
                    self.health.send_replace(Health::Disconnected);
                }
            }

            let connector = Arc::clone(&self.connector);
            let reconnected = reconnect(
                &*connector,
                &self.cancel,
                self.initial_backoff,
                self.max_backoff,
            )
            .await;
            match reconnected {
                Some(next) => {
                    channel = next;
                    self.health.send_replace(Health::Healthy);
                    tracing::info!("Reconnected to broker");
                }
                None => return DrainReport::default(),
            }
        }
    }
}

/// Retry connecting with exponential backoff until it works or `cancel` fires.
async fn reconnect<K: Connector>(
    connector: &K,
    cancel: &CancellationToken,
    initial_backoff: Duration,
    max_backoff: Duration,
) -> Option<K::Channel> {
    let mut delay = initial_backoff;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            attempt = connector.connect() => attempt,
        };
        match attempt {
            Ok(channel) => return Some(channel),
            Err(err) => {
                tracing::warn!(error = %err, ?delay, "Reconnect attempt failed");
                delay = (delay * 2).min(max_backoff);
            }
        }
    }
}

/// Error returned by host lifecycle operations.
#[derive(Debug)]
pub struct HostError {
    context: SpanTrace,
    kind: HostErrorKind,
}

/// Host error kinds.
#[derive(Debug)]
pub enum HostErrorKind {
    /// The operation is not allowed in the current state.
    InvalidState {
        operation: &'static str,
        state: HostState,
    },
    Validation(ValidationError),
    /// The broker could not be reached on start.
    Connectivity(TransportError),
    /// The drain timeout elapsed; these deliveries were abandoned and requeued.
    ShutdownTimeout { abandoned: Vec<AbandonedDelivery> },
    /// The supervisor task panicked or was aborted.
    Supervisor(JoinError),
}

impl HostError {
    fn new(kind: HostErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    fn invalid_state(operation: &'static str, state: HostState) -> Self {
        Self::new(HostErrorKind::InvalidState { operation, state })
    }

    fn validation(err: ValidationError) -> Self {
        Self::new(HostErrorKind::Validation(err))
    }

    fn connectivity(err: TransportError) -> Self {
        Self::new(HostErrorKind::Connectivity(err))
    }

    fn shutdown_timeout(abandoned: Vec<AbandonedDelivery>) -> Self {
        Self::new(HostErrorKind::ShutdownTimeout { abandoned })
    }

    fn supervisor(err: JoinError) -> Self {
        Self::new(HostErrorKind::Supervisor(err))
    }

    pub fn kind(&self) -> &HostErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            HostErrorKind::InvalidState { operation, state } => {
                writeln!(f, "Cannot {operation} a host that is {state}")
            }
            HostErrorKind::Validation(err) => write!(f, "Invalid configuration: {err}"),
            HostErrorKind::Connectivity(err) => write!(f, "Broker unreachable: {err}"),
            HostErrorKind::ShutdownTimeout { abandoned } => writeln!(
                f,
                "Drain timed out, {} deliveries abandoned",
                abandoned.len()
            ),
            HostErrorKind::Supervisor(err) => writeln!(f, "Supervisor task failed: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for HostError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            HostErrorKind::Validation(err) => Some(err),
            HostErrorKind::Connectivity(err) => Some(err),
            HostErrorKind::Supervisor(err) => Some(err),
            _ => None,
        }
    }
}
