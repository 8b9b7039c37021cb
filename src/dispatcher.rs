//! Dispatch loop turning broker deliveries into pipeline calls.
//!
//! The [`Dispatcher`] subscribes to the request queue and, for every
//! delivery:
//!
//! - decodes it, rejecting malformed deliveries without calling the pipeline
//! - resolves the reply's messaging properties, honouring request overrides
//! - invokes the pipeline, turning failures into correlated fault replies
//! - publishes the reply to the caller's reply destination, then acks
//! - nacks for redelivery when the reply cannot be published
//!
//! At most `prefetch` deliveries are processed at once. The broker holds back
//! the rest, so nothing queues up in process.
//!
//! The dispatcher runs until:
//! - A [`CancellationToken`] is triggered, after which in-flight work is
//!   drained within the configured bound
//! - The delivery stream fails or ends, which is reported as connection loss

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex as StdMutex, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use http::StatusCode;
use tokio::{
    sync::{Mutex, Semaphore, watch},
    task::{Id, JoinError, JoinSet},
};
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing_error::SpanTrace;

use crate::{
    codec::{self, CodecError, RequestMeta},
    pipeline::{ApplicationFault, HttpRequest, HttpResponse, Pipeline},
    properties::{PropertyLayers, ResolvedProperties, ValidationError},
    transport::{BrokerChannel, Delivery, OutboundMessage, Subscription, TransportError},
};

/// Operational health reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// Replies keep failing to publish.
    Degraded { consecutive_publish_failures: u32 },
    /// The broker connection is gone; no deliveries are processed.
    Disconnected,
}

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Queue the requests are consumed from.
    pub queue: String,
    /// Broker prefetch, and the number of concurrent workers.
    pub prefetch: u16,
    /// How long in-flight work may run after cancellation.
    pub drain_timeout: Duration,
    /// Consecutive publish failures before health turns `Degraded`.
    pub publish_failure_threshold: u32,
}

/// A delivery whose processing was cut short by the drain timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbandonedDelivery {
    pub delivery_tag: u64,
    pub correlation_id: Option<String>,
}

/// Outcome of a dispatch run that ended by cancellation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Deliveries settled during the run.
    pub processed: usize,
    /// Deliveries abandoned and nacked for redelivery.
    pub abandoned: Vec<AbandonedDelivery>,
}

/// Bounded worker pool over one broker subscription.
///
/// Generic parameters:
/// - `C`: Broker channel, shared by all workers behind a mutex
/// - `S`: Pipeline service type
/// - `HK`: Hook implementation for lifecycle events
pub struct Dispatcher<C, S, HK = DefaultDispatcherHook> {
    channel: Arc<Mutex<C>>,
    pipeline: Pipeline<S>,
    layers: Arc<PropertyLayers>,
    settings: DispatchSettings,
    hook: Arc<HK>,
    health: Arc<watch::Sender<Health>>,
}

impl<C, S> Dispatcher<C, S, DefaultDispatcherHook> {
    /// Create a new dispatcher with the default hook implementation.
    pub fn new(
        channel: Arc<Mutex<C>>,
        pipeline: Pipeline<S>,
        layers: Arc<PropertyLayers>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            channel,
            pipeline,
            layers,
            settings,
            hook: Arc::new(DefaultDispatcherHook),
            health: Arc::new(watch::Sender::new(Health::Healthy)),
        }
    }
}

impl<C, S, HK> Dispatcher<C, S, HK> {
    /// Replace the dispatcher hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: DispatcherHook>(self, hook: Arc<HK2>) -> Dispatcher<C, S, HK2> {
        Dispatcher {
            channel: self.channel,
            pipeline: self.pipeline,
            layers: self.layers,
            settings: self.settings,
            hook,
            health: self.health,
        }
    }

    /// Report health on an existing channel instead of a private one.
    pub fn with_health(mut self, health: Arc<watch::Sender<Health>>) -> Self {
        self.health = health;
        self
    }

    pub fn health(&self) -> watch::Receiver<Health> {
        self.health.subscribe()
    }
}

enum LoopExit {
    Cancelled,
    Lost(TransportError),
}

impl<C, S, HK> Dispatcher<C, S, HK>
where
    C: BrokerChannel,
    S: Service<HttpRequest, Response = HttpResponse> + Clone + Send + 'static,
    S::Error: Into<tower::BoxError>,
    S::Future: Send + 'static,
    HK: DispatcherHook,
{
    /// Run the dispatch loop.
    ///
    /// Returns a [`DrainReport`] once cancelled and drained, or an error when
    /// the subscription could not be established or the connection was lost.
    #[tracing::instrument(skip_all, fields(queue = %self.settings.queue))]
    pub async fn run(self, cancel: CancellationToken) -> Result<DrainReport, DispatchError> {
        let Dispatcher {
            channel,
            pipeline,
            layers,
            settings,
            hook,
            health,
        } = self;
        hook.on_startup(&settings.queue);

        let subscribed = channel
            .lock()
            .await
            .subscribe(&settings.queue, settings.prefetch)
            .await;
        let Subscription {
            consumer_tag,
            mut deliveries,
        } = subscribed.map_err(DispatchError::subscribe)?;

        let ctx = Arc::new(WorkerContext {
            channel,
            layers,
            hook,
            health,
            publish_failures: AtomicU32::new(0),
            publish_failure_threshold: settings.publish_failure_threshold.max(1),
            in_flight: StdMutex::new(HashMap::new()),
            tasks: StdMutex::new(HashMap::new()),
        });
        let permits = Arc::new(Semaphore::new(usize::from(settings.prefetch.max(1))));
        let mut workers = JoinSet::new();
        let mut processed = 0;

        let exit = 'dispatch: loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break LoopExit::Cancelled,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break LoopExit::Cancelled,
                },
            };

            // Finished workers are reaped while waiting, so a settle issued
            // on their behalf can free the prefetch slot the broker is
            // holding back.
            let next = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'dispatch LoopExit::Cancelled,
                    Some(result) = workers.join_next_with_id() => {
                        processed += ctx.account(result).await;
                    }
                    next = deliveries.next() => break next,
                }
            };

            match next {
                Some(Ok(delivery)) => {
                    ctx.track(&delivery);
                    let tag = delivery.delivery_tag;
                    let worker = Arc::clone(&ctx);
                    let pipeline = pipeline.clone();
                    let task = workers.spawn(async move {
                        let _permit = permit;
                        worker.handle(pipeline, delivery).await
                    });
                    ctx.assign(task.id(), tag);
                }
                Some(Err(err)) => break LoopExit::Lost(err),
                None => {
                    break LoopExit::Lost(TransportError::connection("delivery stream ended"));
                }
            }
        };

        match exit {
            LoopExit::Cancelled => {
                // Deliveries already buffered by the consumer stay unacked and
                // return to the queue when the channel closes.
                let cancelled = ctx.channel.lock().await.cancel(&consumer_tag).await;
                if let Err(err) = cancelled {
                    ctx.hook.on_settle_error(None, &err);
                }
                drop(deliveries);

                let report = ctx.drain(workers, processed, settings.drain_timeout).await;
                ctx.hook.on_shutdown(&report);
                Ok(report)
            }
            LoopExit::Lost(err) => {
                workers.abort_all();
                while workers.join_next().await.is_some() {}
                ctx.take_in_flight();
                ctx.health.send_replace(Health::Disconnected);
                ctx.hook.on_connection_lost(&err);
                Err(DispatchError::connection_lost(err))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Replied,
    Faulted,
    Rejected,
    PublishFailed,
}

enum Settle {
    Ack,
    Requeue,
    Reject,
}

/// State shared by all workers of one dispatch run.
struct WorkerContext<C, HK> {
    channel: Arc<Mutex<C>>,
    layers: Arc<PropertyLayers>,
    hook: Arc<HK>,
    health: Arc<watch::Sender<Health>>,
    publish_failures: AtomicU32,
    publish_failure_threshold: u32,
    /// Unsettled deliveries by tag, with their correlation id when known.
    in_flight: StdMutex<HashMap<u64, Option<String>>>,
    /// Delivery tag handled by each worker task.
    tasks: StdMutex<HashMap<Id, u64>>,
}

impl<C, HK> WorkerContext<C, HK>
where
    C: BrokerChannel,
    HK: DispatcherHook,
{
    #[tracing::instrument(skip_all, fields(delivery_tag = delivery.delivery_tag))]
    async fn handle<S>(&self, pipeline: Pipeline<S>, delivery: Delivery) -> Outcome
    where
        S: Service<HttpRequest, Response = HttpResponse> + Clone + Send + 'static,
        S::Error: Into<tower::BoxError>,
        S::Future: Send + 'static,
    {
        self.hook.on_delivery(&delivery);
        let tag = delivery.delivery_tag;

        let (meta, request) = match codec::decode_request(&delivery) {
            Ok(decoded) => decoded.into_parts(),
            Err(err) => {
                self.hook.on_decode_error(&delivery, &err);
                self.settle(&mut *self.channel.lock().await, tag, Settle::Reject)
                    .await;
                return Outcome::Rejected;
            }
        };

        let resolved = match self.layers.resolve(&meta.reply_properties()) {
            Ok(resolved) => resolved,
            Err(err) => {
                self.hook.on_validation_error(&meta, &err);
                self.settle(&mut *self.channel.lock().await, tag, Settle::Reject)
                    .await;
                return Outcome::Rejected;
            }
        };

        let (response, outcome) = match invoke(pipeline, request).await {
            Ok(response) => (response, Outcome::Replied),
            Err(fault) => {
                self.hook.on_application_fault(&meta, &fault);
                (fault.into_response(), Outcome::Faulted)
            }
        };

        let Some(reply) = self.encode_reply(response, &meta, &resolved) else {
            self.settle(&mut *self.channel.lock().await, tag, Settle::Reject)
                .await;
            return Outcome::Rejected;
        };

        let mut channel = self.channel.lock().await;
        match channel.publish(reply).await {
            Ok(()) => {
                self.publish_succeeded();
                self.hook.on_reply_published(&meta);
                self.settle(&mut channel, tag, Settle::Ack).await;
                outcome
            }
            Err(err) => {
                let failures = self.publish_failed();
                self.hook.on_publish_error(&meta, &err, failures);
                self.settle(&mut channel, tag, Settle::Requeue).await;
                Outcome::PublishFailed
            }
        }
    }

    /// Wait for in-flight workers up to the drain timeout, then abandon the rest.
    async fn drain(
        &self,
        mut workers: JoinSet<Outcome>,
        mut processed: usize,
        drain_timeout: Duration,
    ) -> DrainReport {
        let deadline = tokio::time::sleep(drain_timeout);
        tokio::pin!(deadline);

        let timed_out = loop {
            tokio::select! {
                next = workers.join_next_with_id() => match next {
                    Some(result) => processed += self.account(result).await,
                    None => break false,
                },
                _ = &mut deadline => break true,
            }
        };

        if timed_out {
            workers.abort_all();
            while let Some(result) = workers.join_next_with_id().await {
                processed += self.account(result).await;
            }
        }

        // Anything still tracked was aborted before it could be settled.
        let abandoned = self.take_in_flight();
        if !abandoned.is_empty() {
            let mut channel = self.channel.lock().await;
            for delivery in &abandoned {
                if let Err(err) = channel.nack(delivery.delivery_tag, true).await {
                    self.hook.on_settle_error(Some(delivery.delivery_tag), &err);
                }
            }
            self.hook.on_drain_timeout(&abandoned);
        }

        DrainReport {
            processed,
            abandoned,
        }
    }

    /// Count a finished worker. A panicked worker's delivery is requeued
    /// right away so it does not hold a prefetch slot until shutdown.
    async fn account(&self, result: Result<(Id, Outcome), JoinError>) -> usize {
        let err = match result {
            Ok((id, _)) => {
                self.unassign(id);
                return 1;
            }
            Err(err) => err,
        };
        let tag = self.unassign(err.id());
        if !err.is_panic() {
            return 0;
        }

        self.hook.on_worker_panic(&err);
        if let Some(tag) = tag.filter(|tag| self.is_tracked(*tag)) {
            self.settle(&mut *self.channel.lock().await, tag, Settle::Requeue)
                .await;
        }
        0
    }

    fn encode_reply(
        &self,
        response: HttpResponse,
        meta: &RequestMeta,
        resolved: &ResolvedProperties,
    ) -> Option<OutboundMessage> {
        match codec::encode_response(response, meta, resolved) {
            Ok(reply) => Some(reply),
            Err(err) => {
                self.hook.on_encode_error(meta, &err);
                let fault = ApplicationFault::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "response could not be encoded",
                );
                codec::encode_response(fault.into_response(), meta, resolved).ok()
            }
        }
    }

    async fn settle(&self, channel: &mut C, tag: u64, settle: Settle) {
        let result = match settle {
            Settle::Ack => channel.ack(tag).await,
            Settle::Requeue => channel.nack(tag, true).await,
            Settle::Reject => channel.nack(tag, false).await,
        };
        self.untrack(tag);
        if let Err(err) = result {
            self.hook.on_settle_error(Some(tag), &err);
        }
    }

    fn track(&self, delivery: &Delivery) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                delivery.delivery_tag,
                delivery.properties.correlation_id.clone(),
            );
    }

    fn assign(&self, task: Id, tag: u64) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task, tag);
    }

    fn unassign(&self, task: Id) -> Option<u64> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&task)
    }

    fn is_tracked(&self, tag: u64) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&tag)
    }

    fn untrack(&self, tag: u64) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tag);
    }

    fn take_in_flight(&self) -> Vec<AbandonedDelivery> {
        let mut abandoned: Vec<_> = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(delivery_tag, correlation_id)| AbandonedDelivery {
                delivery_tag,
                correlation_id,
            })
            .collect();
        abandoned.sort_by_key(|a| a.delivery_tag);
        abandoned
    }

    fn publish_succeeded(&self) {
        self.publish_failures.store(0, Ordering::Relaxed);
        self.health.send_if_modified(|health| {
            if *health == Health::Healthy {
                return false;
            }
            *health = Health::Healthy;
            true
        });
    }

    fn publish_failed(&self) -> u32 {
        let failures = self.publish_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.publish_failure_threshold {
            self.health.send_replace(Health::Degraded {
                consecutive_publish_failures: failures,
            });
        }
        failures
    }
}

/// Call the pipeline in its own task so a panic surfaces as a fault.
///
/// The call is aborted if the worker is dropped.
async fn invoke<S>(
    pipeline: Pipeline<S>,
    request: HttpRequest,
) -> Result<HttpResponse, ApplicationFault>
where
    S: Service<HttpRequest, Response = HttpResponse> + Clone + Send + 'static,
    S::Error: Into<tower::BoxError>,
    S::Future: Send + 'static,
{
    let mut call = JoinSet::new();
    call.spawn(pipeline.invoke(request));
    match call.join_next().await {
        Some(Ok(result)) => result,
        Some(Err(err)) => Err(ApplicationFault::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("pipeline task failed: {err}"),
        )),
        None => Err(ApplicationFault::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "pipeline task vanished",
        )),
    }
}

/// Error ending a dispatch run.
#[derive(Debug)]
pub struct DispatchError {
    context: SpanTrace,
    kind: DispatchErrorKind,
}

/// Classification of dispatch errors.
#[derive(Debug)]
pub enum DispatchErrorKind {
    /// The subscription could not be established.
    Subscribe(TransportError),
    /// The delivery stream failed or ended without cancellation.
    ConnectionLost(TransportError),
}

impl DispatchError {
    fn subscribe(error: TransportError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: DispatchErrorKind::Subscribe(error),
        }
    }

    fn connection_lost(error: TransportError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: DispatchErrorKind::ConnectionLost(error),
        }
    }

    pub fn kind(&self) -> &DispatchErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            DispatchErrorKind::Subscribe(err) => write!(f, "Subscribe failed: {err}"),
            DispatchErrorKind::ConnectionLost(err) => write!(f, "Connection lost: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            DispatchErrorKind::Subscribe(err) | DispatchErrorKind::ConnectionLost(err) => Some(err),
        }
    }
}

/// Hook trait for observing dispatcher events.
///
/// Hooks are invoked synchronously from workers and should avoid heavy or
/// blocking work. Typical use cases include logging, metrics, and tracing
/// integration.
pub trait DispatcherHook: Send + Sync + 'static {
    fn on_startup(&self, queue: &str);
    fn on_shutdown(&self, report: &DrainReport);
    fn on_delivery(&self, delivery: &Delivery);
    fn on_decode_error(&self, delivery: &Delivery, error: &CodecError);
    fn on_validation_error(&self, meta: &RequestMeta, error: &ValidationError);
    fn on_application_fault(&self, meta: &RequestMeta, fault: &ApplicationFault);
    fn on_encode_error(&self, meta: &RequestMeta, error: &CodecError);
    fn on_reply_published(&self, meta: &RequestMeta);
    fn on_publish_error(
        &self,
        meta: &RequestMeta,
        error: &TransportError,
        consecutive_failures: u32,
    );
    fn on_settle_error(&self, delivery_tag: Option<u64>, error: &TransportError);
    fn on_worker_panic(&self, error: &JoinError);
    fn on_connection_lost(&self, error: &TransportError);
    fn on_drain_timeout(&self, abandoned: &[AbandonedDelivery]);
}

/// Default dispatcher hook implementation.
///
/// Logs events using `tracing`.
pub struct DefaultDispatcherHook;

impl DispatcherHook for DefaultDispatcherHook {
    fn on_startup(&self, queue: &str) {
        tracing::info!(queue, "Dispatcher is starting up");
    }

    fn on_shutdown(&self, report: &DrainReport) {
        tracing::info!(
            processed = report.processed,
            abandoned = report.abandoned.len(),
            "Dispatcher is shutting down"
        );
    }

    fn on_delivery(&self, delivery: &Delivery) {
        tracing::debug!(
            correlation_id = ?delivery.properties.correlation_id,
            redelivered = delivery.redelivered,
            "Delivery received"
        );
    }

    fn on_decode_error(&self, delivery: &Delivery, error: &CodecError) {
        tracing::warn!(
            delivery_tag = delivery.delivery_tag,
            error = %error,
            "Rejecting undecodable delivery"
        );
    }

    fn on_validation_error(&self, meta: &RequestMeta, error: &ValidationError) {
        tracing::warn!(
            correlation_id = %meta.correlation_id,
            error = %error,
            "Rejecting delivery with invalid messaging properties"
        );
    }

    fn on_application_fault(&self, meta: &RequestMeta, fault: &ApplicationFault) {
        tracing::warn!(
            correlation_id = %meta.correlation_id,
            status = %fault.status(),
            message = fault.message(),
            "Pipeline failed, replying with fault"
        );
    }

    fn on_encode_error(&self, meta: &RequestMeta, error: &CodecError) {
        tracing::error!(
            correlation_id = %meta.correlation_id,
            error = %error,
            "Response could not be encoded"
        );
    }

    fn on_reply_published(&self, meta: &RequestMeta) {
        tracing::debug!(correlation_id = %meta.correlation_id, "Reply published");
    }

    fn on_publish_error(
        &self,
        meta: &RequestMeta,
        error: &TransportError,
        consecutive_failures: u32,
    ) {
        tracing::error!(
            correlation_id = %meta.correlation_id,
            consecutive_failures,
            error = %error,
            "Reply could not be published"
        );
    }

    fn on_settle_error(&self, delivery_tag: Option<u64>, error: &TransportError) {
        tracing::error!(?delivery_tag, error = %error, "Failed to settle delivery");
    }

    fn on_worker_panic(&self, error: &JoinError) {
        tracing::error!(?error, "Dispatch worker panicked");
    }

    fn on_connection_lost(&self, error: &TransportError) {
        tracing::error!(error = %error, "Broker connection lost");
    }

    fn on_drain_timeout(&self, abandoned: &[AbandonedDelivery]) {
        tracing::warn!(
            abandoned = abandoned.len(),
            "Drain timeout elapsed, abandoning in-flight deliveries"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;
    use tower::service_fn;

    use super::*;
    use crate::{
        codec::CONTENT_TYPE,
        properties::MessagingProperties,
        transport::{Connector, DeliveryProperties, InMemoryBroker, InMemoryChannel},
    };

    const QUEUE: &str = "svc";

    fn settings(prefetch: u16, drain_timeout: Duration) -> DispatchSettings {
        DispatchSettings {
            queue: QUEUE.to_owned(),
            prefetch,
            drain_timeout,
            publish_failure_threshold: 2,
        }
    }

    async fn send_request(broker: &InMemoryBroker, correlation_id: &str) {
        let resolved = PropertyLayers::default()
            .resolve(&MessagingProperties::default().with_routing_key(QUEUE))
            .unwrap();
        let request = http::Request::builder()
            .uri(format!("/items/{correlation_id}"))
            .body(Bytes::new())
            .unwrap();
        let message = codec::encode_request(
            request,
            correlation_id,
            "replies",
            &resolved,
            &MessagingProperties::default(),
        )
        .unwrap();
        broker
            .inject(QUEUE, message.headers.properties, message.message)
            .await;
    }

    async fn wait_for_replies(broker: &InMemoryBroker, count: usize) -> Vec<OutboundMessage> {
        for _ in 0..200 {
            let replies = broker.published_to("replies").await;
            if replies.len() >= count {
                return replies;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {count} replies");
    }

    async fn echo(req: HttpRequest) -> Result<HttpResponse, ApplicationFault> {
        Ok(http::Response::new(Bytes::from(req.uri().to_string())))
    }

    async fn shared_channel(broker: &InMemoryBroker) -> Arc<Mutex<InMemoryChannel>> {
        Arc::new(Mutex::new(broker.connect().await.unwrap()))
    }

    #[tokio::test]
    async fn malformed_delivery_is_rejected_and_loop_continues() {
        let broker = InMemoryBroker::default();
        let channel = shared_channel(&broker).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let pipeline = Pipeline::new(service_fn(move |_req: HttpRequest| {
            counted.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ApplicationFault>(http::Response::new(Bytes::new())) }
        }));

        broker
            .inject(
                QUEUE,
                DeliveryProperties {
                    correlation_id: Some("bad".to_owned()),
                    reply_to: Some("replies".to_owned()),
                    content_type: Some(CONTENT_TYPE.to_owned()),
                    ..Default::default()
                },
                Bytes::from_static(b"{ not json"),
            )
            .await;
        send_request(&broker, "good").await;

        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            channel,
            pipeline,
            Arc::new(PropertyLayers::default()),
            settings(4, Duration::from_secs(1)),
        );
        let run = tokio::spawn(dispatcher.run(cancel.clone()));

        let replies = wait_for_replies(&broker, 1).await;
        assert_eq!(replies[0].headers.properties.correlation_id.as_deref(), Some("good"));
        cancel.cancel();
        let report = run.await.unwrap().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.processed, 2);
        let nacked = broker.nacked().await;
        assert_eq!(nacked.len(), 1);
        assert!(!nacked[0].1, "malformed deliveries are not requeued");
        assert_eq!(broker.acked().await.len(), 1);
    }

    #[tokio::test]
    async fn failing_pipeline_still_replies_once_and_acks() {
        let broker = InMemoryBroker::default();
        let channel = shared_channel(&broker).await;
        let pipeline = Pipeline::new(service_fn(|_req: HttpRequest| async {
            Err::<HttpResponse, _>(std::io::Error::other("kaboom"))
        }));
        for id in ["a", "b", "c"] {
            send_request(&broker, id).await;
        }

        let cancel = CancellationToken::new();
        let run = tokio::spawn(
            Dispatcher::new(
                channel,
                pipeline,
                Arc::new(PropertyLayers::default()),
                settings(2, Duration::from_secs(1)),
            )
            .run(cancel.clone()),
        );

        let replies = wait_for_replies(&broker, 3).await;
        cancel.cancel();
        run.await.unwrap().unwrap();

        let mut ids: Vec<_> = replies
            .iter()
            .map(|r| r.headers.properties.correlation_id.clone().unwrap())
            .collect();
        ids.sort();
        assert_eq!(ids, ["a", "b", "c"]);
        for reply in &replies {
            let response = codec::decode_response(&Delivery {
                delivery_tag: 0,
                redelivered: false,
                properties: reply.headers.properties.clone(),
                body: reply.message.clone(),
            })
            .unwrap()
            .message;
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(response.body().as_ref(), b"kaboom");
        }
        assert_eq!(broker.acked().await.len(), 3);
        assert!(broker.nacked().await.is_empty());
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_prefetch() {
        let broker = InMemoryBroker::default();
        let channel = shared_channel(&broker).await;
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (c, p) = (Arc::clone(&current), Arc::clone(&peak));
        let pipeline = Pipeline::new(service_fn(move |_req: HttpRequest| {
            let (current, peak) = (Arc::clone(&c), Arc::clone(&p));
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, ApplicationFault>(http::Response::new(Bytes::new()))
            }
        }));
        for i in 0..20 {
            send_request(&broker, &format!("req-{i}")).await;
        }

        let cancel = CancellationToken::new();
        let run = tokio::spawn(
            Dispatcher::new(
                channel,
                pipeline,
                Arc::new(PropertyLayers::default()),
                settings(3, Duration::from_secs(1)),
            )
            .run(cancel.clone()),
        );

        wait_for_replies(&broker, 20).await;
        cancel.cancel();
        run.await.unwrap().unwrap();

        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {peak} exceeded prefetch");
        assert!(peak >= 2, "work should overlap, peak was {peak}");
    }

    #[tokio::test]
    async fn failed_reply_publish_is_requeued_until_it_succeeds() {
        let broker = InMemoryBroker::default();
        let channel = shared_channel(&broker).await;
        broker.fail_next_publishes(2).await;
        send_request(&broker, "retry-me").await;

        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            channel,
            Pipeline::new(service_fn(echo)),
            Arc::new(PropertyLayers::default()),
            settings(1, Duration::from_secs(1)),
        );
        let health = dispatcher.health();
        let run = tokio::spawn(dispatcher.run(cancel.clone()));

        let replies = wait_for_replies(&broker, 1).await;
        assert_eq!(
            replies[0].headers.properties.correlation_id.as_deref(),
            Some("retry-me")
        );
        cancel.cancel();
        run.await.unwrap().unwrap();

        let nacked = broker.nacked().await;
        assert_eq!(nacked.len(), 2);
        assert!(nacked.iter().all(|(_, requeue)| *requeue));
        assert_eq!(broker.acked().await.len(), 1);
        assert_eq!(*health.borrow(), Health::Healthy);
    }

    #[tokio::test]
    async fn persistent_publish_failures_degrade_health() {
        let broker = InMemoryBroker::default();
        let channel = shared_channel(&broker).await;
        broker.fail_next_publishes(usize::MAX).await;
        send_request(&broker, "doomed").await;

        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            channel,
            Pipeline::new(service_fn(echo)),
            Arc::new(PropertyLayers::default()),
            settings(1, Duration::from_secs(1)),
        );
        let mut health = dispatcher.health();
        let run = tokio::spawn(dispatcher.run(cancel.clone()));

        let degraded = *health
            .wait_for(|h| matches!(h, Health::Degraded { .. }))
            .await
            .unwrap();
        assert!(matches!(
            degraded,
            Health::Degraded { consecutive_publish_failures } if consecutive_publish_failures >= 2
        ));
        cancel.cancel();
        run.await.unwrap().unwrap();

        assert!(broker.acked().await.is_empty());
        assert!(broker.published_to("replies").await.is_empty());
        assert_eq!(broker.queue_depth(QUEUE).await + broker.unacked_count().await, 1);
    }

    #[tokio::test]
    async fn unsupported_reply_exchange_kind_is_rejected_before_pipeline() {
        let broker = InMemoryBroker::default();
        let channel = shared_channel(&broker).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let pipeline = Pipeline::new(service_fn(move |_req: HttpRequest| {
            counted.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ApplicationFault>(http::Response::new(Bytes::new())) }
        }));

        let mut layers = PropertyLayers::default();
        layers.mapper.supported_exchange_kinds = vec![crate::properties::ExchangeKind::Direct];
        let resolved = PropertyLayers::default()
            .resolve(&MessagingProperties::default().with_routing_key(QUEUE))
            .unwrap();
        let reply = MessagingProperties::default()
            .with_exchange_kind(crate::properties::ExchangeKind::Fanout);
        let request = http::Request::builder().uri("/").body(Bytes::new()).unwrap();
        let message = codec::encode_request(request, "fan", "replies", &resolved, &reply).unwrap();
        broker
            .inject(QUEUE, message.headers.properties, message.message)
            .await;

        let cancel = CancellationToken::new();
        let run = tokio::spawn(
            Dispatcher::new(
                channel,
                pipeline,
                Arc::new(layers),
                settings(1, Duration::from_secs(1)),
            )
            .run(cancel.clone()),
        );

        for _ in 0..200 {
            if !broker.nacked().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(broker.published_to("replies").await.is_empty());
        assert_eq!(broker.nacked().await.len(), 1);
    }

    #[tokio::test]
    async fn drain_timeout_abandons_only_unfinished_work() {
        let broker = InMemoryBroker::default();
        let channel = shared_channel(&broker).await;
        let pipeline = Pipeline::new(service_fn(|req: HttpRequest| async move {
            if req.uri().path().ends_with("slow") {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok::<_, ApplicationFault>(http::Response::new(Bytes::new()))
        }));
        send_request(&broker, "fast").await;
        send_request(&broker, "slow").await;

        let cancel = CancellationToken::new();
        let run = tokio::spawn(
            Dispatcher::new(
                channel,
                pipeline,
                Arc::new(PropertyLayers::default()),
                settings(2, Duration::from_millis(50)),
            )
            .run(cancel.clone()),
        );

        wait_for_replies(&broker, 1).await;
        cancel.cancel();
        let report = run.await.unwrap().unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.abandoned.len(), 1);
        assert_eq!(report.abandoned[0].correlation_id.as_deref(), Some("slow"));
        assert_eq!(broker.nacked().await, vec![(report.abandoned[0].delivery_tag, true)]);
        assert_eq!(broker.published_to("replies").await.len(), 1);
    }

    /// Panics the first time a delivery is seen.
    #[derive(Default)]
    struct PanicOnce {
        fired: std::sync::atomic::AtomicBool,
    }

    impl DispatcherHook for PanicOnce {
        fn on_startup(&self, _queue: &str) {}
        fn on_shutdown(&self, _report: &DrainReport) {}
        fn on_delivery(&self, _delivery: &Delivery) {
            if !self.fired.swap(true, Ordering::SeqCst) {
                panic!("hook blew up");
            }
        }
        fn on_decode_error(&self, _delivery: &Delivery, _error: &CodecError) {}
        fn on_validation_error(&self, _meta: &RequestMeta, _error: &ValidationError) {}
        fn on_application_fault(&self, _meta: &RequestMeta, _fault: &ApplicationFault) {}
        fn on_encode_error(&self, _meta: &RequestMeta, _error: &CodecError) {}
        fn on_reply_published(&self, _meta: &RequestMeta) {}
        fn on_publish_error(&self, _meta: &RequestMeta, _error: &TransportError, _failures: u32) {}
        fn on_settle_error(&self, _delivery_tag: Option<u64>, _error: &TransportError) {}
        fn on_worker_panic(&self, _error: &JoinError) {}
        fn on_connection_lost(&self, _error: &TransportError) {}
        fn on_drain_timeout(&self, _abandoned: &[AbandonedDelivery]) {}
    }

    #[tokio::test]
    async fn panicked_worker_requeues_its_delivery_at_once() {
        let broker = InMemoryBroker::default();
        let channel = shared_channel(&broker).await;
        send_request(&broker, "boom").await;

        let cancel = CancellationToken::new();
        let run = tokio::spawn(
            Dispatcher::new(
                channel,
                Pipeline::new(service_fn(echo)),
                Arc::new(PropertyLayers::default()),
                settings(1, Duration::from_secs(1)),
            )
            .with_hook(Arc::new(PanicOnce::default()))
            .run(cancel.clone()),
        );

        // With a prefetch of one the redelivery only arrives once the
        // panicked delivery has been settled.
        let replies = wait_for_replies(&broker, 1).await;
        assert_eq!(replies[0].headers.properties.correlation_id.as_deref(), Some("boom"));

        cancel.cancel();
        let report = run.await.unwrap().unwrap();

        let nacked = broker.nacked().await;
        assert_eq!(nacked.len(), 1);
        assert!(nacked[0].1);
        assert_eq!(broker.acked().await.len(), 1);
        assert_eq!(report.processed, 1);
        assert!(report.abandoned.is_empty());
    }

    #[tokio::test]
    async fn connection_loss_ends_the_run_with_an_error() {
        let broker = InMemoryBroker::default();
        let channel = shared_channel(&broker).await;
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            channel,
            Pipeline::new(service_fn(echo)),
            Arc::new(PropertyLayers::default()),
            settings(1, Duration::from_secs(1)),
        );
        let health = dispatcher.health();
        let run = tokio::spawn(dispatcher.run(cancel));

        while broker.consumer_count(QUEUE).await == 0 {
            tokio::task::yield_now().await;
        }
        broker.disconnect().await;

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err.kind(), DispatchErrorKind::ConnectionLost(_)));
        assert_eq!(*health.borrow(), Health::Disconnected);
    }
}
