//! Caller side of the request/reply exchange.
//!
//! An [`RpcClient`] publishes HTTP requests to a hosted pipeline's queue and
//! waits for the correlated reply on its own reply queue. A background
//! listener routes replies to waiting callers by correlation id; replies
//! nobody waits for anymore are acked and dropped.
//!
//! The response-wait timeout is a caller-side concern only. Message
//! expiration is broker-side and travels with the request; neither one
//! clamps the other.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex as StdMutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::sync::{Mutex, oneshot};
use tokio_stream::StreamExt as _;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::{
    codec::{self, CodecError},
    config::ClientConfig,
    pipeline::{HttpRequest, HttpResponse},
    properties::{ExchangeKind, MessagingProperties, PropertyLayers, ValidationError},
    transport::{BrokerChannel, Connector, Delivery, Subscription, TransportError},
};

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Response-wait timeout; `None` uses the client's default.
    pub timeout: Option<Duration>,
    /// Request-level property overrides. The host applies the same
    /// durability, expiration and header overrides to the reply; fields left
    /// unset fall back to the host's own defaults there.
    pub properties: MessagingProperties,
    /// Exchange kind the host should publish the reply through.
    pub reply_exchange_kind: Option<ExchangeKind>,
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_properties(mut self, properties: MessagingProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_reply_exchange_kind(mut self, kind: ExchangeKind) -> Self {
        self.reply_exchange_kind = Some(kind);
        self
    }
}

type Pending = StdMutex<HashMap<String, oneshot::Sender<HttpResponse>>>;

/// Sends requests to hosted pipelines and awaits their replies.
pub struct RpcClient<C> {
    channel: Arc<Mutex<C>>,
    layers: PropertyLayers,
    reply_queue: String,
    consumer_tag: String,
    timeout: Option<Duration>,
    pending: Arc<Pending>,
    closed: Arc<AtomicBool>,
    listener: tokio::task::JoinHandle<()>,
    _stop_listener: DropGuard,
}

impl<C: BrokerChannel> RpcClient<C> {
    /// Open a channel and start listening on the reply queue.
    #[tracing::instrument(skip_all, fields(reply_queue = %config.reply_queue))]
    pub async fn connect<K>(connector: &K, config: ClientConfig) -> Result<Self, ClientError>
    where
        K: Connector<Channel = C>,
    {
        config.validate().map_err(ClientError::validation)?;
        let layers = config.property_layers();
        let timeout = config.timeout();

        let mut channel = connector.connect().await.map_err(ClientError::transport)?;
        let Subscription {
            consumer_tag,
            deliveries,
        } = channel
            .subscribe(&config.reply_queue, 0)
            .await
            .map_err(ClientError::transport)?;

        let channel = Arc::new(Mutex::new(channel));
        let pending = Arc::new(Pending::default());
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let listener = tokio::spawn(listen(
            deliveries,
            Arc::clone(&channel),
            Arc::clone(&pending),
            Arc::clone(&closed),
            cancel.clone(),
        ));

        Ok(Self {
            channel,
            layers,
            reply_queue: config.reply_queue,
            consumer_tag,
            timeout,
            pending,
            closed,
            listener,
            _stop_listener: cancel.drop_guard(),
        })
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Whether the reply listener has stopped.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Requests still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Publish `request` and wait for its reply.
    ///
    /// Application faults raised by the hosted pipeline arrive as ordinary
    /// responses; see [`is_fault`](crate::pipeline::is_fault).
    #[tracing::instrument(skip_all, fields(uri = %request.uri()))]
    pub async fn send(
        &self,
        request: HttpRequest,
        options: RequestOptions,
    ) -> Result<HttpResponse, ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::new(ClientErrorKind::Closed));
        }

        let resolved = self
            .layers
            .resolve(&options.properties)
            .map_err(ClientError::validation)?;
        let reply = MessagingProperties {
            exchange_kind: options.reply_exchange_kind,
            routing_key: None,
            ..options.properties
        };
        let correlation_id = Uuid::new_v4().to_string();
        let message = codec::encode_request(
            request,
            &correlation_id,
            &self.reply_queue,
            &resolved,
            &reply,
        )
        .map_err(ClientError::codec)?;

        // Registered before publishing so a fast reply cannot be missed.
        let (sender, receiver) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(correlation_id.clone(), sender);

        let published = self.channel.lock().await.publish(message).await;
        if let Err(err) = published {
            self.forget(&correlation_id);
            return Err(ClientError::transport(err));
        }
        tracing::debug!(%correlation_id, "Request published");

        let reply = match options.timeout.or(self.timeout) {
            Some(limit) => match tokio::time::timeout(limit, receiver).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.forget(&correlation_id);
                    return Err(ClientError::new(ClientErrorKind::Timeout {
                        correlation_id,
                        after: limit,
                    }));
                }
            },
            None => receiver.await,
        };
        reply.map_err(|_| ClientError::new(ClientErrorKind::Closed))
    }

    /// Stop listening and release the channel.
    pub async fn close(self) -> Result<(), ClientError> {
        self.closed.store(true, Ordering::Release);
        drop(self._stop_listener);
        let _ = self.listener.await;

        let mut channel = self.channel.lock().await;
        // The consumer is gone already if the connection dropped.
        let _ = channel.cancel(&self.consumer_tag).await;
        channel.close().await.map_err(ClientError::transport)
    }

    fn forget(&self, correlation_id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(correlation_id);
    }
}

async fn listen<C: BrokerChannel>(
    mut deliveries: futures_core::stream::BoxStream<'static, Result<Delivery, TransportError>>,
    channel: Arc<Mutex<C>>,
    pending: Arc<Pending>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = deliveries.next() => next,
        };
        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(err)) => {
                tracing::error!(error = %err, "Reply stream failed");
                break;
            }
            None => {
                tracing::warn!("Reply stream ended");
                break;
            }
        };

        let tag = delivery.delivery_tag;
        let settled = match codec::decode_response(&delivery) {
            Ok(decoded) => {
                let (correlation_id, response) = decoded.into_parts();
                let waiter = pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&correlation_id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                    }
                    None => tracing::debug!(%correlation_id, "Dropping late or unknown reply"),
                }
                channel.lock().await.ack(tag).await
            }
            Err(err) => {
                tracing::warn!(error = %err, "Rejecting undecodable reply");
                channel.lock().await.nack(tag, false).await
            }
        };
        if let Err(err) = settled {
            tracing::error!(error = %err, delivery_tag = tag, "Failed to settle reply");
        }
    }

    closed.store(true, Ordering::Release);
    // Dropping the senders wakes every waiter with `Closed`.
    pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

/// Error returned by [`RpcClient`] operations.
#[derive(Debug)]
pub struct ClientError {
    context: SpanTrace,
    kind: ClientErrorKind,
}

/// Client error kinds.
#[derive(Debug)]
pub enum ClientErrorKind {
    Validation(ValidationError),
    Codec(CodecError),
    Transport(TransportError),
    /// No reply arrived within the response-wait timeout.
    Timeout {
        correlation_id: String,
        after: Duration,
    },
    /// The client stopped listening for replies.
    Closed,
}

impl ClientError {
    fn new(kind: ClientErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    fn validation(err: ValidationError) -> Self {
        Self::new(ClientErrorKind::Validation(err))
    }

    fn codec(err: CodecError) -> Self {
        Self::new(ClientErrorKind::Codec(err))
    }

    fn transport(err: TransportError) -> Self {
        Self::new(ClientErrorKind::Transport(err))
    }

    pub fn kind(&self) -> &ClientErrorKind {
        &self.kind
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ClientErrorKind::Timeout { .. })
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ClientErrorKind::Validation(err) => write!(f, "Invalid request: {err}"),
            ClientErrorKind::Codec(err) => write!(f, "Codec error: {err}"),
            ClientErrorKind::Transport(err) => write!(f, "Transport error: {err}"),
            ClientErrorKind::Timeout {
                correlation_id,
                after,
            } => writeln!(f, "No reply to `{correlation_id}` within {after:?}"),
            ClientErrorKind::Closed => writeln!(f, "Client closed"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ClientErrorKind::Validation(err) => Some(err),
            ClientErrorKind::Codec(err) => Some(err),
            ClientErrorKind::Transport(err) => Some(err),
            _ => None,
        }
    }
}
