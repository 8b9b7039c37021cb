//! Broker capability traits and backends.
//!
//! The host never talks to a broker client library directly. It goes through
//! two small capability traits so the dispatch loop can run against an
//! in-memory fake as easily as against RabbitMQ:
//!
//! - [`Connector`]: opens a channel (and reopens one after connection loss)
//! - [`BrokerChannel`]: publish, subscribe, ack/nack, cancel, close
//!
//! Channels take `&mut self` everywhere; callers that share a channel between
//! workers wrap it in `Arc<tokio::sync::Mutex<_>>`, which serializes every
//! publish and acknowledgement through one owner at a time.
//!
//! ## Key components
//!
//! - [`Delivery`]: one inbound broker message
//! - [`OutboundMessage`]: an encoded message plus its publish targeting
//! - [`InMemoryBroker`]: in-process broker for tests and demos
//! - [`TransportError`]: unified error type with tracing context

mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use tracing_error::SpanTrace;

use crate::{
    Envelope,
    properties::{ExchangeKind, Headers},
};

pub use inmemory::{InMemoryBroker, InMemoryChannel};

/// Broker message properties, shared by inbound and outbound messages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    /// Durability flag; `None` when the delivery did not state it.
    pub persistent: Option<bool>,
    /// Broker-side TTL; `None` means no expiry.
    pub expiration: Option<Duration>,
    pub headers: Headers,
    pub timestamp: Option<DateTime<Utc>>,
}

/// One message received from a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Channel-scoped tag used to ack or nack this delivery.
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub properties: DeliveryProperties,
    pub body: Bytes,
}

/// Where and how an outbound message is published.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishMeta {
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub routing_key: String,
    pub properties: DeliveryProperties,
}

/// Encoded message ready to hand to [`BrokerChannel::publish`].
pub type OutboundMessage = Envelope<PublishMeta, Bytes>;

/// Active consumer on a queue.
///
/// The stream ends when the consumer is cancelled or the channel goes away.
pub struct Subscription {
    pub consumer_tag: String,
    pub deliveries: BoxStream<'static, Result<Delivery, TransportError>>,
}

/// Channel-level broker operations.
#[async_trait::async_trait]
pub trait BrokerChannel: Send + 'static {
    /// Publish a message and wait for the broker to accept it.
    async fn publish(&mut self, message: OutboundMessage) -> Result<(), TransportError>;

    /// Start consuming `queue`, letting at most `prefetch` deliveries be
    /// unacknowledged at once.
    async fn subscribe(&mut self, queue: &str, prefetch: u16)
    -> Result<Subscription, TransportError>;

    /// Stop a consumer. No new deliveries arrive afterwards.
    async fn cancel(&mut self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    /// Release the channel. Unacknowledged deliveries return to their queue.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens broker channels.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    type Channel: BrokerChannel;

    async fn connect(&self) -> Result<Self::Channel, TransportError>;
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// The broker refused or failed to confirm a publish.
    Publish(tower::BoxError),
    /// A channel operation (consume, ack, nack, cancel, close) failed.
    Channel(tower::BoxError),
    /// The connection could not be established or was lost.
    Connection(tower::BoxError),
}

impl TransportError {
    /// Create a publish-related transport error.
    pub fn publish(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Publish(err.into()),
        }
    }

    /// Create a channel-related transport error.
    pub fn channel(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Channel(err.into()),
        }
    }

    /// Create a connectivity-related transport error.
    pub fn connection(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Connection(err.into()),
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self.kind, TransportErrorKind::Connection(_))
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Publish(err) => writeln!(f, "Publish error: {err}"),
            TransportErrorKind::Channel(err) => writeln!(f, "Channel error: {err}"),
            TransportErrorKind::Connection(err) => writeln!(f, "Connection error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Publish(err) => Some(err.as_ref()),
            TransportErrorKind::Channel(err) => Some(err.as_ref()),
            TransportErrorKind::Connection(err) => Some(err.as_ref()),
        }
    }
}
