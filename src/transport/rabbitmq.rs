//! RabbitMQ backend built on `lapin`.
//!
//! Each [`RabbitMqConnector::connect`] opens a fresh AMQP connection with a
//! single channel in publisher-confirm mode, so reconnecting after a
//! connection loss is just another `connect`.
//!
//! ## Mapping
//!
//! - `DeliveryProperties::persistent` → delivery mode 2 (persistent) or 1
//! - `DeliveryProperties::expiration` → per-message TTL in milliseconds
//! - `DeliveryProperties::headers` → AMQP header table
//! - `PublishMeta::{exchange, routing_key}` → publish targeting

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lapin::{
    BasicProperties, Connection, ConnectionProperties,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
    },
    types::{AMQPValue, ByteArray, FieldTable, LongString, ShortString},
};
use tokio_stream::StreamExt as _;

use crate::{
    properties::{FieldValue, Headers},
    transport::{
        BrokerChannel, Connector, Delivery, DeliveryProperties, OutboundMessage, Subscription,
        TransportError,
    },
};

const PERSISTENT: u8 = 2;
const TRANSIENT: u8 = 1;

/// Opens RabbitMQ channels from an AMQP URI.
#[derive(Debug, Clone)]
pub struct RabbitMqConnector {
    uri: String,
}

impl RabbitMqConnector {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl Connector for RabbitMqConnector {
    type Channel = RabbitMq;

    async fn connect(&self) -> Result<Self::Channel, TransportError> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(TransportError::connection)?;
        let channel = connection
            .create_channel()
            .await
            .map_err(TransportError::connection)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(TransportError::channel)?;
        tracing::info!(channel_id = channel.id(), "RabbitMQ channel opened");

        Ok(RabbitMq {
            connection,
            channel,
            closed: false,
        })
    }
}

/// RabbitMQ channel with its owning connection.
pub struct RabbitMq {
    connection: Connection,
    channel: lapin::Channel,
    closed: bool,
}

#[async_trait]
impl BrokerChannel for RabbitMq {
    /// Publish and wait for the broker's confirmation.
    ///
    /// A negative confirmation is reported as a publish error.
    #[tracing::instrument(
        skip_all,
        fields(exchange = %message.headers.exchange, routing_key = %message.headers.routing_key)
    )]
    async fn publish(&mut self, message: OutboundMessage) -> Result<(), TransportError> {
        let (meta, body) = message.into_parts();
        let confirmation = self
            .channel
            .basic_publish(
                &meta.exchange,
                &meta.routing_key,
                BasicPublishOptions::default(),
                &body,
                to_amqp_properties(&meta.properties),
            )
            .await
            .map_err(TransportError::publish)?
            .await
            .map_err(TransportError::publish)?;

        if confirmation.is_nack() {
            return Err(TransportError::publish("broker rejected the message"));
        }
        Ok(())
    }

    async fn subscribe(
        &mut self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Subscription, TransportError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(TransportError::channel)?;

        let consumer_tag = format!("courier-{}", uuid::Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(TransportError::channel)?;

        let deliveries = consumer.map(|delivery| {
            delivery
                .map(|delivery| Delivery {
                    delivery_tag: delivery.delivery_tag,
                    redelivered: delivery.redelivered,
                    properties: from_amqp_properties(&delivery.properties),
                    body: delivery.data.into(),
                })
                .map_err(TransportError::connection)
        });

        Ok(Subscription {
            consumer_tag,
            deliveries: Box::pin(deliveries),
        })
    }

    async fn cancel(&mut self, consumer_tag: &str) -> Result<(), TransportError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(TransportError::channel)
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(TransportError::channel)
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(TransportError::channel)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        // Either may already be gone after a connection loss.
        if self.channel.status().connected() {
            self.channel
                .close(200, "OK")
                .await
                .map_err(TransportError::channel)?;
        }
        if self.connection.status().connected() {
            self.connection
                .close(200, "OK")
                .await
                .map_err(TransportError::connection)?;
        }
        Ok(())
    }
}

fn to_amqp_properties(props: &DeliveryProperties) -> BasicProperties {
    let mut amqp = BasicProperties::default();
    if let Some(id) = &props.correlation_id {
        amqp = amqp.with_correlation_id(ShortString::from(id.clone()));
    }
    if let Some(reply_to) = &props.reply_to {
        amqp = amqp.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(content_type) = &props.content_type {
        amqp = amqp.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(persistent) = props.persistent {
        amqp = amqp.with_delivery_mode(if persistent { PERSISTENT } else { TRANSIENT });
    }
    if let Some(ttl) = props.expiration {
        amqp = amqp.with_expiration(ShortString::from(ttl.as_millis().to_string()));
    }
    if let Some(timestamp) = props.timestamp {
        amqp = amqp.with_timestamp(u64::try_from(timestamp.timestamp()).unwrap_or_default());
    }
    if !props.headers.is_empty() {
        let mut table = FieldTable::default();
        for (name, value) in &props.headers {
            table.insert(ShortString::from(name.clone()), to_amqp_value(value));
        }
        amqp = amqp.with_headers(table);
    }
    amqp
}

fn from_amqp_properties(amqp: &BasicProperties) -> DeliveryProperties {
    let text = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_owned());
    DeliveryProperties {
        correlation_id: text(amqp.correlation_id()),
        reply_to: text(amqp.reply_to()),
        content_type: text(amqp.content_type()),
        persistent: amqp.delivery_mode().map(|mode| mode == PERSISTENT),
        expiration: amqp
            .expiration()
            .as_ref()
            .and_then(|ms| ms.as_str().parse().ok())
            .map(Duration::from_millis),
        headers: amqp
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default(),
        timestamp: amqp
            .timestamp()
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
    }
}

fn to_amqp_value(value: &FieldValue) -> AMQPValue {
    match value {
        FieldValue::Bool(b) => AMQPValue::Boolean(*b),
        FieldValue::Int(i) => AMQPValue::LongLongInt(*i),
        FieldValue::Float(f) => AMQPValue::Double(*f),
        FieldValue::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        FieldValue::Bytes(b) => AMQPValue::ByteArray(ByteArray::from(b.clone())),
    }
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(name, value)| {
            from_amqp_value(value).map(|value| (name.as_str().to_owned(), value))
        })
        .collect()
}

/// Nested tables, arrays and decimals are dropped.
fn from_amqp_value(value: &AMQPValue) -> Option<FieldValue> {
    let value = match value {
        AMQPValue::Boolean(b) => FieldValue::Bool(*b),
        AMQPValue::ShortShortInt(i) => FieldValue::Int(i64::from(*i)),
        AMQPValue::ShortShortUInt(i) => FieldValue::Int(i64::from(*i)),
        AMQPValue::ShortInt(i) => FieldValue::Int(i64::from(*i)),
        AMQPValue::ShortUInt(i) => FieldValue::Int(i64::from(*i)),
        AMQPValue::LongInt(i) => FieldValue::Int(i64::from(*i)),
        AMQPValue::LongUInt(i) => FieldValue::Int(i64::from(*i)),
        AMQPValue::LongLongInt(i) => FieldValue::Int(*i),
        AMQPValue::Timestamp(t) => FieldValue::Int(i64::try_from(*t).ok()?),
        AMQPValue::Float(f) => FieldValue::Float(f64::from(*f)),
        AMQPValue::Double(f) => FieldValue::Float(*f),
        AMQPValue::ShortString(s) => FieldValue::String(s.as_str().to_owned()),
        AMQPValue::LongString(s) => {
            FieldValue::String(String::from_utf8_lossy(s.as_bytes()).into_owned())
        }
        AMQPValue::ByteArray(b) => FieldValue::Bytes(b.as_slice().to_vec()),
        _ => return None,
    };
    Some(value)
}
