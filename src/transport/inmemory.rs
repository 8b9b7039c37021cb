use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::transport::{
    BrokerChannel, Connector, Delivery, DeliveryProperties, OutboundMessage, Subscription,
    TransportError,
};

/// In-memory broker for testing or local pipelines.
///
/// Queues are created on first use and every publish is routed to the queue
/// named by its routing key, whatever the exchange. It is useful for:
/// - Unit and integration testing of hosts and clients
/// - Simulating publish failures and connection loss
/// - Inspecting what was published, acked and nacked
///
/// Prefetch limits are honoured per consumer, and unacknowledged deliveries
/// return to their queue when their channel closes or the connection drops.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Ready>>,
    consumers: Vec<Consumer>,
    unacked: HashMap<u64, Unacked>,
    published: Vec<OutboundMessage>,
    acked: Vec<u64>,
    nacked: Vec<(u64, bool)>,
    closed_channels: usize,
    next_tag: u64,
    next_channel: u64,
    next_consumer: u64,
    /// Bumped on every simulated connection loss.
    generation: u64,
    failing_publishes: usize,
    failing_connects: usize,
}

struct Ready {
    properties: DeliveryProperties,
    body: Bytes,
    redelivered: bool,
}

struct Unacked {
    queue: String,
    channel: u64,
    consumer_tag: String,
    delivery: Delivery,
}

struct Consumer {
    tag: String,
    channel: u64,
    queue: String,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Result<Delivery, TransportError>>,
}

impl Consumer {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

impl BrokerState {
    fn enqueue(&mut self, queue: &str, ready: Ready) {
        self.queues.entry(queue.to_owned()).or_default().push_back(ready);
    }

    /// Hand ready messages to consumers that still have prefetch capacity.
    fn pump(&mut self) {
        let mut progressed = true;
        while progressed {
            progressed = false;
            for index in 0..self.consumers.len() {
                let consumer = &self.consumers[index];
                if !consumer.has_capacity() {
                    continue;
                }
                let Some(ready) = self
                    .queues
                    .get_mut(&consumer.queue)
                    .and_then(VecDeque::pop_front)
                else {
                    continue;
                };

                self.next_tag += 1;
                let delivery = Delivery {
                    delivery_tag: self.next_tag,
                    redelivered: ready.redelivered,
                    properties: ready.properties,
                    body: ready.body,
                };

                let consumer = &mut self.consumers[index];
                if consumer.sender.send(Ok(delivery.clone())).is_err() {
                    // Receiver gone: put the message back and forget the consumer.
                    let queue = consumer.queue.clone();
                    self.queues.entry(queue).or_default().push_front(Ready {
                        properties: delivery.properties,
                        body: delivery.body,
                        redelivered: delivery.redelivered,
                    });
                    self.consumers.remove(index);
                    progressed = true;
                    break;
                }
                consumer.in_flight += 1;
                self.unacked.insert(
                    delivery.delivery_tag,
                    Unacked {
                        queue: consumer.queue.clone(),
                        channel: consumer.channel,
                        consumer_tag: consumer.tag.clone(),
                        delivery,
                    },
                );
                progressed = true;
            }
        }
    }

    fn settle(&mut self, delivery_tag: u64) -> Option<Unacked> {
        let unacked = self.unacked.remove(&delivery_tag)?;
        if let Some(consumer) = self
            .consumers
            .iter_mut()
            .find(|c| c.tag == unacked.consumer_tag)
        {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
        Some(unacked)
    }

    fn requeue(&mut self, unacked: Unacked) {
        self.queues
            .entry(unacked.queue)
            .or_default()
            .push_front(Ready {
                properties: unacked.delivery.properties,
                body: unacked.delivery.body,
                redelivered: true,
            });
    }

    fn requeue_where(&mut self, predicate: impl Fn(&Unacked) -> bool) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| predicate(u))
            .map(|(tag, _)| *tag)
            .collect();
        // Newest first, so the oldest ends up at the head of its queue.
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(unacked);
            }
        }
    }
}

impl InMemoryBroker {
    /// Put a raw message on a queue, bypassing any channel.
    pub async fn inject(
        &self,
        queue: &str,
        properties: DeliveryProperties,
        body: impl Into<Bytes>,
    ) {
        let mut state = self.state.lock().await;
        state.enqueue(
            queue,
            Ready {
                properties,
                body: body.into(),
                redelivered: false,
            },
        );
        state.pump();
    }

    /// Every message published so far, in publish order.
    pub async fn published(&self) -> Vec<OutboundMessage> {
        self.state.lock().await.published.clone()
    }

    /// Messages published with the given routing key.
    pub async fn published_to(&self, routing_key: &str) -> Vec<OutboundMessage> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .filter(|m| m.headers.routing_key == routing_key)
            .cloned()
            .collect()
    }

    pub async fn acked(&self) -> Vec<u64> {
        self.state.lock().await.acked.clone()
    }

    /// Negative acknowledgements as `(delivery_tag, requeue)`.
    pub async fn nacked(&self) -> Vec<(u64, bool)> {
        self.state.lock().await.nacked.clone()
    }

    pub async fn closed_channels(&self) -> usize {
        self.state.lock().await.closed_channels
    }

    /// Messages waiting on `queue`, not yet delivered.
    pub async fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    pub async fn unacked_count(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    pub async fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .consumers
            .iter()
            .filter(|c| c.queue == queue)
            .count()
    }

    /// Make the next `count` publishes fail.
    pub async fn fail_next_publishes(&self, count: usize) {
        self.state.lock().await.failing_publishes = count;
    }

    /// Make the next `count` connection attempts fail.
    pub async fn fail_next_connects(&self, count: usize) {
        self.state.lock().await.failing_connects = count;
    }

    /// Simulate connection loss.
    ///
    /// Every consumer stream yields a connection error and ends, unacked
    /// deliveries are requeued, and channels opened before the loss fail
    /// from now on.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        state.generation += 1;
        for consumer in state.consumers.drain(..) {
            let _ = consumer
                .sender
                .send(Err(TransportError::connection("connection reset by broker")));
        }
        state.requeue_where(|_| true);
        tracing::info!("In-memory broker connection dropped");
    }
}

#[async_trait::async_trait]
impl Connector for InMemoryBroker {
    type Channel = InMemoryChannel;

    async fn connect(&self) -> Result<Self::Channel, TransportError> {
        let mut state = self.state.lock().await;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(TransportError::connection("connection refused"));
        }
        state.next_channel += 1;
        Ok(InMemoryChannel {
            broker: self.clone(),
            id: state.next_channel,
            generation: state.generation,
            closed: false,
        })
    }
}

/// Channel on an [`InMemoryBroker`].
pub struct InMemoryChannel {
    broker: InMemoryBroker,
    id: u64,
    generation: u64,
    closed: bool,
}

impl InMemoryChannel {
    fn check_open(&self, state: &BrokerState) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::channel("channel closed"));
        }
        if self.generation != state.generation {
            return Err(TransportError::connection("connection lost"));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BrokerChannel for InMemoryChannel {
    /// "Publish" by routing to the queue named by the routing key.
    #[tracing::instrument(skip_all, fields(routing_key = %message.headers.routing_key))]
    async fn publish(&mut self, message: OutboundMessage) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock().await;
        self.check_open(&state)?;
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(TransportError::publish("simulated publish failure"));
        }

        state.published.push(message.clone());
        let queue = message.headers.routing_key;
        state.enqueue(
            &queue,
            Ready {
                properties: message.headers.properties,
                body: message.message,
                redelivered: false,
            },
        );
        state.pump();
        tracing::debug!("Message published to in-memory queue");
        Ok(())
    }

    async fn subscribe(
        &mut self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Subscription, TransportError> {
        let mut state = self.broker.state.lock().await;
        self.check_open(&state)?;

        state.next_consumer += 1;
        let consumer_tag = format!("ctag-{}-{}", self.id, state.next_consumer);
        let (sender, receiver) = mpsc::unbounded_channel();
        state.queues.entry(queue.to_owned()).or_default();
        state.consumers.push(Consumer {
            tag: consumer_tag.clone(),
            channel: self.id,
            queue: queue.to_owned(),
            prefetch,
            in_flight: 0,
            sender,
        });
        state.pump();

        Ok(Subscription {
            consumer_tag,
            deliveries: Box::pin(UnboundedReceiverStream::new(receiver)),
        })
    }

    async fn cancel(&mut self, consumer_tag: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock().await;
        self.check_open(&state)?;
        state.consumers.retain(|c| c.tag != consumer_tag);
        Ok(())
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock().await;
        self.check_open(&state)?;
        state.settle(delivery_tag).ok_or_else(|| {
            TransportError::channel(format!("unknown delivery tag {delivery_tag}"))
        })?;
        state.acked.push(delivery_tag);
        state.pump();
        Ok(())
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock().await;
        self.check_open(&state)?;
        let unacked = state.settle(delivery_tag).ok_or_else(|| {
            TransportError::channel(format!("unknown delivery tag {delivery_tag}"))
        })?;
        state.nacked.push((delivery_tag, requeue));
        if requeue {
            state.requeue(unacked);
        }
        state.pump();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut state = self.broker.state.lock().await;
        state.closed_channels += 1;
        let id = self.id;
        state.consumers.retain(|c| c.channel != id);
        if self.generation == state.generation {
            state.requeue_where(|u| u.channel == id);
            state.pump();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt as _;

    use super::*;
    use crate::{properties::ExchangeKind, transport::PublishMeta};

    fn message(routing_key: &str, body: &'static str) -> OutboundMessage {
        OutboundMessage {
            headers: PublishMeta {
                exchange: String::new(),
                exchange_kind: ExchangeKind::Direct,
                routing_key: routing_key.to_owned(),
                properties: DeliveryProperties::default(),
            },
            message: Bytes::from_static(body.as_bytes()),
        }
    }

    #[tokio::test]
    async fn prefetch_limits_unacked_deliveries() {
        let broker = InMemoryBroker::default();
        let mut channel = broker.connect().await.unwrap();
        for i in 0..5 {
            channel.publish(message("work", if i % 2 == 0 { "a" } else { "b" })).await.unwrap();
        }

        let mut sub = channel.subscribe("work", 2).await.unwrap();
        let first = sub.deliveries.next().await.unwrap().unwrap();
        let _second = sub.deliveries.next().await.unwrap().unwrap();
        assert_eq!(broker.queue_depth("work").await, 3);
        assert_eq!(broker.unacked_count().await, 2);

        channel.ack(first.delivery_tag).await.unwrap();
        let _third = sub.deliveries.next().await.unwrap().unwrap();
        assert_eq!(broker.queue_depth("work").await, 2);
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers() {
        let broker = InMemoryBroker::default();
        let mut channel = broker.connect().await.unwrap();
        channel.publish(message("work", "x")).await.unwrap();

        let mut sub = channel.subscribe("work", 1).await.unwrap();
        let first = sub.deliveries.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        channel.nack(first.delivery_tag, true).await.unwrap();

        let again = sub.deliveries.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.body, first.body);
        assert_eq!(broker.nacked().await, vec![(first.delivery_tag, true)]);
    }

    #[tokio::test]
    async fn close_requeues_unacked_and_counts_once() {
        let broker = InMemoryBroker::default();
        let mut channel = broker.connect().await.unwrap();
        channel.publish(message("work", "x")).await.unwrap();
        let mut sub = channel.subscribe("work", 1).await.unwrap();
        let _delivery = sub.deliveries.next().await.unwrap().unwrap();

        channel.close().await.unwrap();
        channel.close().await.unwrap();

        assert_eq!(broker.closed_channels().await, 1);
        assert_eq!(broker.queue_depth("work").await, 1);
        assert!(channel.publish(message("work", "y")).await.is_err());
    }

    #[tokio::test]
    async fn disconnect_ends_streams_with_connection_error() {
        let broker = InMemoryBroker::default();
        let mut channel = broker.connect().await.unwrap();
        let mut sub = channel.subscribe("work", 1).await.unwrap();

        broker.disconnect().await;

        let err = sub.deliveries.next().await.unwrap().unwrap_err();
        assert!(err.is_connectivity());
        assert!(sub.deliveries.next().await.is_none());
        assert!(channel.publish(message("work", "x")).await.unwrap_err().is_connectivity());
    }

    #[tokio::test]
    async fn simulated_failures() {
        let broker = InMemoryBroker::default();
        broker.fail_next_connects(1).await;
        assert!(broker.connect().await.is_err());

        let mut channel = broker.connect().await.unwrap();
        broker.fail_next_publishes(1).await;
        assert!(channel.publish(message("work", "x")).await.is_err());
        channel.publish(message("work", "x")).await.unwrap();
        assert_eq!(broker.published_to("work").await.len(), 1);
    }
}
