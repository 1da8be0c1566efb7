// src/rabbitmq/memory.rs
//! In-process broker.
//!
//! Implements the broker seam with the subset of AMQP 0-9-1 behaviour the
//! messaging layer relies on: direct, fanout and topic exchanges, durable and
//! transient queues, round-robin dispatch, manual acknowledgment and
//! nack-with-requeue. It also exposes controls to refuse connections and to
//! sever live links, which is how tests drive the reconnect paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use super::errors::{RabbitMQError, Result};
use super::transport::{
    Acknowledger, BrokerChannel, BrokerLink, ConsumeOptions, Connector, Delivery, DeliveryStream,
    ExchangeKind, PublishOptions,
};

/// A message as it was handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub persistent: bool,
    pub mandatory: bool,
    pub immediate: bool,
}

#[derive(Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    routing_key: String,
    redelivered: bool,
}

struct ConsumerSlot {
    tag: String,
    link_id: u64,
    auto_ack: bool,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

struct QueueState {
    durable: bool,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

/// A delivery handed to a manual-ack consumer and not yet settled.
struct InFlight {
    link_id: u64,
    queue: String,
    message: StoredMessage,
}

struct Binding {
    exchange: String,
    pattern: String,
    queue: String,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, (ExchangeKind, bool)>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    links: HashMap<u64, watch::Sender<Option<String>>>,
    // Keyed by delivery tag, which increases with dispatch order.
    unacked: BTreeMap<u64, InFlight>,
    published: Vec<PublishedMessage>,
    next_id: u64,
    refuse_connections: bool,
    refuse_channels: bool,
    connect_attempts: usize,
    acked: usize,
    requeued: usize,
    discarded: usize,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_link(&self, link_id: u64) -> Result<()> {
        if self.links.contains_key(&link_id) {
            Ok(())
        } else {
            Err(RabbitMQError::NotConnected)
        }
    }

    fn drop_link(&mut self, broker: &InMemoryBroker, link_id: u64, reason: &str) {
        if let Some(closed) = self.links.remove(&link_id) {
            closed.send_replace(Some(reason.to_string()));
        }
        self.cancel_consumers(broker, link_id);
    }

    /// Removes the link's consumers and puts its unsettled deliveries back
    /// at the head of their queues, flagged redelivered.
    fn cancel_consumers(&mut self, broker: &InMemoryBroker, link_id: u64) {
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|consumer| consumer.link_id != link_id);
        }

        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, in_flight)| in_flight.link_id == link_id)
            .map(|(tag, _)| *tag)
            .collect();
        let mut touched: Vec<String> = Vec::new();
        // Newest first, so the oldest delivery ends up at the head.
        for tag in tags.into_iter().rev() {
            let Some(in_flight) = self.unacked.remove(&tag) else {
                continue;
            };
            if let Some(queue) = self.queues.get_mut(&in_flight.queue) {
                let mut message = in_flight.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            if !touched.contains(&in_flight.queue) {
                touched.push(in_flight.queue);
            }
        }
        for queue in touched {
            self.dispatch(broker, &queue);
        }
    }

    fn settle(&mut self, delivery_tag: u64) -> Result<InFlight> {
        self.unacked.remove(&delivery_tag).ok_or_else(|| {
            RabbitMQError::ProtocolError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            ))
        })
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        // The default exchange routes straight to the queue named by the key.
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect());
        }

        let (kind, _) = self.exchanges.get(exchange).ok_or_else(|| {
            RabbitMQError::ProtocolError(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;

        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(&binding.pattern, routing_key),
                ExchangeKind::Direct | ExchangeKind::Headers => binding.pattern == routing_key,
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn dispatch(&mut self, broker: &InMemoryBroker, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() {
            queue.consumers.retain(|consumer| !consumer.sender.is_closed());
            if queue.consumers.is_empty() {
                break;
            }

            let index = queue.cursor % queue.consumers.len();
            queue.cursor = queue.cursor.wrapping_add(1);
            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            let consumer = &queue.consumers[index];

            self.next_id += 1;
            let delivery_tag = self.next_id;
            let acker: Box<dyn Acknowledger> = if consumer.auto_ack {
                Box::new(SettledAcker)
            } else {
                Box::new(MemoryAcker {
                    broker: broker.clone(),
                    delivery_tag,
                })
            };
            let delivery = Delivery::new(
                message.payload.clone(),
                message.routing_key.clone(),
                message.redelivered,
                acker,
            );

            debug!(queue = %queue_name, consumer = %consumer.tag, "Dispatching message");
            if consumer.sender.unbounded_send(Ok(delivery)).is_err() {
                queue.ready.push_front(message);
                queue.consumers.remove(index);
            } else if !consumer.auto_ack {
                self.unacked.insert(
                    delivery_tag,
                    InFlight {
                        link_id: consumer.link_id,
                        queue: queue_name.to_string(),
                        message,
                    },
                );
            }
        }
    }
}

/// Shared handle to one in-process broker; clones see the same state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// While set, every connection attempt fails.
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// While set, links open but channel creation fails.
    pub fn refuse_channels(&self, refuse: bool) {
        self.lock().refuse_channels = refuse;
    }

    /// Drops every live link as if the broker restarted. Delivery streams
    /// end and `closed()` resolves with `reason`. Queues and their contents
    /// survive.
    pub fn sever(&self, reason: &str) {
        let mut state = self.lock();
        let links: Vec<u64> = state.links.keys().copied().collect();
        for link_id in links {
            state.drop_link(self, link_id, reason);
        }
    }

    pub fn live_links(&self) -> usize {
        self.lock().links.len()
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.lock().exchanges.get(name).map(|(kind, _)| *kind)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn queue_is_durable(&self, name: &str) -> Option<bool> {
        self.lock().queues.get(name).map(|queue| queue.durable)
    }

    /// Messages waiting in the queue, not counting those handed to consumers.
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.lock().queues.get(name).map(|queue| queue.ready.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|queue| queue.consumers.iter().filter(|c| !c.sender.is_closed()).count())
            .unwrap_or(0)
    }

    /// `(exchange, pattern)` pairs bound to `queue`.
    pub fn bindings_for(&self, queue: &str) -> Vec<(String, String)> {
        self.lock()
            .bindings
            .iter()
            .filter(|binding| binding.queue == queue)
            .map(|binding| (binding.exchange.clone(), binding.pattern.clone()))
            .collect()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn acked_count(&self) -> usize {
        self.lock().acked
    }

    pub fn requeued_count(&self) -> usize {
        self.lock().requeued
    }

    pub fn discarded_count(&self) -> usize {
        self.lock().discarded
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self, _uri: &str) -> Result<Arc<dyn BrokerLink>> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if state.refuse_connections {
            return Err(RabbitMQError::ConnectionError(
                "connection refused".to_string(),
            ));
        }

        let id = state.next_id();
        let (closed_tx, closed_rx) = watch::channel(None);
        state.links.insert(id, closed_tx);
        Ok(Arc::new(MemoryLink {
            id,
            broker: self.clone(),
            closed: closed_rx,
        }))
    }
}

struct MemoryLink {
    id: u64,
    broker: InMemoryBroker,
    closed: watch::Receiver<Option<String>>,
}

#[async_trait]
impl BrokerLink for MemoryLink {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let state = self.broker.lock();
        state.ensure_link(self.id)?;
        if state.refuse_channels {
            return Err(RabbitMQError::ProtocolError(
                "channel open refused".to_string(),
            ));
        }
        Ok(Arc::new(MemoryChannel {
            link_id: self.id,
            broker: self.broker.clone(),
        }))
    }

    async fn closed(&self) -> String {
        let mut closed = self.closed.clone();
        let reason = match closed.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "broker dropped".to_string(),
        };
        reason
    }

    async fn close(&self) -> Result<()> {
        self.broker
            .lock()
            .drop_link(&self.broker, self.id, "connection closed by application");
        Ok(())
    }
}

struct MemoryChannel {
    link_id: u64,
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_link(self.link_id)?;
        match state.exchanges.get(name) {
            Some(existing) if *existing != (kind, durable) => Err(RabbitMQError::ProtocolError(
                format!("PRECONDITION_FAILED - inequivalent arg for exchange '{}'", name),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), (kind, durable));
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<String> {
        let mut state = self.broker.lock();
        state.ensure_link(self.link_id)?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            name.to_string()
        };

        match state.queues.get(&name) {
            Some(queue) if queue.durable != durable => Err(RabbitMQError::ProtocolError(format!(
                "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}'",
                name
            ))),
            Some(_) => Ok(name),
            None => {
                state.queues.insert(
                    name.clone(),
                    QueueState {
                        durable,
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        cursor: 0,
                    },
                );
                Ok(name)
            }
        }
    }

    async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_link(self.link_id)?;
        if !state.queues.contains_key(queue) {
            return Err(RabbitMQError::ProtocolError(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(RabbitMQError::ProtocolError(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }

        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == routing_key);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                pattern: routing_key.to_string(),
                queue: queue.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_link(self.link_id)?;
        let targets = state.route(exchange, routing_key)?;

        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            content_type: options.content_type.clone(),
            persistent: options.persistent,
            mandatory: options.mandatory,
            immediate: options.immediate,
        });

        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.ready.push_back(StoredMessage {
                    payload: payload.to_vec(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                });
            }
            state.dispatch(&self.broker, &target);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream> {
        let mut state = self.broker.lock();
        state.ensure_link(self.link_id)?;
        let tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", state.next_id())
        } else {
            consumer_tag.to_string()
        };

        let queue_state = state.queues.get_mut(queue).ok_or_else(|| {
            RabbitMQError::ProtocolError(format!("NOT_FOUND - no queue '{}'", queue))
        })?;
        queue_state.consumers.retain(|c| !c.sender.is_closed());
        if options.exclusive && !queue_state.consumers.is_empty() {
            return Err(RabbitMQError::ProtocolError(format!(
                "ACCESS_REFUSED - queue '{}' already has consumers",
                queue
            )));
        }

        let (sender, receiver) = mpsc::unbounded();
        queue_state.consumers.push(ConsumerSlot {
            tag,
            link_id: self.link_id,
            auto_ack: options.auto_ack,
            sender,
        });
        state.dispatch(&self.broker, queue);
        Ok(receiver.boxed())
    }

    async fn close(&self) -> Result<()> {
        self.broker
            .lock()
            .cancel_consumers(&self.broker, self.link_id);
        Ok(())
    }
}

/// Acknowledger for auto-ack deliveries; the broker already settled them.
struct SettledAcker;

#[async_trait]
impl Acknowledger for SettledAcker {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<()> {
        Ok(())
    }
}

/// Settles a manual-ack delivery. Fails once the delivery has gone back to
/// its queue because the consumer's link dropped.
struct MemoryAcker {
    broker: InMemoryBroker,
    delivery_tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let mut state = self.broker.lock();
        state.settle(self.delivery_tag)?;
        state.acked += 1;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let mut state = self.broker.lock();
        let in_flight = state.settle(self.delivery_tag)?;
        if !requeue {
            state.discarded += 1;
            return Ok(());
        }

        state.requeued += 1;
        if let Some(queue) = state.queues.get_mut(&in_flight.queue) {
            let mut message = in_flight.message;
            message.redelivered = true;
            queue.ready.push_front(message);
        }
        state.dispatch(&self.broker, &in_flight.queue);
        Ok(())
    }
}

/// AMQP topic matching: `*` matches exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}
