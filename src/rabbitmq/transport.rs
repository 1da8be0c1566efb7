// src/rabbitmq/transport.rs
//! Broker seam.
//!
//! Everything above this module talks to the broker through these traits, so
//! the same connection, publisher and consumer code runs against lapin in
//! production and against [`InMemoryBroker`](super::memory::InMemoryBroker)
//! in tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::errors::Result;

/// Stream of inbound deliveries for one consumer. Ends when the channel or
/// link carrying it goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        };
        f.write_str(name)
    }
}

/// Per-message publish settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    pub content_type: String,
    /// Delivery mode 2: the broker writes the message to disk.
    pub persistent: bool,
    pub mandatory: bool,
    pub immediate: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            content_type: "application/json".to_string(),
            persistent: true,
            mandatory: false,
            immediate: false,
        }
    }
}

/// Consumer subscription settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// The broker considers a message settled as soon as it is sent.
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// An inbound message plus the handle used to settle it.
pub struct Delivery {
    pub data: Vec<u8>,
    pub routing_key: String,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        data: Vec<u8>,
        routing_key: impl Into<String>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            data,
            routing_key: routing_key.into(),
            redelivered,
            acker,
        }
    }

    /// Removes the message from its queue.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Rejects the message; with `requeue` it goes back to the queue.
    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Opens links to a broker.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerLink>>;
}

/// One physical connection.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Resolves with a reason once the link is gone, by error or by close.
    async fn closed(&self) -> String;

    async fn close(&self) -> Result<()>;
}

/// A communication channel multiplexed over a link.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()>;

    /// Returns the effective queue name; an empty `name` asks the broker to
    /// generate one.
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<String>;

    async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<()>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream>;

    async fn close(&self) -> Result<()>;
}
