// src/rabbitmq/mod.rs
// Broker plumbing: the transport seam, its lapin and in-memory backends, and
// the connection/publisher/consumer primitives built on top.

pub mod errors;
pub mod transport;
pub mod amqp_client;
pub mod memory;
pub mod connection;
pub mod publisher;
pub mod consumer;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::AmqpConnector;
pub use connection::ConnectionManager;
pub use consumer::{Consumer, HandlerError, HandlerResult};
pub use errors::{RabbitMQError, Result};
pub use memory::InMemoryBroker;
pub use publisher::Publisher;
pub use transport::{
    Acknowledger, BrokerChannel, BrokerLink, ConsumeOptions, Connector, Delivery, DeliveryStream,
    ExchangeKind, PublishOptions,
};
