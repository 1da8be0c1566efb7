// src/rabbitmq/amqp_client.rs

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery as AmqpDelivery, options::*, types::FieldTable, types::LongString,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::watch;
use tracing::{debug, info};

use super::errors::{RabbitMQError, Result};
use super::transport::{
    Acknowledger, BrokerChannel, BrokerLink, ConsumeOptions, Connector, Delivery, DeliveryStream,
    ExchangeKind, PublishOptions,
};

/// Opens lapin connections.
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector {
    connection_name: Option<String>,
}

impl AmqpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name shown for the connection in the management UI.
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    fn properties(&self) -> ConnectionProperties {
        let properties = ConnectionProperties::default();
        match &self.connection_name {
            Some(name) => properties.with_connection_name(LongString::from(name.clone())),
            None => properties,
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerLink>> {
        let connection = Connection::connect(uri, self.properties())
            .await
            .map_err(|e| RabbitMQError::ConnectionError(format!("Failed to connect: {}", e)))?;

        let (closed_tx, closed_rx) = watch::channel(None);
        let closed_tx = Arc::new(closed_tx);
        let on_error = Arc::clone(&closed_tx);
        connection.on_error(move |err| {
            on_error.send_replace(Some(err.to_string()));
        });

        debug!("AMQP connection established");
        Ok(Arc::new(AmqpLink {
            connection,
            closed_tx,
            closed_rx,
        }))
    }
}

struct AmqpLink {
    connection: Connection,
    closed_tx: Arc<watch::Sender<Option<String>>>,
    closed_rx: watch::Receiver<Option<String>>,
}

#[async_trait]
impl BrokerLink for AmqpLink {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ConnectionError(format!("Failed to create channel: {}", e)))?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn closed(&self) -> String {
        let mut closed = self.closed_rx.clone();
        let reason = match closed.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "connection dropped".to_string(),
        };
        reason
    }

    async fn close(&self) -> Result<()> {
        info!("Closing RabbitMQ connection gracefully");
        let result = self.connection.close(200, "Closing connection").await;
        self.closed_tx
            .send_replace(Some("connection closed by application".to_string()));
        result.map_err(RabbitMQError::from)
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        };
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<()> {
        let delivery_mode = if options.persistent { 2 } else { 1 };
        let properties = BasicProperties::default()
            .with_content_type(options.content_type.clone().into())
            .with_delivery_mode(delivery_mode);

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: options.mandatory,
                    immediate: options.immediate,
                },
                payload,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.auto_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;

        let deliveries = consumer.map(|delivery| match delivery {
            Ok(delivery) => Ok(into_delivery(delivery)),
            Err(e) => Err(RabbitMQError::from(e)),
        });
        Ok(deliveries.boxed())
    }

    async fn close(&self) -> Result<()> {
        self.channel.close(200, "Closing channel").await?;
        Ok(())
    }
}

fn into_delivery(mut delivery: AmqpDelivery) -> Delivery {
    let data = std::mem::take(&mut delivery.data);
    let routing_key = delivery.routing_key.as_str().to_string();
    let redelivered = delivery.redelivered;
    Delivery::new(data, routing_key, redelivered, Box::new(AmqpAcker { delivery }))
}

struct AmqpAcker {
    delivery: AmqpDelivery,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.delivery.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.delivery
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await?;
        Ok(())
    }
}
