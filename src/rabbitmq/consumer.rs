// src/rabbitmq/consumer.rs

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};
use super::transport::{ConsumeOptions, DeliveryStream};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Pulls deliveries from one queue and hands each payload to a handler.
///
/// In manual-ack mode (the default) a handler returning `Ok` acknowledges the
/// delivery and an `Err` nacks it with requeue. There is no retry cap and no
/// backoff, so a handler that always fails sees the same message forever.
pub struct Consumer {
    connection: Arc<ConnectionManager>,
    queue: String,
    consumer_tag: String,
    options: ConsumeOptions,
    deliveries: Option<DeliveryStream>,
}

impl Consumer {
    pub fn new(connection: Arc<ConnectionManager>, queue: &str, consumer_tag: &str) -> Self {
        Consumer {
            connection,
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            options: ConsumeOptions::default(),
            deliveries: None,
        }
    }

    // Options only take effect at the next start().
    pub fn set_auto_ack(&mut self, auto_ack: bool) {
        self.options.auto_ack = auto_ack;
    }

    pub fn set_exclusive(&mut self, exclusive: bool) {
        self.options.exclusive = exclusive;
    }

    pub fn set_no_local(&mut self, no_local: bool) {
        self.options.no_local = no_local;
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn start(&mut self) -> Result<()> {
        if !self.connection.is_connected() {
            return Err(RabbitMQError::NotConnected);
        }

        let deliveries = self
            .connection
            .consume(&self.queue, &self.consumer_tag, self.options)
            .await?;
        self.deliveries = Some(deliveries);

        info!(queue = %self.queue, auto_ack = self.options.auto_ack, "Started consuming");
        Ok(())
    }

    /// Spawns the dispatch loop. It runs until the delivery stream closes,
    /// which happens when the connection goes away.
    pub fn listen<F, Fut>(&mut self, handler: F) -> Result<JoinHandle<()>>
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let mut deliveries = self
            .deliveries
            .take()
            .ok_or_else(|| RabbitMQError::ConsumerNotStarted(self.queue.clone()))?;
        let queue = self.queue.clone();
        let auto_ack = self.options.auto_ack;

        Ok(tokio::spawn(async move {
            while let Some(delivery_result) = deliveries.next().await {
                let mut delivery = match delivery_result {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        error!(queue = %queue, error = %e, "Error receiving message");
                        continue;
                    }
                };

                let payload = std::mem::take(&mut delivery.data);
                let outcome = handler(payload).await;

                if auto_ack {
                    if let Err(e) = outcome {
                        error!(queue = %queue, error = %e, "Error handling message");
                    }
                    continue;
                }

                match outcome {
                    Ok(()) => {
                        if let Err(e) = delivery.ack().await {
                            error!(queue = %queue, error = %e, "Failed to acknowledge message");
                        }
                    }
                    Err(e) => {
                        error!(queue = %queue, error = %e, "Error handling message, requeueing");
                        if let Err(e) = delivery.nack(true).await {
                            error!(queue = %queue, error = %e, "Failed to negatively acknowledge message");
                        }
                    }
                }
            }
            debug!(queue = %queue, "Deliveries stream closed");
        }))
    }
}
