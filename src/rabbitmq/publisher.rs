// src/rabbitmq/publisher.rs

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};
use super::transport::PublishOptions;

/// Publishes to one fixed exchange and routing key.
pub struct Publisher {
    connection: Arc<ConnectionManager>,
    exchange: String,
    routing_key: String,
    mandatory: bool,
    immediate: bool,
}

impl Publisher {
    pub fn new(connection: Arc<ConnectionManager>, exchange: &str, routing_key: &str) -> Self {
        Publisher {
            connection,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            mandatory: false,
            immediate: false,
        }
    }

    pub fn set_mandatory(&mut self, mandatory: bool) {
        self.mandatory = mandatory;
    }

    pub fn set_immediate(&mut self, immediate: bool) {
        self.immediate = immediate;
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub async fn publish_json<T: Serialize>(&self, message: &T) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.publish(&payload, "application/json").await
    }

    /// Sends `body` with persistent delivery mode.
    pub async fn publish(&self, body: &[u8], content_type: &str) -> Result<()> {
        if !self.connection.is_connected() {
            return Err(RabbitMQError::NotConnected);
        }

        let options = PublishOptions {
            content_type: content_type.to_string(),
            persistent: true,
            mandatory: self.mandatory,
            immediate: self.immediate,
        };
        self.connection
            .publish(&self.exchange, &self.routing_key, body, &options)
            .await?;

        debug!(
            exchange = %self.exchange,
            routing_key = %self.routing_key,
            bytes = body.len(),
            "Published message"
        );
        Ok(())
    }
}
