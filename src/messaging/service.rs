// src/messaging/service.rs

use std::collections::HashMap;
use std::future::{self, Future};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::pending::PendingRequests;
use super::types::*;
use crate::config::MessagingConfig;
use crate::rabbitmq::{
    AmqpConnector, ConnectionManager, Connector, Consumer, ExchangeKind, HandlerResult,
    Publisher, RabbitMQError, Result,
};

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

// Names of the standard publishers
pub const INVENTORY_VERIFICATION_PUBLISHER: &str = "inventory_verification";
pub const INVENTORY_UPDATE_PUBLISHER: &str = "inventory_update";
pub const ORDER_CREATED_PUBLISHER: &str = "order_created";

const EXCHANGES: [&str; 3] = [ORDER_EXCHANGE, PRODUCT_EXCHANGE, INVENTORY_EXCHANGE];

/// State that exists once `initialize` has succeeded.
struct Registry {
    reply_queue: String,
    publishers: HashMap<&'static str, Publisher>,
    restorer: JoinHandle<()>,
}

impl Registry {
    fn publisher(&self, name: &str) -> Result<&Publisher> {
        self.publishers
            .get(name)
            .ok_or_else(|| RabbitMQError::PublisherNotConfigured(name.to_string()))
    }
}

/// Order-side messaging: topology setup, the private reply path, and the
/// inventory/order operations built on it.
pub struct MessagingService {
    connection: Arc<ConnectionManager>,
    pending: Arc<PendingRequests>,
    rpc_timeout: Duration,
    registry: OnceCell<Registry>,
}

impl MessagingService {
    /// Connects to the broker named in `config` over AMQP.
    pub async fn connect(config: &MessagingConfig) -> Result<Self> {
        let mut connector = AmqpConnector::new();
        if let Some(name) = &config.connection_name {
            connector = connector.with_connection_name(name.clone());
        }
        Self::with_connector(Arc::new(connector), config).await
    }

    /// Connects through an arbitrary broker backend.
    pub async fn with_connector(
        connector: Arc<dyn Connector>,
        config: &MessagingConfig,
    ) -> Result<Self> {
        let connection = Arc::new(
            ConnectionManager::new(&config.uri, connector)
                .with_reconnect_policy(config.connect_attempts, config.retry_delay()),
        );
        connection.connect().await?;

        Ok(MessagingService {
            connection,
            pending: Arc::new(PendingRequests::new()),
            rpc_timeout: config.rpc_timeout(),
            registry: OnceCell::new(),
        })
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn is_initialized(&self) -> bool {
        self.registry.initialized()
    }

    pub fn reply_queue(&self) -> Option<&str> {
        self.registry.get().map(|registry| registry.reply_queue.as_str())
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.pending.contains(correlation_id)
    }

    /// Declares the exchanges, sets up the reply queue and its consumer, and
    /// registers the standard publishers. Later calls are no-ops; a failed
    /// call leaves the service uninitialized.
    pub async fn initialize(&self) -> Result<()> {
        self.registry().await.map(|_| ())
    }

    async fn registry(&self) -> Result<&Registry> {
        self.registry
            .get_or_try_init(|| async {
                declare_exchanges(&self.connection).await?;

                let reply_queue = format!("{}{}", RESPONSE_QUEUE_PREFIX, Uuid::new_v4());
                start_reply_path(&self.connection, &reply_queue, &self.pending).await?;

                let standard = [
                    (INVENTORY_VERIFICATION_PUBLISHER, INVENTORY_EXCHANGE, INVENTORY_VERIFICATION_KEY),
                    (INVENTORY_UPDATE_PUBLISHER, INVENTORY_EXCHANGE, INVENTORY_UPDATE_KEY),
                    (ORDER_CREATED_PUBLISHER, ORDER_EXCHANGE, ORDER_CREATED_KEY),
                ];
                let publishers = standard
                    .into_iter()
                    .map(|(name, exchange, key)| {
                        (name, Publisher::new(Arc::clone(&self.connection), exchange, key))
                    })
                    .collect();

                let restorer = spawn_topology_restorer(
                    &self.connection,
                    reply_queue.clone(),
                    Arc::downgrade(&self.pending),
                );

                info!(reply_queue = %reply_queue, "Messaging service initialized");
                Ok::<_, RabbitMQError>(Registry {
                    reply_queue,
                    publishers,
                    restorer,
                })
            })
            .await
    }

    /// Asks the inventory service to verify `items` for `store_id` and waits
    /// up to the RPC timeout for the answer.
    pub async fn verify_inventory(
        &self,
        store_id: u64,
        items: &[InventoryItem],
    ) -> Result<InventoryVerificationResponse> {
        self.verify_inventory_until(future::pending(), store_id, items).await
    }

    /// Like [`verify_inventory`](Self::verify_inventory), but gives up with
    /// [`RabbitMQError::Cancelled`] as soon as `cancel` completes.
    #[instrument(skip(self, cancel, items), fields(items = items.len()))]
    pub async fn verify_inventory_until<C>(
        &self,
        cancel: C,
        store_id: u64,
        items: &[InventoryItem],
    ) -> Result<InventoryVerificationResponse>
    where
        C: Future<Output = ()>,
    {
        let registry = self.registry().await?;
        let publisher = registry.publisher(INVENTORY_VERIFICATION_PUBLISHER)?;

        // Registered before publishing so a fast reply cannot be missed.
        let response = self.pending.register();
        let request =
            InventoryVerificationRequest::new(response.correlation_id(), store_id, items.to_vec());
        debug!(correlation_id = %response.correlation_id(), "Sending inventory verification request");

        publisher.publish_json(&request).await?;

        let body = response.wait(self.rpc_timeout, cancel).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Tells the inventory service to apply an order's stock changes.
    pub async fn update_inventory(
        &self,
        store_id: u64,
        order_id: u64,
        items: &[InventoryItem],
    ) -> Result<()> {
        let registry = self.registry().await?;
        let request = InventoryUpdateRequest::new(store_id, order_id, items.to_vec());
        registry
            .publisher(INVENTORY_UPDATE_PUBLISHER)?
            .publish_json(&request)
            .await
    }

    /// Announces a newly created order.
    pub async fn publish_order_created(
        &self,
        order_id: u64,
        store_id: u64,
        customer: CustomerInfo,
        items: Vec<OrderItemInfo>,
        total: f64,
    ) -> Result<()> {
        let registry = self.registry().await?;
        let event = OrderCreatedEvent::new(order_id, store_id, customer, items, total);
        registry
            .publisher(ORDER_CREATED_PUBLISHER)?
            .publish_json(&event)
            .await
    }

    pub async fn close(&self) -> Result<()> {
        if let Some(registry) = self.registry.get() {
            registry.restorer.abort();
        }
        self.connection.close().await
    }
}

async fn declare_exchanges(connection: &ConnectionManager) -> Result<()> {
    for name in EXCHANGES {
        connection
            .declare_exchange(name, ExchangeKind::Topic, true)
            .await?;
    }
    Ok(())
}

/// Declares and binds the reply queue and starts its auto-ack consumer.
async fn start_reply_path(
    connection: &Arc<ConnectionManager>,
    reply_queue: &str,
    pending: &Arc<PendingRequests>,
) -> Result<()> {
    let queue = connection.declare_queue(reply_queue, false).await?;
    connection
        .bind_queue(&queue, RESPONSE_PATTERN, INVENTORY_EXCHANGE)
        .await?;

    let mut consumer = Consumer::new(Arc::clone(connection), &queue, "");
    consumer.set_auto_ack(true);
    consumer.start().await?;

    let pending = Arc::clone(pending);
    consumer.listen(move |body| {
        let outcome = handle_response(&pending, body);
        async move { outcome }
    })?;
    Ok(())
}

/// Routes a reply to the caller waiting on its correlation id. Replies
/// without one, or for ids nobody is waiting on any more, are dropped.
fn handle_response(pending: &PendingRequests, body: Vec<u8>) -> HandlerResult {
    let base: BaseMessage = serde_json::from_slice(&body)?;
    let Some(correlation_id) = base.correlation() else {
        return Ok(());
    };

    if !pending.fulfil(correlation_id, body) {
        debug!(correlation_id = %correlation_id, "Dropping reply with no pending request");
    }
    Ok(())
}

/// Rebuilds the exchanges and reply path after every reconnect.
fn spawn_topology_restorer(
    connection: &Arc<ConnectionManager>,
    reply_queue: String,
    pending: Weak<PendingRequests>,
) -> JoinHandle<()> {
    let mut reconnects = connection.subscribe_reconnects();
    let connection = Arc::downgrade(connection);

    tokio::spawn(async move {
        while reconnects.changed().await.is_ok() {
            let (Some(connection), Some(pending)) = (connection.upgrade(), pending.upgrade()) else {
                return;
            };

            let restored = async {
                declare_exchanges(&connection).await?;
                start_reply_path(&connection, &reply_queue, &pending).await
            };
            match restored.await {
                Ok(()) => info!(reply_queue = %reply_queue, "Reply path restored after reconnect"),
                Err(e) => error!(reply_queue = %reply_queue, error = %e, "Failed to restore reply path"),
            }
        }
    })
}
