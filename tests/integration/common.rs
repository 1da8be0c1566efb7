use std::sync::Arc;
use std::time::Duration;

use order_messaging::messaging::{
    InventoryItem, InventoryVerificationRequest, INVENTORY_EXCHANGE, INVENTORY_VERIFICATION_KEY,
};
use order_messaging::rabbitmq::{
    ConnectionManager, Consumer, ExchangeKind, HandlerError, InMemoryBroker, Publisher,
};
use order_messaging::{MessagingConfig, MessagingService};
use serde_json::Value;

pub const REPLY_KEY: &str = "response.inventory";

pub fn test_config() -> MessagingConfig {
    MessagingConfig {
        uri: "memory://".to_string(),
        ..MessagingConfig::default()
    }
}

pub async fn connect_service(broker: &InMemoryBroker) -> MessagingService {
    MessagingService::with_connector(Arc::new(broker.clone()), &test_config())
        .await
        .unwrap()
}

pub async fn connect_manager(broker: &InMemoryBroker) -> Arc<ConnectionManager> {
    let manager = Arc::new(ConnectionManager::new("memory://", Arc::new(broker.clone())));
    manager.connect().await.unwrap();
    manager
}

pub fn one_item() -> Vec<InventoryItem> {
    vec![InventoryItem {
        sku_id: 1,
        quantity: 2,
        price: 9.99,
    }]
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Stands in for the inventory service: answers every verification request
/// with the body produced by `reply`, tagged with the request's correlation
/// id and sent to `response.inventory`.
pub async fn spawn_responder<F>(broker: &InMemoryBroker, reply: F) -> Arc<ConnectionManager>
where
    F: Fn(&InventoryVerificationRequest) -> Value + Send + Sync + 'static,
{
    let manager = connect_manager(broker).await;
    manager
        .declare_exchange(INVENTORY_EXCHANGE, ExchangeKind::Topic, true)
        .await
        .unwrap();
    let queue = manager.declare_queue("inventory-service", true).await.unwrap();
    manager
        .bind_queue(&queue, INVENTORY_VERIFICATION_KEY, INVENTORY_EXCHANGE)
        .await
        .unwrap();

    let publisher = Arc::new(Publisher::new(
        Arc::clone(&manager),
        INVENTORY_EXCHANGE,
        REPLY_KEY,
    ));
    let reply = Arc::new(reply);

    let mut consumer = Consumer::new(Arc::clone(&manager), &queue, "inventory-service");
    consumer.start().await.unwrap();
    consumer
        .listen(move |body| {
            let publisher = Arc::clone(&publisher);
            let reply = Arc::clone(&reply);
            async move {
                let request: InventoryVerificationRequest = serde_json::from_slice(&body)?;
                let mut response = reply(&request);
                response["correlation_id"] = request.base.correlation_id.clone().into();
                publisher.publish_json(&response).await?;
                Ok::<(), HandlerError>(())
            }
        })
        .unwrap();
    manager
}
