use std::sync::Arc;
use std::time::Duration;

use order_messaging::rabbitmq::{InMemoryBroker, RabbitMQError};
use order_messaging::MessagingService;
use serde_json::json;
use tokio::time::timeout;

use crate::common::*;

#[tokio::test(start_paused = true)]
async fn test_connect_gives_up_when_broker_is_unreachable() {
    let broker = InMemoryBroker::new();
    broker.refuse_connections(true);

    let result =
        MessagingService::with_connector(Arc::new(broker.clone()), &test_config()).await;

    assert!(matches!(result, Err(RabbitMQError::ConnectionError(_))));
    assert_eq!(broker.connect_attempts(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_reply_path_survives_reconnect() {
    let broker = InMemoryBroker::new();
    let service = connect_service(&broker).await;
    service.initialize().await.unwrap();
    let reply_queue = service.reply_queue().unwrap().to_string();

    broker.sever("broker restart");
    wait_until(|| service.connection().generation() == 2).await;
    wait_until(|| broker.consumer_count(&reply_queue) == 1).await;

    assert!(service.connection().is_connected());
    assert_eq!(service.reply_queue(), Some(reply_queue.as_str()));
    assert_eq!(
        broker.bindings_for(&reply_queue),
        vec![("inventory".to_string(), "response.*".to_string())]
    );

    let _responder = spawn_responder(&broker, |_| json!({ "valid": true, "items": [] })).await;
    let response = timeout(Duration::from_secs(1), service.verify_inventory(42, &one_item()))
        .await
        .unwrap()
        .unwrap();
    assert!(response.valid);
}

#[tokio::test(start_paused = true)]
async fn test_failed_initialize_can_be_retried() {
    let broker = InMemoryBroker::new();
    let service = connect_service(&broker).await;

    broker.refuse_connections(true);
    broker.sever("broker down");
    wait_until(|| !service.connection().is_connected()).await;

    assert!(matches!(service.initialize().await, Err(RabbitMQError::NotConnected)));
    assert!(!service.is_initialized());

    broker.refuse_connections(false);
    wait_until(|| service.connection().is_connected()).await;

    service.initialize().await.unwrap();
    assert!(service.is_initialized());
}

#[tokio::test(start_paused = true)]
async fn test_close_stops_reconnection() {
    let broker = InMemoryBroker::new();
    let service = connect_service(&broker).await;
    service.initialize().await.unwrap();

    service.close().await.unwrap();
    service.close().await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(!service.connection().is_connected());
    assert_eq!(broker.live_links(), 0);
    assert_eq!(broker.connect_attempts(), 1);
    assert!(matches!(
        service.update_inventory(1, 2, &[]).await,
        Err(RabbitMQError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_close_during_outage_is_not_undone_by_recovery() {
    let broker = InMemoryBroker::new();
    let service = connect_service(&broker).await;
    service.initialize().await.unwrap();

    broker.refuse_connections(true);
    broker.sever("broker down");
    wait_until(|| !service.connection().is_connected()).await;

    service.close().await.unwrap();
    broker.refuse_connections(false);
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(!service.connection().is_connected());
    assert_eq!(service.connection().generation(), 1);
    assert_eq!(broker.live_links(), 0);
}
