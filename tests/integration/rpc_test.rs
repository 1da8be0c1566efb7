use std::time::Duration;

use futures::future::join_all;
use order_messaging::messaging::{
    InventoryItem, InventoryVerificationResponse, VerifiedItem, INVENTORY_EXCHANGE,
    INVENTORY_VERIFICATION_KEY, INVENTORY_VERIFICATION_REQUEST_TYPE,
};
use order_messaging::rabbitmq::{ExchangeKind, PublishOptions};
use order_messaging::RabbitMQError;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::{timeout, Instant};

use crate::common::*;

#[tokio::test]
async fn test_verify_inventory_round_trip() {
    let broker = order_messaging::rabbitmq::InMemoryBroker::new();
    let service = connect_service(&broker).await;
    service.initialize().await.unwrap();
    let _responder = spawn_responder(&broker, |_| {
        json!({
            "type": "inventory.verification.response",
            "valid": true,
            "items": [{ "sku_id": 1, "valid": true, "in_stock": true, "actual_price": 9.99 }]
        })
    })
    .await;

    let response = timeout(Duration::from_secs(1), service.verify_inventory(42, &one_item()))
        .await
        .unwrap()
        .unwrap();

    assert!(response.valid);
    assert_eq!(
        response.items,
        vec![VerifiedItem {
            sku_id: 1,
            valid: true,
            in_stock: true,
            price: 9.99,
            messages: vec![],
        }]
    );
    assert_eq!(service.pending_requests(), 0);

    // The request went out tagged and correlated.
    let request = broker
        .published()
        .into_iter()
        .find(|message| message.routing_key == INVENTORY_VERIFICATION_KEY)
        .unwrap();
    assert_eq!(request.exchange, INVENTORY_EXCHANGE);
    let body: Value = serde_json::from_slice(&request.payload).unwrap();
    assert_eq!(body["type"], INVENTORY_VERIFICATION_REQUEST_TYPE);
    assert_eq!(body["store_id"], 42);
    assert_eq!(body["correlation_id"], response.base.correlation_id.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_verify_inventory_times_out_after_ten_seconds() {
    let broker = order_messaging::rabbitmq::InMemoryBroker::new();
    let service = connect_service(&broker).await;
    service.initialize().await.unwrap();

    let started = Instant::now();
    let result = service.verify_inventory(42, &one_item()).await;

    assert!(matches!(result, Err(RabbitMQError::TimeoutError(d)) if d == Duration::from_secs(10)));
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(service.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_configured_rpc_timeout_is_used() {
    let broker = order_messaging::rabbitmq::InMemoryBroker::new();
    let config = order_messaging::MessagingConfig {
        rpc_timeout_ms: 250,
        ..test_config()
    };
    let service = order_messaging::MessagingService::with_connector(
        std::sync::Arc::new(broker.clone()),
        &config,
    )
    .await
    .unwrap();

    let result = service.verify_inventory(42, &one_item()).await;

    assert!(matches!(result, Err(RabbitMQError::TimeoutError(d)) if d == Duration::from_millis(250)));
}

#[tokio::test]
async fn test_concurrent_calls_receive_only_their_own_reply() {
    let broker = order_messaging::rabbitmq::InMemoryBroker::new();
    let service = connect_service(&broker).await;
    service.initialize().await.unwrap();
    let _responder = spawn_responder(&broker, |request| {
        json!({
            "valid": request.store_id % 2 == 0,
            "message": format!("store {}", request.store_id),
            "items": []
        })
    })
    .await;

    let calls = (1..=20u64).map(|store_id| {
        let service = &service;
        async move {
            let items = vec![InventoryItem {
                sku_id: store_id,
                quantity: 1,
                price: 1.0,
            }];
            (store_id, service.verify_inventory(store_id, &items).await)
        }
    });
    let results = timeout(Duration::from_secs(5), join_all(calls)).await.unwrap();

    for (store_id, result) in results {
        let response: InventoryVerificationResponse = result.unwrap();
        assert_eq!(response.message, format!("store {}", store_id));
        assert_eq!(response.valid, store_id % 2 == 0);
    }
    assert_eq!(service.pending_requests(), 0);
}

#[tokio::test]
async fn test_unmatched_reply_is_consumed_and_dropped() {
    let broker = order_messaging::rabbitmq::InMemoryBroker::new();
    let service = connect_service(&broker).await;
    service.initialize().await.unwrap();
    let reply_queue = service.reply_queue().unwrap().to_string();

    let stray = connect_manager(&broker).await;
    for body in [
        json!({ "correlation_id": "nobody-is-waiting", "valid": true, "items": [] }),
        json!({ "valid": true, "items": [] }),
    ] {
        stray
            .publish(
                INVENTORY_EXCHANGE,
                REPLY_KEY,
                &serde_json::to_vec(&body).unwrap(),
                &PublishOptions::default(),
            )
            .await
            .unwrap();
    }
    wait_until(|| broker.queue_depth(&reply_queue) == Some(0)).await;

    assert_eq!(broker.requeued_count(), 0);
    assert_eq!(service.pending_requests(), 0);
    assert!(!service.is_pending("nobody-is-waiting"));

    // The reply path still works afterwards.
    let _responder = spawn_responder(&broker, |_| json!({ "valid": true, "items": [] })).await;
    let response = timeout(Duration::from_secs(1), service.verify_inventory(7, &one_item()))
        .await
        .unwrap()
        .unwrap();
    assert!(response.valid);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_ends_the_wait_and_cleans_up() {
    let broker = order_messaging::rabbitmq::InMemoryBroker::new();
    let service = connect_service(&broker).await;
    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = cancel_tx.send(());
    });
    let started = Instant::now();
    let result = service
        .verify_inventory_until(
            async {
                let _ = cancel_rx.await;
            },
            42,
            &one_item(),
        )
        .await;

    assert!(matches!(result, Err(RabbitMQError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(service.pending_requests(), 0);
}

#[tokio::test]
async fn test_initialize_declares_topology_once() {
    let broker = order_messaging::rabbitmq::InMemoryBroker::new();
    let service = connect_service(&broker).await;
    assert!(!service.is_initialized());
    assert!(service.reply_queue().is_none());

    let (first, second) = tokio::join!(service.initialize(), service.initialize());
    first.unwrap();
    second.unwrap();
    service.initialize().await.unwrap();

    let reply_queue = service.reply_queue().unwrap().to_string();
    assert!(service.is_initialized());
    assert!(reply_queue.starts_with("response-"));
    for exchange in ["orders", "products", "inventory"] {
        assert_eq!(broker.exchange_kind(exchange), Some(ExchangeKind::Topic));
    }
    assert_eq!(broker.queue_is_durable(&reply_queue), Some(false));
    assert_eq!(
        broker.bindings_for(&reply_queue),
        vec![("inventory".to_string(), "response.*".to_string())]
    );
    assert_eq!(broker.consumer_count(&reply_queue), 1);
}

#[tokio::test]
async fn test_services_get_separate_reply_queues() {
    let broker = order_messaging::rabbitmq::InMemoryBroker::new();
    let first = connect_service(&broker).await;
    let second = connect_service(&broker).await;

    first.initialize().await.unwrap();
    second.initialize().await.unwrap();

    assert_ne!(first.reply_queue(), second.reply_queue());
}

#[tokio::test]
async fn test_verify_inventory_initializes_lazily() {
    let broker = order_messaging::rabbitmq::InMemoryBroker::new();
    let service = connect_service(&broker).await;
    // The responder declares the inventory exchange itself.
    let _responder = spawn_responder(&broker, |_| json!({ "valid": false, "items": [] })).await;

    let response = timeout(Duration::from_secs(1), service.verify_inventory(42, &one_item()))
        .await
        .unwrap()
        .unwrap();

    assert!(!response.valid);
    assert!(service.is_initialized());
}
