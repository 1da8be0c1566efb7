// src/messaging/types.rs
// Wire envelope and the message catalog shared with the inventory and order
// services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Message type tags
pub const INVENTORY_VERIFICATION_REQUEST_TYPE: &str = "inventory.verification.request";
pub const INVENTORY_VERIFICATION_RESPONSE_TYPE: &str = "inventory.verification.response";
pub const INVENTORY_UPDATE_REQUEST_TYPE: &str = "inventory.update.request";
pub const ORDER_CREATED_EVENT_TYPE: &str = "order.created";

// Exchanges, all durable topic exchanges
pub const ORDER_EXCHANGE: &str = "orders";
pub const PRODUCT_EXCHANGE: &str = "products";
pub const INVENTORY_EXCHANGE: &str = "inventory";

// Routing keys
pub const INVENTORY_VERIFICATION_KEY: &str = "inventory.verification";
pub const INVENTORY_UPDATE_KEY: &str = "inventory.update";
pub const ORDER_CREATED_KEY: &str = "order.created";
pub const RESPONSE_PATTERN: &str = "response.*";

pub const RESPONSE_QUEUE_PREFIX: &str = "response-";

/// Fields carried by every message. Decoding is lenient: a peer may omit
/// any of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl BaseMessage {
    pub fn new(message_type: &str) -> Self {
        BaseMessage {
            id: Uuid::new_v4().to_string(),
            message_type: message_type.to_string(),
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn correlated(message_type: &str, correlation_id: &str) -> Self {
        BaseMessage {
            correlation_id: Some(correlation_id.to_string()),
            ..Self::new(message_type)
        }
    }

    /// The correlation id, treating an empty string as absent.
    pub fn correlation(&self) -> Option<&str> {
        self.correlation_id.as_deref().filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub sku_id: u64,
    #[serde(alias = "quantitiy")]
    pub quantity: u32,
    pub price: f64,
}

/// Sent to verify stock and prices before an order is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryVerificationRequest {
    #[serde(flatten)]
    pub base: BaseMessage,
    pub store_id: u64,
    pub items: Vec<InventoryItem>,
}

impl InventoryVerificationRequest {
    pub fn new(correlation_id: &str, store_id: u64, items: Vec<InventoryItem>) -> Self {
        InventoryVerificationRequest {
            base: BaseMessage::correlated(INVENTORY_VERIFICATION_REQUEST_TYPE, correlation_id),
            store_id,
            items,
        }
    }
}

/// Verification outcome for a single item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifiedItem {
    pub sku_id: u64,
    pub valid: bool,
    pub in_stock: bool,
    #[serde(rename = "actual_price")]
    pub price: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryVerificationResponse {
    #[serde(flatten)]
    pub base: BaseMessage,
    pub valid: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub items: Vec<VerifiedItem>,
}

/// Sent after order confirmation to decrement stock. Fire-and-forget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryUpdateRequest {
    #[serde(flatten)]
    pub base: BaseMessage,
    pub order_id: u64,
    pub store_id: u64,
    pub items: Vec<InventoryItem>,
}

impl InventoryUpdateRequest {
    pub fn new(store_id: u64, order_id: u64, items: Vec<InventoryItem>) -> Self {
        InventoryUpdateRequest {
            base: BaseMessage::new(INVENTORY_UPDATE_REQUEST_TYPE),
            order_id,
            store_id,
            items,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub id: u64,
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderItemInfo {
    pub sku_id: u64,
    pub quantity: u32,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreatedEvent {
    #[serde(flatten)]
    pub base: BaseMessage,
    pub order_id: u64,
    pub store_id: u64,
    pub customer: CustomerInfo,
    pub items: Vec<OrderItemInfo>,
    pub total: f64,
}

impl OrderCreatedEvent {
    pub fn new(
        order_id: u64,
        store_id: u64,
        customer: CustomerInfo,
        items: Vec<OrderItemInfo>,
        total: f64,
    ) -> Self {
        OrderCreatedEvent {
            base: BaseMessage::new(ORDER_CREATED_EVENT_TYPE),
            order_id,
            store_id,
            customer,
            items,
            total,
        }
    }
}
