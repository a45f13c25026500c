//! Typed payloads, one variant per routing key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::EventType;

/// One line of an order as placed by a customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: Uuid,
    pub quantity: i32,
    pub price: f64,
}

/// Quantity requested from inventory for a single product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveItem {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// Report line for a product that could not be reserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnavailableItem {
    pub product_id: Uuid,
    pub requested: i32,
    pub available: i32,
}

/// Event payload, tagged by `event_type` in the serialized form.
///
/// Field sets mirror what each participant needs to act without calling
/// back into the emitting service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum EventPayload {
    #[serde(rename = "order.placed")]
    OrderPlaced {
        customer_id: Uuid,
        items: Vec<OrderItem>,
        total_amount: f64,
        shipping_address: serde_json::Value,
    },
    #[serde(rename = "order.confirmed")]
    OrderConfirmed { order_id: Uuid },
    #[serde(rename = "order.cancelled")]
    OrderCancelled { order_id: Uuid, reason: String },
    #[serde(rename = "order.failed")]
    OrderFailed {
        order_id: Uuid,
        reason: String,
        failed_step: String,
    },

    #[serde(rename = "inventory.reserve.requested")]
    InventoryReserveRequested {
        order_id: Uuid,
        items: Vec<ReserveItem>,
    },
    #[serde(rename = "inventory.reserved")]
    InventoryReserved {
        order_id: Uuid,
        reservation_id: Uuid,
        items: Vec<ReserveItem>,
    },
    #[serde(rename = "inventory.reserve.failed")]
    InventoryReserveFailed {
        order_id: Uuid,
        reason: String,
        unavailable_items: Vec<UnavailableItem>,
    },
    #[serde(rename = "inventory.released")]
    InventoryReleased {
        order_id: Uuid,
        reservation_id: Uuid,
    },

    #[serde(rename = "payment.requested")]
    PaymentRequested {
        order_id: Uuid,
        customer_id: Uuid,
        amount: f64,
        #[serde(default = "default_currency")]
        currency: String,
        payment_method: serde_json::Value,
    },
    #[serde(rename = "payment.processed")]
    PaymentProcessed {
        order_id: Uuid,
        transaction_id: Uuid,
        amount: f64,
        #[serde(default = "default_currency")]
        currency: String,
    },
    #[serde(rename = "payment.failed")]
    PaymentFailed {
        order_id: Uuid,
        reason: String,
        #[serde(default)]
        error_code: Option<String>,
    },
    #[serde(rename = "payment.refunded")]
    PaymentRefunded {
        order_id: Uuid,
        transaction_id: Uuid,
        refund_id: Uuid,
        amount: f64,
    },

    #[serde(rename = "shipping.scheduled")]
    ShippingScheduled {
        order_id: Uuid,
        shipping_id: Uuid,
        estimated_delivery: DateTime<Utc>,
        shipping_address: serde_json::Value,
    },
    #[serde(rename = "shipping.dispatched")]
    ShippingDispatched {
        order_id: Uuid,
        shipping_id: Uuid,
        tracking_number: String,
    },
    #[serde(rename = "shipping.delivered")]
    ShippingDelivered {
        order_id: Uuid,
        shipping_id: Uuid,
        delivered_at: DateTime<Utc>,
    },
    #[serde(rename = "shipping.failed")]
    ShippingFailed { order_id: Uuid, reason: String },
}

fn default_currency() -> String {
    "USD".to_string()
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::OrderPlaced { .. } => EventType::OrderPlaced,
            EventPayload::OrderConfirmed { .. } => EventType::OrderConfirmed,
            EventPayload::OrderCancelled { .. } => EventType::OrderCancelled,
            EventPayload::OrderFailed { .. } => EventType::OrderFailed,
            EventPayload::InventoryReserveRequested { .. } => EventType::InventoryReserveRequested,
            EventPayload::InventoryReserved { .. } => EventType::InventoryReserved,
            EventPayload::InventoryReserveFailed { .. } => EventType::InventoryReserveFailed,
            EventPayload::InventoryReleased { .. } => EventType::InventoryReleased,
            EventPayload::PaymentRequested { .. } => EventType::PaymentRequested,
            EventPayload::PaymentProcessed { .. } => EventType::PaymentProcessed,
            EventPayload::PaymentFailed { .. } => EventType::PaymentFailed,
            EventPayload::PaymentRefunded { .. } => EventType::PaymentRefunded,
            EventPayload::ShippingScheduled { .. } => EventType::ShippingScheduled,
            EventPayload::ShippingDispatched { .. } => EventType::ShippingDispatched,
            EventPayload::ShippingDelivered { .. } => EventType::ShippingDelivered,
            EventPayload::ShippingFailed { .. } => EventType::ShippingFailed,
        }
    }
}
