//! Database models for the order service.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::types::Json;
use uuid::Uuid;

use saga_events::OrderItem;

/// Order status along the saga lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    InventoryReserved,
    PaymentProcessing,
    Confirmed,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::InventoryReserved => "inventory_reserved",
            OrderStatus::PaymentProcessing => "payment_processing",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "inventory_reserved" => Some(OrderStatus::InventoryReserved),
            "payment_processing" => Some(OrderStatus::PaymentProcessing),
            "confirmed" => Some(OrderStatus::Confirmed),
            "cancelled" => Some(OrderStatus::Cancelled),
            "failed" => Some(OrderStatus::Failed),
            _ => None,
        }
    }
}

/// Steps of the order saga, recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaStep {
    OrderPlaced,
    InventoryReservation,
    PaymentProcessing,
    OrderConfirmation,
    Compensation,
}

impl SagaStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStep::OrderPlaced => "order_placed",
            SagaStep::InventoryReservation => "inventory_reservation",
            SagaStep::PaymentProcessing => "payment_processing",
            SagaStep::OrderConfirmation => "order_confirmation",
            SagaStep::Compensation => "compensation",
        }
    }
}

/// Order aggregate root.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Order {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub status: String,
    pub current_saga_step: String,

    pub items: Json<Vec<OrderItem>>,
    pub total_amount: f64,
    pub shipping_address: serde_json::Value,

    pub correlation_id: Uuid,
    pub reservation_id: Option<Uuid>,
    pub transaction_id: Option<Uuid>,
    pub shipping_id: Option<Uuid>,

    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Parsed status; rows only ever hold the known set.
    pub fn status(&self) -> Option<OrderStatus> {
        OrderStatus::parse(&self.status)
    }
}

/// One entry of the append-only saga execution log.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SagaLog {
    pub id: Uuid,
    pub order_id: Uuid,
    pub correlation_id: Uuid,

    pub step: String,
    pub event_type: String,
    pub event_id: Uuid,
    pub status: String,

    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Saga log entry status values.
pub mod log_status {
    pub const STARTED: &str = "started";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const COMPENSATED: &str = "compensated";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::InventoryReserved,
            OrderStatus::PaymentProcessing,
            OrderStatus::Confirmed,
            OrderStatus::Cancelled,
            OrderStatus::Failed,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::parse("shipped"), None);
    }
}
