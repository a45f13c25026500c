//! Database models for the payment service.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Refunded,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Processing => "processing",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Refunded => "refunded",
        }
    }
}

/// Payment transaction; at most one per order.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Transaction {
    pub id: Uuid,
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub correlation_id: Uuid,

    pub idempotency_key: String,

    pub amount: f64,
    pub currency: String,
    pub status: String,

    pub payment_method: serde_json::Value,
    pub gateway_response: Option<serde_json::Value>,

    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Compensating refund; only one completed refund per transaction.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Refund {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub order_id: Uuid,
    pub correlation_id: Uuid,

    pub amount: f64,
    pub reason: Option<String>,
    pub status: String,

    pub gateway_response: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Idempotency key under which a charge for `order_id` is recorded.
pub fn idempotency_key(order_id: Uuid) -> String {
    format!("payment_{order_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_stable_per_order() {
        let order_id = Uuid::new_v4();
        assert_eq!(idempotency_key(order_id), format!("payment_{order_id}"));
        assert_eq!(idempotency_key(order_id), idempotency_key(order_id));
    }
}
