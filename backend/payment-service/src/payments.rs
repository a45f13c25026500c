//! Charge and refund processing.
//!
//! The charge runs in two transactions around the gateway call: the
//! first claims the idempotency key by inserting a `processing` row, the
//! second records the outcome and enqueues the reply event. A replayed
//! `payment.requested` finds the existing row and re-emits the reply for
//! its terminal status without charging again.

use std::sync::Arc;

use serde_json::json;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use saga_events::{EventPayload, SagaEvent};
use transactional_outbox as outbox;

use crate::error::Result;
use crate::gateway::{ChargeOutcome, PaymentGateway};
use crate::models::{idempotency_key, Refund, Transaction, TransactionStatus};

/// A zero-amount order has nothing to charge; the gateway is skipped and
/// the payment recorded as completed.
fn needs_gateway(amount: f64) -> bool {
    amount > 0.0
}

pub struct PaymentService {
    pool: PgPool,
    gateway: Arc<dyn PaymentGateway>,
}

impl PaymentService {
    pub fn new(pool: PgPool, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { pool, gateway }
    }

    /// Handle `payment.requested`.
    pub async fn handle_payment_requested(&self, event: &SagaEvent) -> Result<()> {
        let EventPayload::PaymentRequested {
            order_id,
            customer_id,
            amount,
            currency,
            payment_method,
        } = &event.payload
        else {
            warn!(event_type = event.routing_key(), "unexpected payload, dropping");
            return Ok(());
        };
        let order_id = *order_id;
        let key = idempotency_key(order_id);

        let mut tx = self.pool.begin().await?;

        let existing: Option<Transaction> =
            sqlx::query_as("SELECT * FROM transactions WHERE idempotency_key = $1")
                .bind(&key)
                .fetch_optional(&mut *tx)
                .await?;

        if let Some(existing) = existing {
            info!(
                order_id = %order_id,
                status = %existing.status,
                "transaction already exists, re-emitting reply"
            );

            if existing.status == TransactionStatus::Completed.as_str() {
                let reply = SagaEvent::caused_by(
                    event,
                    EventPayload::PaymentProcessed {
                        order_id,
                        transaction_id: existing.id,
                        amount: existing.amount,
                        currency: existing.currency.clone(),
                    },
                );
                outbox::enqueue(&mut tx, &reply).await?;
            } else if existing.status == TransactionStatus::Failed.as_str() {
                let reply = SagaEvent::caused_by(
                    event,
                    EventPayload::PaymentFailed {
                        order_id,
                        reason: existing
                            .error_message
                            .clone()
                            .unwrap_or_else(|| "Unknown error".to_string()),
                        error_code: Some("PAYMENT_FAILED".to_string()),
                    },
                );
                outbox::enqueue(&mut tx, &reply).await?;
            } else {
                // Still processing: a previous attempt crashed between the
                // two transactions. Operators resolve via outbox replay.
                warn!(
                    order_id = %order_id,
                    status = %existing.status,
                    "transaction not terminal, dropping replay"
                );
            }

            tx.commit().await?;
            return Ok(());
        }

        let transaction_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO transactions (id, order_id, customer_id, correlation_id,
                                      idempotency_key, amount, currency, status, payment_method)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(transaction_id)
        .bind(order_id)
        .bind(customer_id)
        .bind(event.correlation_id)
        .bind(&key)
        .bind(amount)
        .bind(currency)
        .bind(TransactionStatus::Processing.as_str())
        .bind(payment_method)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(order_id = %order_id, amount, "processing payment");

        let outcome = if needs_gateway(*amount) {
            match self.gateway.charge(&key, *amount, currency).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(order_id = %order_id, error = %e, "payment gateway unreachable");
                    ChargeOutcome::Declined {
                        reason: format!("Payment gateway unavailable: {e}"),
                    }
                }
            }
        } else {
            ChargeOutcome::Approved {
                gateway_transaction_id: "zero-amount".to_string(),
            }
        };

        let mut tx = self.pool.begin().await?;

        match outcome {
            ChargeOutcome::Approved {
                gateway_transaction_id,
            } => {
                sqlx::query(
                    r#"
                    UPDATE transactions
                    SET status = $2, processed_at = NOW(), gateway_response = $3
                    WHERE id = $1
                    "#,
                )
                .bind(transaction_id)
                .bind(TransactionStatus::Completed.as_str())
                .bind(json!({
                    "status": "success",
                    "gateway_transaction_id": gateway_transaction_id,
                }))
                .execute(&mut *tx)
                .await?;

                let reply = SagaEvent::caused_by(
                    event,
                    EventPayload::PaymentProcessed {
                        order_id,
                        transaction_id,
                        amount: *amount,
                        currency: currency.clone(),
                    },
                );
                outbox::enqueue(&mut tx, &reply).await?;

                info!(order_id = %order_id, transaction_id = %transaction_id, "payment processed");
            }
            ChargeOutcome::Declined { reason } => {
                sqlx::query(
                    r#"
                    UPDATE transactions
                    SET status = $2, processed_at = NOW(), error_message = $3, gateway_response = $4
                    WHERE id = $1
                    "#,
                )
                .bind(transaction_id)
                .bind(TransactionStatus::Failed.as_str())
                .bind(&reason)
                .bind(json!({
                    "status": "failed",
                    "error": reason,
                }))
                .execute(&mut *tx)
                .await?;

                let reply = SagaEvent::caused_by(
                    event,
                    EventPayload::PaymentFailed {
                        order_id,
                        reason: reason.clone(),
                        error_code: Some("PAYMENT_FAILED".to_string()),
                    },
                );
                outbox::enqueue(&mut tx, &reply).await?;

                warn!(order_id = %order_id, reason = %reason, "payment failed");
            }
        }

        tx.commit().await?;

        Ok(())
    }

    /// Handle `payment.refunded` (compensation). Idempotent: only one
    /// completed refund per transaction.
    pub async fn handle_refund(&self, event: &SagaEvent) -> Result<()> {
        let EventPayload::PaymentRefunded {
            order_id,
            transaction_id,
            refund_id,
            amount,
        } = &event.payload
        else {
            warn!(event_type = event.routing_key(), "unexpected payload, dropping");
            return Ok(());
        };

        let mut tx = self.pool.begin().await?;

        let transaction: Option<Transaction> =
            sqlx::query_as("SELECT * FROM transactions WHERE id = $1 FOR UPDATE")
                .bind(transaction_id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some(transaction) = transaction else {
            warn!(transaction_id = %transaction_id, "transaction not found");
            return Ok(());
        };

        if transaction.status != TransactionStatus::Completed.as_str() {
            warn!(
                transaction_id = %transaction_id,
                status = %transaction.status,
                "cannot refund transaction in this status"
            );
            return Ok(());
        }

        let existing: Option<Refund> = sqlx::query_as(
            "SELECT * FROM refunds WHERE transaction_id = $1 AND status = 'completed'",
        )
        .bind(transaction_id)
        .fetch_optional(&mut *tx)
        .await?;

        if existing.is_some() {
            info!(transaction_id = %transaction_id, "transaction already refunded");
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO refunds (id, transaction_id, order_id, correlation_id,
                                 amount, reason, status, gateway_response, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'completed', $7, NOW())
            "#,
        )
        .bind(refund_id)
        .bind(transaction_id)
        .bind(order_id)
        .bind(event.correlation_id)
        .bind(amount)
        .bind("Order cancellation")
        .bind(json!({
            "status": "success",
            "gateway_refund_id": Uuid::new_v4().to_string(),
        }))
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE transactions SET status = $2 WHERE id = $1")
            .bind(transaction_id)
            .bind(TransactionStatus::Refunded.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(transaction_id = %transaction_id, order_id = %order_id, "transaction refunded");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_amount_charges_skip_the_gateway() {
        assert!(!needs_gateway(0.0));
        assert!(needs_gateway(0.01));
        assert!(needs_gateway(200.0));
    }
}
