//! Saga orchestration for the order lifecycle.
//!
//! Each reply event drives one state-machine transition. The transition
//! itself is planned by a pure function over (current status, incoming
//! payload), which keeps the duplicate-tolerance guards a plain match;
//! the orchestrator executes the plan in a single database transaction:
//! mutate the order, append the saga log, and enqueue the next command
//! (or compensation) in the outbox.

use serde_json::json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{error, info, warn};
use uuid::Uuid;

use saga_events::{EventPayload, OrderItem, ReserveItem, SagaEvent};
use transactional_outbox as outbox;

use crate::error::Result;
use crate::models::{log_status, Order, OrderStatus, SagaStep};

/// What a reply event means for the order, given its current status.
#[derive(Debug, Clone, PartialEq)]
pub enum SagaAction {
    /// Inventory held; move forward and charge the customer.
    RequestPayment { reservation_id: Uuid },
    /// Payment captured; the order is done.
    ConfirmOrder { transaction_id: Uuid },
    /// Reservation rejected; nothing to compensate.
    FailAtReservation { reason: String },
    /// Charge rejected; release inventory if any was held.
    FailAtPayment { reason: String },
    /// Duplicate, late, or unrelated event.
    Ignore { why: &'static str },
}

/// Plan the transition for a reply event.
///
/// Only the expected source state advances the saga; anything else is
/// ignored so redelivered or out-of-order replies cannot move an order
/// twice.
pub fn plan(status: OrderStatus, payload: &EventPayload) -> SagaAction {
    match (status, payload) {
        (OrderStatus::Pending, EventPayload::InventoryReserved { reservation_id, .. }) => {
            SagaAction::RequestPayment {
                reservation_id: *reservation_id,
            }
        }
        (OrderStatus::Pending, EventPayload::InventoryReserveFailed { reason, .. }) => {
            SagaAction::FailAtReservation {
                reason: reason.clone(),
            }
        }
        (OrderStatus::InventoryReserved, EventPayload::PaymentProcessed { transaction_id, .. }) => {
            SagaAction::ConfirmOrder {
                transaction_id: *transaction_id,
            }
        }
        (OrderStatus::InventoryReserved, EventPayload::PaymentFailed { reason, .. }) => {
            SagaAction::FailAtPayment {
                reason: reason.clone(),
            }
        }
        (
            _,
            EventPayload::InventoryReserved { .. }
            | EventPayload::InventoryReserveFailed { .. }
            | EventPayload::PaymentProcessed { .. }
            | EventPayload::PaymentFailed { .. },
        ) => SagaAction::Ignore {
            why: "order not in the expected state for this reply",
        },
        _ => SagaAction::Ignore {
            why: "event type is not a saga reply",
        },
    }
}

/// Orchestrates order sagas against the order database.
pub struct SagaOrchestrator {
    pool: PgPool,
}

impl SagaOrchestrator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the order and kick off the saga.
    ///
    /// One transaction: insert the order, record `order.placed`, and
    /// enqueue the inventory reservation command.
    pub async fn start_order_saga(
        &self,
        customer_id: Uuid,
        items: Vec<OrderItem>,
        shipping_address: serde_json::Value,
    ) -> Result<Order> {
        let order_id = Uuid::new_v4();
        let correlation_id = Uuid::new_v4();
        let total_amount: f64 = items
            .iter()
            .map(|item| item.price * f64::from(item.quantity))
            .sum();

        let mut tx = self.pool.begin().await?;

        let order: Order = sqlx::query_as(
            r#"
            INSERT INTO orders (id, customer_id, status, current_saga_step, items,
                                total_amount, shipping_address, correlation_id)
            VALUES ($1, $2, 'pending', $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(order_id)
        .bind(customer_id)
        .bind(SagaStep::InventoryReservation.as_str())
        .bind(serde_json::to_value(&items)?)
        .bind(total_amount)
        .bind(&shipping_address)
        .bind(correlation_id)
        .fetch_one(&mut *tx)
        .await?;

        let placed = SagaEvent::new(
            order_id,
            correlation_id,
            EventPayload::OrderPlaced {
                customer_id,
                items: items.clone(),
                total_amount,
                shipping_address,
            },
        );
        outbox::enqueue(&mut tx, &placed).await?;
        self.log_step(
            &mut tx,
            &order,
            SagaStep::OrderPlaced,
            &placed,
            log_status::COMPLETED,
            None,
        )
        .await?;

        let reserve = SagaEvent::caused_by(
            &placed,
            EventPayload::InventoryReserveRequested {
                order_id,
                items: items
                    .iter()
                    .map(|item| ReserveItem {
                        product_id: item.product_id,
                        quantity: item.quantity,
                    })
                    .collect(),
            },
        );
        outbox::enqueue(&mut tx, &reserve).await?;
        self.log_step(
            &mut tx,
            &order,
            SagaStep::InventoryReservation,
            &reserve,
            log_status::STARTED,
            None,
        )
        .await?;

        tx.commit().await?;

        info!(order_id = %order_id, correlation_id = %correlation_id, "order saga started");

        Ok(order)
    }

    /// Apply one reply event to its order.
    ///
    /// Errors are transient infrastructure failures only; the bus retry
    /// machinery redelivers. Events for unknown orders are dropped.
    pub async fn handle_reply(&self, event: &SagaEvent) -> Result<()> {
        let order_id = event.aggregate_id;

        let mut tx = self.pool.begin().await?;

        let order: Option<Order> = sqlx::query_as("SELECT * FROM orders WHERE id = $1 FOR UPDATE")
            .bind(order_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(order) = order else {
            warn!(
                order_id = %order_id,
                event_type = event.routing_key(),
                "event references unknown order, dropping"
            );
            return Ok(());
        };

        let Some(status) = order.status() else {
            error!(order_id = %order_id, status = %order.status, "order has unknown status, dropping event");
            return Ok(());
        };

        match plan(status, &event.payload) {
            SagaAction::RequestPayment { reservation_id } => {
                sqlx::query(
                    r#"
                    UPDATE orders
                    SET status = 'inventory_reserved', reservation_id = $2,
                        current_saga_step = $3, updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(order.id)
                .bind(reservation_id)
                .bind(SagaStep::PaymentProcessing.as_str())
                .execute(&mut *tx)
                .await?;

                self.log_step(
                    &mut tx,
                    &order,
                    SagaStep::InventoryReservation,
                    event,
                    log_status::COMPLETED,
                    None,
                )
                .await?;

                let payment = SagaEvent::caused_by(
                    event,
                    EventPayload::PaymentRequested {
                        order_id: order.id,
                        customer_id: order.customer_id,
                        amount: order.total_amount,
                        currency: "USD".to_string(),
                        payment_method: json!({"type": "credit_card"}),
                    },
                );
                outbox::enqueue(&mut tx, &payment).await?;
                self.log_step(
                    &mut tx,
                    &order,
                    SagaStep::PaymentProcessing,
                    &payment,
                    log_status::STARTED,
                    None,
                )
                .await?;

                tx.commit().await?;
                info!(order_id = %order.id, "inventory reserved, payment requested");
            }

            SagaAction::ConfirmOrder { transaction_id } => {
                sqlx::query(
                    r#"
                    UPDATE orders
                    SET status = 'confirmed', transaction_id = $2,
                        current_saga_step = $3, updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(order.id)
                .bind(transaction_id)
                .bind(SagaStep::OrderConfirmation.as_str())
                .execute(&mut *tx)
                .await?;

                self.log_step(
                    &mut tx,
                    &order,
                    SagaStep::PaymentProcessing,
                    event,
                    log_status::COMPLETED,
                    None,
                )
                .await?;

                let confirmed = SagaEvent::caused_by(
                    event,
                    EventPayload::OrderConfirmed { order_id: order.id },
                )
                .with_metadata("shipping_address", order.shipping_address.clone());
                outbox::enqueue(&mut tx, &confirmed).await?;
                self.log_step(
                    &mut tx,
                    &order,
                    SagaStep::OrderConfirmation,
                    &confirmed,
                    log_status::COMPLETED,
                    None,
                )
                .await?;

                tx.commit().await?;
                info!(order_id = %order.id, "order confirmed");
            }

            SagaAction::FailAtReservation { reason } => {
                self.fail_order(&mut tx, &order, &reason).await?;

                self.log_step(
                    &mut tx,
                    &order,
                    SagaStep::InventoryReservation,
                    event,
                    log_status::FAILED,
                    Some(&reason),
                )
                .await?;

                let failed = SagaEvent::caused_by(
                    event,
                    EventPayload::OrderFailed {
                        order_id: order.id,
                        reason: reason.clone(),
                        failed_step: SagaStep::InventoryReservation.as_str().to_string(),
                    },
                );
                outbox::enqueue(&mut tx, &failed).await?;

                tx.commit().await?;
                error!(order_id = %order.id, reason = %reason, "order failed at inventory reservation");
            }

            SagaAction::FailAtPayment { reason } => {
                self.fail_order(&mut tx, &order, &reason).await?;

                self.log_step(
                    &mut tx,
                    &order,
                    SagaStep::PaymentProcessing,
                    event,
                    log_status::FAILED,
                    Some(&reason),
                )
                .await?;

                // Compensation: hand the reserved stock back.
                if let Some(reservation_id) = order.reservation_id {
                    let release = SagaEvent::caused_by(
                        event,
                        EventPayload::InventoryReleased {
                            order_id: order.id,
                            reservation_id,
                        },
                    );
                    outbox::enqueue(&mut tx, &release).await?;
                    self.log_step(
                        &mut tx,
                        &order,
                        SagaStep::Compensation,
                        &release,
                        log_status::COMPENSATED,
                        None,
                    )
                    .await?;
                }

                let failed = SagaEvent::caused_by(
                    event,
                    EventPayload::OrderFailed {
                        order_id: order.id,
                        reason: reason.clone(),
                        failed_step: SagaStep::PaymentProcessing.as_str().to_string(),
                    },
                );
                outbox::enqueue(&mut tx, &failed).await?;

                tx.commit().await?;
                error!(order_id = %order.id, reason = %reason, "order failed at payment");
            }

            SagaAction::Ignore { why } => {
                info!(
                    order_id = %order.id,
                    status = %order.status,
                    event_type = event.routing_key(),
                    event_id = %event.event_id,
                    why,
                    "ignoring saga reply"
                );
            }
        }

        Ok(())
    }

    async fn fail_order(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        order: &Order,
        reason: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE orders SET status = 'failed', error_message = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(order.id)
        .bind(reason)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn log_step(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        order: &Order,
        step: SagaStep,
        event: &SagaEvent,
        status: &str,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga_logs (id, order_id, correlation_id, step, event_type, event_id, status, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(order.id)
        .bind(order.correlation_id)
        .bind(step.as_str())
        .bind(event.routing_key())
        .bind(event.event_id)
        .bind(status)
        .bind(error_message)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserved(reservation_id: Uuid) -> EventPayload {
        EventPayload::InventoryReserved {
            order_id: Uuid::new_v4(),
            reservation_id,
            items: vec![],
        }
    }

    fn processed(transaction_id: Uuid) -> EventPayload {
        EventPayload::PaymentProcessed {
            order_id: Uuid::new_v4(),
            transaction_id,
            amount: 100.0,
            currency: "USD".to_string(),
        }
    }

    #[test]
    fn happy_path_transitions() {
        let reservation_id = Uuid::new_v4();
        assert_eq!(
            plan(OrderStatus::Pending, &reserved(reservation_id)),
            SagaAction::RequestPayment { reservation_id }
        );

        let transaction_id = Uuid::new_v4();
        assert_eq!(
            plan(OrderStatus::InventoryReserved, &processed(transaction_id)),
            SagaAction::ConfirmOrder { transaction_id }
        );
    }

    #[test]
    fn reservation_failure_fails_the_order_without_compensation() {
        let action = plan(
            OrderStatus::Pending,
            &EventPayload::InventoryReserveFailed {
                order_id: Uuid::new_v4(),
                reason: "Insufficient inventory".to_string(),
                unavailable_items: vec![],
            },
        );
        assert_eq!(
            action,
            SagaAction::FailAtReservation {
                reason: "Insufficient inventory".to_string()
            }
        );
    }

    #[test]
    fn payment_failure_triggers_compensation_path() {
        let action = plan(
            OrderStatus::InventoryReserved,
            &EventPayload::PaymentFailed {
                order_id: Uuid::new_v4(),
                reason: "Card declined".to_string(),
                error_code: Some("PAYMENT_FAILED".to_string()),
            },
        );
        assert_eq!(
            action,
            SagaAction::FailAtPayment {
                reason: "Card declined".to_string()
            }
        );
    }

    #[test]
    fn duplicate_replies_are_ignored_by_the_state_guard() {
        let transaction_id = Uuid::new_v4();

        // Order already confirmed: a redelivered payment.processed is a no-op.
        assert!(matches!(
            plan(OrderStatus::Confirmed, &processed(transaction_id)),
            SagaAction::Ignore { .. }
        ));

        // Late inventory.reserved after the order already failed.
        assert!(matches!(
            plan(OrderStatus::Failed, &reserved(Uuid::new_v4())),
            SagaAction::Ignore { .. }
        ));

        // Reply arriving out of order.
        assert!(matches!(
            plan(OrderStatus::Pending, &processed(transaction_id)),
            SagaAction::Ignore { .. }
        ));
    }

    #[test]
    fn non_reply_events_are_ignored() {
        let payload = EventPayload::OrderConfirmed {
            order_id: Uuid::new_v4(),
        };
        assert!(matches!(
            plan(OrderStatus::Pending, &payload),
            SagaAction::Ignore { .. }
        ));
    }
}
