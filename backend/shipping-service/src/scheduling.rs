//! Shipment scheduling on order confirmation.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use saga_events::{EventPayload, SagaEvent};
use transactional_outbox as outbox;

use crate::error::Result;
use crate::models::ShipmentStatus;

const DELIVERY_LEAD_DAYS: i64 = 4;

/// Middle of the 3-5 business day delivery window.
pub fn estimated_delivery(from: DateTime<Utc>) -> DateTime<Utc> {
    from + Duration::days(DELIVERY_LEAD_DAYS)
}

/// `TRK` followed by 12 uppercase hex characters.
pub fn generate_tracking_number() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("TRK{}", hex[..12].to_uppercase())
}

pub struct ShippingService {
    pool: PgPool,
}

impl ShippingService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Handle `order.confirmed`. Idempotent on order_id: a redelivered
    /// confirmation finds the existing shipment and does nothing.
    pub async fn handle_order_confirmed(&self, event: &SagaEvent) -> Result<()> {
        let EventPayload::OrderConfirmed { order_id } = &event.payload else {
            warn!(event_type = event.routing_key(), "unexpected payload, dropping");
            return Ok(());
        };
        let order_id = *order_id;

        let mut tx = self.pool.begin().await?;

        let existing: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM shipments WHERE order_id = $1")
                .bind(order_id)
                .fetch_optional(&mut *tx)
                .await?;

        if let Some(shipment_id) = existing {
            info!(order_id = %order_id, shipment_id = %shipment_id, "shipment already exists");
            return Ok(());
        }

        // The orchestrator forwards the order's address in the event
        // metadata; fall back to an empty object if absent.
        let shipping_address = event
            .metadata
            .get("shipping_address")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));

        let shipment_id = Uuid::new_v4();
        let tracking_number = generate_tracking_number();
        let estimated = estimated_delivery(Utc::now());

        sqlx::query(
            r#"
            INSERT INTO shipments (id, order_id, correlation_id, status, tracking_number,
                                   shipping_address, estimated_delivery)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(shipment_id)
        .bind(order_id)
        .bind(event.correlation_id)
        .bind(ShipmentStatus::Scheduled.as_str())
        .bind(&tracking_number)
        .bind(&shipping_address)
        .bind(estimated)
        .execute(&mut *tx)
        .await?;

        let reply = SagaEvent::caused_by(
            event,
            EventPayload::ShippingScheduled {
                order_id,
                shipping_id: shipment_id,
                estimated_delivery: estimated,
                shipping_address,
            },
        );
        outbox::enqueue(&mut tx, &reply).await?;

        tx.commit().await?;

        info!(
            order_id = %order_id,
            shipment_id = %shipment_id,
            tracking_number = %tracking_number,
            "shipping scheduled"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_numbers_have_the_carrier_shape() {
        let tracking = generate_tracking_number();
        assert!(tracking.starts_with("TRK"));
        assert_eq!(tracking.len(), 15);
        assert!(tracking[3..]
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn tracking_numbers_are_unique_enough() {
        let a = generate_tracking_number();
        let b = generate_tracking_number();
        assert_ne!(a, b);
    }

    #[test]
    fn delivery_is_estimated_four_days_out() {
        let now = Utc::now();
        assert_eq!(estimated_delivery(now), now + Duration::days(4));
    }
}
