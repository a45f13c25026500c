//! Reservation and release logic against the product stock.

use std::collections::HashMap;

use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use saga_events::{EventPayload, ReserveItem, SagaEvent, UnavailableItem};
use transactional_outbox as outbox;

use crate::error::Result;
use crate::models::{Reservation, ReservationStatus};

/// Compute the shortfall report for a reservation request.
///
/// A product missing from `available` counts as zero stock.
pub fn unavailable_items(
    requested: &[ReserveItem],
    available: &HashMap<Uuid, i32>,
) -> Vec<UnavailableItem> {
    requested
        .iter()
        .filter_map(|item| {
            let on_hand = available.get(&item.product_id).copied().unwrap_or(0);
            if on_hand < item.quantity {
                Some(UnavailableItem {
                    product_id: item.product_id,
                    requested: item.quantity,
                    available: on_hand,
                })
            } else {
                None
            }
        })
        .collect()
}

pub struct InventoryService {
    pool: PgPool,
}

impl InventoryService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Handle `inventory.reserve.requested`.
    ///
    /// Idempotent on order_id: a redelivered request re-emits the reply
    /// for the stored reservation without touching stock again.
    pub async fn handle_reserve_requested(&self, event: &SagaEvent) -> Result<()> {
        let EventPayload::InventoryReserveRequested { order_id, items } = &event.payload else {
            warn!(event_type = event.routing_key(), "unexpected payload, dropping");
            return Ok(());
        };
        let order_id = *order_id;

        let mut tx = self.pool.begin().await?;

        let existing: Option<Reservation> =
            sqlx::query_as("SELECT * FROM reservations WHERE order_id = $1")
                .bind(order_id)
                .fetch_optional(&mut *tx)
                .await?;

        if let Some(existing) = existing {
            info!(order_id = %order_id, reservation_id = %existing.id, "reservation already exists, re-emitting reply");
            let reply = SagaEvent::caused_by(
                event,
                EventPayload::InventoryReserved {
                    order_id,
                    reservation_id: existing.id,
                    items: existing.items.0.clone(),
                },
            );
            outbox::enqueue(&mut tx, &reply).await?;
            tx.commit().await?;
            return Ok(());
        }

        let product_ids: Vec<Uuid> = items.iter().map(|item| item.product_id).collect();
        let stock: Vec<(Uuid, i32)> =
            sqlx::query_as("SELECT id, available_quantity FROM products WHERE id = ANY($1)")
                .bind(&product_ids)
                .fetch_all(&mut *tx)
                .await?;
        let available: HashMap<Uuid, i32> = stock.into_iter().collect();

        let shortfall = unavailable_items(items, &available);
        if !shortfall.is_empty() {
            warn!(order_id = %order_id, unavailable = shortfall.len(), "insufficient inventory");
            let reply = SagaEvent::caused_by(
                event,
                EventPayload::InventoryReserveFailed {
                    order_id,
                    reason: "Insufficient inventory".to_string(),
                    unavailable_items: shortfall,
                },
            );
            outbox::enqueue(&mut tx, &reply).await?;
            tx.commit().await?;
            return Ok(());
        }

        // Decrement conditionally so a concurrent reservation of the same
        // product cannot oversell; zero rows affected means we lost the
        // race after the availability check.
        for item in items {
            let updated = sqlx::query(
                r#"
                UPDATE products
                SET available_quantity = available_quantity - $2,
                    reserved_quantity = reserved_quantity + $2,
                    updated_at = NOW()
                WHERE id = $1 AND available_quantity >= $2
                "#,
            )
            .bind(item.product_id)
            .bind(item.quantity)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                drop(tx);
                return self.reject_lost_race(event, order_id, item).await;
            }
        }

        let reservation_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO reservations (id, order_id, correlation_id, status, items)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(reservation_id)
        .bind(order_id)
        .bind(event.correlation_id)
        .bind(ReservationStatus::Active.as_str())
        .bind(serde_json::to_value(items)?)
        .execute(&mut *tx)
        .await?;

        let reply = SagaEvent::caused_by(
            event,
            EventPayload::InventoryReserved {
                order_id,
                reservation_id,
                items: items.clone(),
            },
        );
        outbox::enqueue(&mut tx, &reply).await?;

        tx.commit().await?;

        info!(order_id = %order_id, reservation_id = %reservation_id, "inventory reserved");

        Ok(())
    }

    /// Rolled back mid-reservation: record the failure in a fresh
    /// transaction with the stock level the loser actually saw.
    async fn reject_lost_race(
        &self,
        event: &SagaEvent,
        order_id: Uuid,
        item: &ReserveItem,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let available: Option<i32> =
            sqlx::query_scalar("SELECT available_quantity FROM products WHERE id = $1")
                .bind(item.product_id)
                .fetch_optional(&mut *tx)
                .await?;

        warn!(
            order_id = %order_id,
            product_id = %item.product_id,
            requested = item.quantity,
            available = available.unwrap_or(0),
            "reservation lost a concurrent stock update"
        );

        let reply = SagaEvent::caused_by(
            event,
            EventPayload::InventoryReserveFailed {
                order_id,
                reason: "Insufficient inventory".to_string(),
                unavailable_items: vec![UnavailableItem {
                    product_id: item.product_id,
                    requested: item.quantity,
                    available: available.unwrap_or(0),
                }],
            },
        );
        outbox::enqueue(&mut tx, &reply).await?;
        tx.commit().await?;

        Ok(())
    }

    /// Handle `inventory.released` (compensation). Idempotent: releasing
    /// twice is a no-op after the first. No reply event.
    pub async fn handle_release(&self, event: &SagaEvent) -> Result<()> {
        let EventPayload::InventoryReleased {
            order_id,
            reservation_id,
        } = &event.payload
        else {
            warn!(event_type = event.routing_key(), "unexpected payload, dropping");
            return Ok(());
        };

        let mut tx = self.pool.begin().await?;

        let reservation: Option<Reservation> = sqlx::query_as(
            "SELECT * FROM reservations WHERE id = $1 AND order_id = $2 FOR UPDATE",
        )
        .bind(reservation_id)
        .bind(order_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(reservation) = reservation else {
            warn!(reservation_id = %reservation_id, order_id = %order_id, "reservation not found");
            return Ok(());
        };

        if reservation.status == ReservationStatus::Released.as_str() {
            info!(reservation_id = %reservation.id, "reservation already released");
            return Ok(());
        }

        for item in reservation.items.0.iter() {
            sqlx::query(
                r#"
                UPDATE products
                SET available_quantity = available_quantity + $2,
                    reserved_quantity = reserved_quantity - $2,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(item.product_id)
            .bind(item.quantity)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE reservations SET status = $2, released_at = NOW() WHERE id = $1",
        )
        .bind(reservation.id)
        .bind(ReservationStatus::Released.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(reservation_id = %reservation.id, order_id = %order_id, "reservation released");

        Ok(())
    }

    /// Seed a few demo products when the table is empty.
    pub async fn seed_demo_products(&self) -> Result<()> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
            .fetch_one(&self.pool)
            .await?;

        if count > 0 {
            info!("products already exist, skipping seed");
            return Ok(());
        }

        let demo = [
            ("Laptop", "High-performance laptop", 1200.00_f64, 50),
            ("Mouse", "Wireless mouse", 25.00, 200),
            ("Keyboard", "Mechanical keyboard", 80.00, 100),
            ("Monitor", "27-inch 4K monitor", 350.00, 30),
        ];

        for (name, description, price, quantity) in demo {
            sqlx::query(
                r#"
                INSERT INTO products (id, name, description, price, available_quantity)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(name)
            .bind(description)
            .bind(price)
            .bind(quantity)
            .execute(&self.pool)
            .await?;
        }

        info!("seeded demo product data");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(product_id: Uuid, quantity: i32) -> Vec<ReserveItem> {
        vec![ReserveItem {
            product_id,
            quantity,
        }]
    }

    #[test]
    fn reserving_exactly_the_available_quantity_succeeds() {
        let product_id = Uuid::new_v4();
        let available = HashMap::from([(product_id, 5)]);

        assert!(unavailable_items(&request(product_id, 5), &available).is_empty());
    }

    #[test]
    fn reserving_one_more_than_available_fails() {
        let product_id = Uuid::new_v4();
        let available = HashMap::from([(product_id, 5)]);

        let shortfall = unavailable_items(&request(product_id, 6), &available);
        assert_eq!(
            shortfall,
            vec![UnavailableItem {
                product_id,
                requested: 6,
                available: 5,
            }]
        );
    }

    #[test]
    fn unknown_products_report_zero_availability() {
        let product_id = Uuid::new_v4();
        let shortfall = unavailable_items(&request(product_id, 1), &HashMap::new());
        assert_eq!(shortfall[0].available, 0);
        assert_eq!(shortfall[0].requested, 1);
    }

    #[test]
    fn only_short_items_are_reported() {
        let in_stock = Uuid::new_v4();
        let short = Uuid::new_v4();
        let available = HashMap::from([(in_stock, 10), (short, 1)]);

        let requested = vec![
            ReserveItem {
                product_id: in_stock,
                quantity: 2,
            },
            ReserveItem {
                product_id: short,
                quantity: 5,
            },
        ];

        let shortfall = unavailable_items(&requested, &available);
        assert_eq!(shortfall.len(), 1);
        assert_eq!(shortfall[0].product_id, short);
    }
}
