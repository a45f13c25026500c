//! Database models for the inventory service.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::types::Json;
use uuid::Uuid;

use saga_events::ReserveItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStatus {
    Active,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Released => "released",
            ReservationStatus::Expired => "expired",
        }
    }
}

/// Product stock levels. `available_quantity` and `reserved_quantity`
/// never go negative; the schema enforces it with CHECK constraints and
/// reservations decrement with a conditional update.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub available_quantity: i32,
    pub reserved_quantity: i32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Stock held for one order; at most one per order_id.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Reservation {
    pub id: Uuid,
    pub order_id: Uuid,
    pub correlation_id: Uuid,

    pub status: String,
    pub items: Json<Vec<ReserveItem>>,

    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}
