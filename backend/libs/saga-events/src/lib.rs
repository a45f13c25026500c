//! Event schema for the order-processing saga.
//!
//! Every message on the bus is a [`SagaEvent`]: a common envelope
//! (identity, correlation, causation, timestamp) wrapping a typed
//! [`EventPayload`]. The payload is an internally tagged sum over
//! `event_type`, so deserialization dispatches on the tag and rejects
//! unknown types instead of falling back to an untyped blob.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod events;

pub use events::{EventPayload, OrderItem, ReserveItem, UnavailableItem};

/// Current schema version stamped on every event.
pub const SCHEMA_VERSION: u32 = 1;

/// All routing keys used on the `saga_events` exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "order.placed")]
    OrderPlaced,
    #[serde(rename = "order.confirmed")]
    OrderConfirmed,
    #[serde(rename = "order.cancelled")]
    OrderCancelled,
    #[serde(rename = "order.failed")]
    OrderFailed,
    #[serde(rename = "inventory.reserve.requested")]
    InventoryReserveRequested,
    #[serde(rename = "inventory.reserved")]
    InventoryReserved,
    #[serde(rename = "inventory.reserve.failed")]
    InventoryReserveFailed,
    #[serde(rename = "inventory.released")]
    InventoryReleased,
    #[serde(rename = "payment.requested")]
    PaymentRequested,
    #[serde(rename = "payment.processed")]
    PaymentProcessed,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    #[serde(rename = "payment.refunded")]
    PaymentRefunded,
    #[serde(rename = "shipping.scheduled")]
    ShippingScheduled,
    #[serde(rename = "shipping.dispatched")]
    ShippingDispatched,
    #[serde(rename = "shipping.delivered")]
    ShippingDelivered,
    #[serde(rename = "shipping.failed")]
    ShippingFailed,
}

impl EventType {
    /// Dotted routing-key form of this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::OrderPlaced => "order.placed",
            EventType::OrderConfirmed => "order.confirmed",
            EventType::OrderCancelled => "order.cancelled",
            EventType::OrderFailed => "order.failed",
            EventType::InventoryReserveRequested => "inventory.reserve.requested",
            EventType::InventoryReserved => "inventory.reserved",
            EventType::InventoryReserveFailed => "inventory.reserve.failed",
            EventType::InventoryReleased => "inventory.released",
            EventType::PaymentRequested => "payment.requested",
            EventType::PaymentProcessed => "payment.processed",
            EventType::PaymentFailed => "payment.failed",
            EventType::PaymentRefunded => "payment.refunded",
            EventType::ShippingScheduled => "shipping.scheduled",
            EventType::ShippingDispatched => "shipping.dispatched",
            EventType::ShippingDelivered => "shipping.delivered",
            EventType::ShippingFailed => "shipping.failed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for routing keys that name no known event type.
#[derive(Debug, thiserror::Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

impl std::str::FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "order.placed" => Ok(EventType::OrderPlaced),
            "order.confirmed" => Ok(EventType::OrderConfirmed),
            "order.cancelled" => Ok(EventType::OrderCancelled),
            "order.failed" => Ok(EventType::OrderFailed),
            "inventory.reserve.requested" => Ok(EventType::InventoryReserveRequested),
            "inventory.reserved" => Ok(EventType::InventoryReserved),
            "inventory.reserve.failed" => Ok(EventType::InventoryReserveFailed),
            "inventory.released" => Ok(EventType::InventoryReleased),
            "payment.requested" => Ok(EventType::PaymentRequested),
            "payment.processed" => Ok(EventType::PaymentProcessed),
            "payment.failed" => Ok(EventType::PaymentFailed),
            "payment.refunded" => Ok(EventType::PaymentRefunded),
            "shipping.scheduled" => Ok(EventType::ShippingScheduled),
            "shipping.dispatched" => Ok(EventType::ShippingDispatched),
            "shipping.delivered" => Ok(EventType::ShippingDelivered),
            "shipping.failed" => Ok(EventType::ShippingFailed),
            other => Err(UnknownEventType(other.to_string())),
        }
    }
}

fn default_version() -> u32 {
    SCHEMA_VERSION
}

/// Envelope shared by every event on the bus.
///
/// `correlation_id` ties all events of one saga instance together;
/// `causation_id` is the `event_id` of the event that directly triggered
/// this one (`None` only for the initial `order.placed`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaEvent {
    pub event_id: Uuid,
    /// ID of the primary entity, the order in most cases.
    pub aggregate_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_version")]
    pub version: u32,
    pub correlation_id: Uuid,
    #[serde(default)]
    pub causation_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl SagaEvent {
    /// Create a fresh event with no causation (saga-initiating events).
    pub fn new(aggregate_id: Uuid, correlation_id: Uuid, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            aggregate_id,
            timestamp: Utc::now(),
            version: SCHEMA_VERSION,
            correlation_id,
            causation_id: None,
            metadata: serde_json::Map::new(),
            payload,
        }
    }

    /// Create an event caused by `parent`, inheriting its correlation id.
    pub fn caused_by(parent: &SagaEvent, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            aggregate_id: parent.aggregate_id,
            timestamp: Utc::now(),
            version: SCHEMA_VERSION,
            correlation_id: parent.correlation_id,
            causation_id: Some(parent.event_id),
            metadata: serde_json::Map::new(),
            payload,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Routing key under which this event is published.
    pub fn routing_key(&self) -> &'static str {
        self.event_type().as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn placed_event() -> SagaEvent {
        SagaEvent::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            EventPayload::OrderPlaced {
                customer_id: Uuid::new_v4(),
                items: vec![OrderItem {
                    product_id: Uuid::new_v4(),
                    quantity: 2,
                    price: 100.0,
                }],
                total_amount: 200.0,
                shipping_address: json!({"city": "Berlin"}),
            },
        )
    }

    #[test]
    fn deserialization_dispatches_on_event_type_tag() {
        let event = placed_event();
        let text = serde_json::to_string(&event).unwrap();

        let round: SagaEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(round.event_type(), EventType::OrderPlaced);
        match round.payload {
            EventPayload::OrderPlaced { total_amount, .. } => assert_eq!(total_amount, 200.0),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let text = json!({
            "event_id": Uuid::new_v4(),
            "aggregate_id": Uuid::new_v4(),
            "timestamp": Utc::now(),
            "correlation_id": Uuid::new_v4(),
            "event_type": "order.exploded",
            "order_id": Uuid::new_v4(),
        })
        .to_string();

        assert!(serde_json::from_str::<SagaEvent>(&text).is_err());
    }

    #[test]
    fn version_defaults_when_missing() {
        let order_id = Uuid::new_v4();
        let text = json!({
            "event_id": Uuid::new_v4(),
            "aggregate_id": order_id,
            "timestamp": Utc::now(),
            "correlation_id": Uuid::new_v4(),
            "event_type": "order.confirmed",
            "order_id": order_id,
        })
        .to_string();

        let event: SagaEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(event.version, SCHEMA_VERSION);
        assert!(event.causation_id.is_none());
        assert!(event.metadata.is_empty());
    }

    #[test]
    fn caused_by_propagates_correlation_and_causation() {
        let placed = placed_event();
        let reply = SagaEvent::caused_by(
            &placed,
            EventPayload::InventoryReserveRequested {
                order_id: placed.aggregate_id,
                items: vec![],
            },
        );

        assert_eq!(reply.correlation_id, placed.correlation_id);
        assert_eq!(reply.causation_id, Some(placed.event_id));
        assert_eq!(reply.aggregate_id, placed.aggregate_id);
    }

    #[test]
    fn routing_key_matches_tag() {
        assert_eq!(placed_event().routing_key(), "order.placed");
        assert_eq!(
            "inventory.reserve.failed".parse::<EventType>().unwrap(),
            EventType::InventoryReserveFailed
        );
        assert!("order.unknown".parse::<EventType>().is_err());
    }
}
