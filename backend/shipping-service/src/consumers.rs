//! Bus subscription for the shipping participant.

use std::sync::Arc;

use async_trait::async_trait;

use message_bus::{EventHandler, MessageBus, Subscription};
use saga_events::SagaEvent;

use crate::scheduling::ShippingService;

pub struct OrderConfirmedHandler {
    service: Arc<ShippingService>,
}

#[async_trait]
impl EventHandler for OrderConfirmedHandler {
    async fn handle(&self, event: SagaEvent) -> anyhow::Result<()> {
        self.service.handle_order_confirmed(&event).await?;
        Ok(())
    }
}

pub async fn register(
    bus: &MessageBus,
    service: Arc<ShippingService>,
    max_retries: u32,
) -> message_bus::Result<()> {
    bus.subscribe(
        Subscription::new("order.confirmed", "shipping_service_order_confirmed"),
        Arc::new(OrderConfirmedHandler { service }),
        max_retries,
    )
    .await?;

    Ok(())
}
