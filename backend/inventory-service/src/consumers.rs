//! Bus subscriptions for the inventory participant.

use std::sync::Arc;

use async_trait::async_trait;

use message_bus::{EventHandler, MessageBus, Subscription};
use saga_events::SagaEvent;

use crate::stock::InventoryService;

pub struct ReserveRequestedHandler {
    service: Arc<InventoryService>,
}

#[async_trait]
impl EventHandler for ReserveRequestedHandler {
    async fn handle(&self, event: SagaEvent) -> anyhow::Result<()> {
        self.service.handle_reserve_requested(&event).await?;
        Ok(())
    }
}

pub struct ReleaseHandler {
    service: Arc<InventoryService>,
}

#[async_trait]
impl EventHandler for ReleaseHandler {
    async fn handle(&self, event: SagaEvent) -> anyhow::Result<()> {
        self.service.handle_release(&event).await?;
        Ok(())
    }
}

pub async fn register(
    bus: &MessageBus,
    service: Arc<InventoryService>,
    max_retries: u32,
) -> message_bus::Result<()> {
    bus.subscribe(
        Subscription::new("inventory.reserve.requested", "inventory_service_reserve"),
        Arc::new(ReserveRequestedHandler {
            service: service.clone(),
        }),
        max_retries,
    )
    .await?;

    bus.subscribe(
        Subscription::new("inventory.released", "inventory_service_release"),
        Arc::new(ReleaseHandler { service }),
        max_retries,
    )
    .await?;

    Ok(())
}
