//! Bus subscriptions feeding saga replies into the orchestrator.

use std::sync::Arc;

use async_trait::async_trait;

use message_bus::{EventHandler, MessageBus, Subscription};
use saga_events::SagaEvent;

use crate::saga::SagaOrchestrator;

/// Routes every saga reply to the orchestrator; the state guard inside
/// decides whether the event still applies.
pub struct SagaReplyHandler {
    orchestrator: Arc<SagaOrchestrator>,
}

#[async_trait]
impl EventHandler for SagaReplyHandler {
    async fn handle(&self, event: SagaEvent) -> anyhow::Result<()> {
        self.orchestrator.handle_reply(&event).await?;
        Ok(())
    }
}

/// Declare the order service's reply queues and start their consumers.
pub async fn register(
    bus: &MessageBus,
    orchestrator: Arc<SagaOrchestrator>,
    max_retries: u32,
) -> message_bus::Result<()> {
    let subscriptions = [
        Subscription::new("inventory.reserved", "order_service_inventory_reserved"),
        Subscription::new("inventory.reserve.failed", "order_service_inventory_failed"),
        Subscription::new("payment.processed", "order_service_payment_processed"),
        Subscription::new("payment.failed", "order_service_payment_failed"),
    ];

    for subscription in subscriptions {
        let handler = Arc::new(SagaReplyHandler {
            orchestrator: orchestrator.clone(),
        });
        bus.subscribe(subscription, handler, max_retries).await?;
    }

    Ok(())
}
