//! Bus subscriptions for the payment participant.

use std::sync::Arc;

use async_trait::async_trait;

use message_bus::{EventHandler, MessageBus, Subscription};
use saga_events::SagaEvent;

use crate::payments::PaymentService;

pub struct PaymentRequestedHandler {
    service: Arc<PaymentService>,
}

#[async_trait]
impl EventHandler for PaymentRequestedHandler {
    async fn handle(&self, event: SagaEvent) -> anyhow::Result<()> {
        self.service.handle_payment_requested(&event).await?;
        Ok(())
    }
}

pub struct RefundHandler {
    service: Arc<PaymentService>,
}

#[async_trait]
impl EventHandler for RefundHandler {
    async fn handle(&self, event: SagaEvent) -> anyhow::Result<()> {
        self.service.handle_refund(&event).await?;
        Ok(())
    }
}

pub async fn register(
    bus: &MessageBus,
    service: Arc<PaymentService>,
    max_retries: u32,
) -> message_bus::Result<()> {
    bus.subscribe(
        Subscription::new("payment.requested", "payment_service_payment_requested"),
        Arc::new(PaymentRequestedHandler {
            service: service.clone(),
        }),
        max_retries,
    )
    .await?;

    bus.subscribe(
        Subscription::new("payment.refunded", "payment_service_refund"),
        Arc::new(RefundHandler { service }),
        max_retries,
    )
    .await?;

    Ok(())
}
