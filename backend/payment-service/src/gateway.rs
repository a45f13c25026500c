//! Payment gateway seam.
//!
//! The saga only needs a charge attempt that is safe to retry under a
//! stable idempotency key; a real integration (Stripe, Adyen, ...) and
//! the simulation below both satisfy that contract.

use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use uuid::Uuid;

/// Result of a charge attempt that reached the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum ChargeOutcome {
    Approved { gateway_transaction_id: String },
    Declined { reason: String },
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Attempt a charge. Callers pass the same `idempotency_key` on every
    /// retry so the gateway collapses repeats onto one outcome. `Err`
    /// means the gateway itself was unreachable.
    async fn charge(
        &self,
        idempotency_key: &str,
        amount: f64,
        currency: &str,
    ) -> anyhow::Result<ChargeOutcome>;
}

const DECLINE_REASONS: &[&str] = &[
    "Insufficient funds",
    "Card declined",
    "Payment gateway timeout",
    "Invalid payment method",
];

/// Simulated gateway: fixed latency, random declines at `failure_rate`.
pub struct SimulatedGateway {
    pub latency: Duration,
    pub failure_rate: f64,
}

impl SimulatedGateway {
    pub fn new(latency: Duration, failure_rate: f64) -> Self {
        Self {
            latency,
            failure_rate,
        }
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn charge(
        &self,
        _idempotency_key: &str,
        _amount: f64,
        _currency: &str,
    ) -> anyhow::Result<ChargeOutcome> {
        tokio::time::sleep(self.latency).await;

        let declined = rand::thread_rng().gen_bool(self.failure_rate.clamp(0.0, 1.0));
        if declined {
            let reason = DECLINE_REASONS
                .choose(&mut rand::thread_rng())
                .copied()
                .unwrap_or("Card declined");
            return Ok(ChargeOutcome::Declined {
                reason: reason.to_string(),
            });
        }

        Ok(ChargeOutcome::Approved {
            gateway_transaction_id: Uuid::new_v4().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_failure_rate_always_approves() {
        let gateway = SimulatedGateway::new(Duration::ZERO, 0.0);
        for _ in 0..10 {
            let outcome = gateway.charge("payment_x", 100.0, "USD").await.unwrap();
            assert!(matches!(outcome, ChargeOutcome::Approved { .. }));
        }
    }

    #[tokio::test]
    async fn full_failure_rate_always_declines() {
        let gateway = SimulatedGateway::new(Duration::ZERO, 1.0);
        for _ in 0..10 {
            let outcome = gateway.charge("payment_x", 100.0, "USD").await.unwrap();
            match outcome {
                ChargeOutcome::Declined { reason } => {
                    assert!(DECLINE_REASONS.contains(&reason.as_str()));
                }
                other => panic!("expected decline, got {other:?}"),
            }
        }
    }
}
