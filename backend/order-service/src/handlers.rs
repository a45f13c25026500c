//! HTTP surface of the order service.

use std::sync::Arc;

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use message_bus::MessageBus;
use saga_events::{OrderItem, SagaEvent};
use transactional_outbox::OutboxPublisher;

use crate::error::{OrderError, Result};
use crate::models::{Order, SagaLog};
use crate::saga::SagaOrchestrator;

pub struct AppState {
    pub pool: PgPool,
    pub orchestrator: Arc<SagaOrchestrator>,
    pub publisher: Arc<OutboxPublisher>,
    pub bus: Arc<MessageBus>,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub customer_id: Uuid,
    pub items: Vec<OrderItem>,
    pub shipping_address: serde_json::Value,
    #[serde(default)]
    pub payment_method: serde_json::Value,
}

impl CreateOrderRequest {
    fn validate(&self) -> Result<()> {
        if self.items.is_empty() {
            return Err(OrderError::Validation(
                "order must contain at least one item".to_string(),
            ));
        }
        for item in &self.items {
            if item.quantity <= 0 {
                return Err(OrderError::Validation(format!(
                    "invalid quantity {} for product {}",
                    item.quantity, item.product_id
                )));
            }
            if item.price < 0.0 {
                return Err(OrderError::Validation(format!(
                    "invalid price {} for product {}",
                    item.price, item.product_id
                )));
            }
        }
        Ok(())
    }
}

/// POST /orders — create an order and start its saga.
pub async fn create_order(
    state: web::Data<AppState>,
    request: web::Json<CreateOrderRequest>,
) -> Result<HttpResponse> {
    let request = request.into_inner();
    request.validate()?;

    let order = state
        .orchestrator
        .start_order_saga(request.customer_id, request.items, request.shipping_address)
        .await?;

    Ok(HttpResponse::Created().json(order))
}

/// GET /orders/{id}
pub async fn get_order(state: web::Data<AppState>, path: web::Path<Uuid>) -> Result<HttpResponse> {
    let order_id = path.into_inner();

    let order: Option<Order> = sqlx::query_as("SELECT * FROM orders WHERE id = $1")
        .bind(order_id)
        .fetch_optional(&state.pool)
        .await?;

    match order {
        Some(order) => Ok(HttpResponse::Ok().json(order)),
        None => Err(OrderError::NotFound(format!("order {order_id}"))),
    }
}

/// GET /orders/{id}/saga-logs — the saga's causal history.
pub async fn get_saga_logs(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let order_id = path.into_inner();

    let logs: Vec<SagaLog> = sqlx::query_as(
        "SELECT * FROM saga_logs WHERE order_id = $1 ORDER BY created_at ASC",
    )
    .bind(order_id)
    .fetch_all(&state.pool)
    .await?;

    Ok(HttpResponse::Ok().json(logs))
}

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "order-service",
    }))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

/// GET /admin/outbox/stats
pub async fn outbox_stats(state: web::Data<AppState>) -> Result<HttpResponse> {
    let (pending, age) = state.publisher.pending_stats().await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "pending_count": pending,
        "oldest_pending_age_seconds": age,
    })))
}

/// POST /admin/outbox/retry-failed
pub async fn outbox_retry_failed(
    state: web::Data<AppState>,
    query: web::Query<LimitQuery>,
) -> Result<HttpResponse> {
    let reset = state.publisher.retry_failed(query.limit).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "reset": reset })))
}

/// GET /admin/dlq — drain dead letters for inspection.
pub async fn drain_dlq(
    state: web::Data<AppState>,
    query: web::Query<LimitQuery>,
) -> Result<HttpResponse> {
    let letters = state.bus.drain_dlq(query.limit.max(0) as usize).await?;

    let body: Vec<serde_json::Value> = letters
        .into_iter()
        .map(|letter| {
            serde_json::json!({
                "event": letter.event,
                "headers": letter.headers,
                "routing_key": letter.routing_key,
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(body))
}

/// POST /admin/dlq/replay — republish an inspected event with fresh headers.
pub async fn replay_event(
    state: web::Data<AppState>,
    event: web::Json<SagaEvent>,
) -> Result<HttpResponse> {
    state.bus.replay(&event).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "replayed": event.event_id })))
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/orders", web::post().to(create_order))
        .route("/orders/{id}", web::get().to(get_order))
        .route("/orders/{id}/saga-logs", web::get().to(get_saga_logs))
        .route("/health", web::get().to(health))
        .route("/admin/outbox/stats", web::get().to(outbox_stats))
        .route(
            "/admin/outbox/retry-failed",
            web::post().to(outbox_retry_failed),
        )
        .route("/admin/dlq", web::get().to(drain_dlq))
        .route("/admin/dlq/replay", web::post().to(replay_event));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn zero_item_orders_are_rejected() {
        let request = CreateOrderRequest {
            customer_id: Uuid::new_v4(),
            items: vec![],
            shipping_address: json!({}),
            payment_method: json!({}),
        };
        assert!(matches!(
            request.validate(),
            Err(OrderError::Validation(_))
        ));
    }

    #[test]
    fn non_positive_quantities_are_rejected() {
        let request = CreateOrderRequest {
            customer_id: Uuid::new_v4(),
            items: vec![OrderItem {
                product_id: Uuid::new_v4(),
                quantity: 0,
                price: 10.0,
            }],
            shipping_address: json!({}),
            payment_method: json!({}),
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn zero_priced_items_are_allowed() {
        let request = CreateOrderRequest {
            customer_id: Uuid::new_v4(),
            items: vec![OrderItem {
                product_id: Uuid::new_v4(),
                quantity: 1,
                price: 0.0,
            }],
            shipping_address: json!({}),
            payment_method: json!({}),
        };
        assert!(request.validate().is_ok());
    }
}
