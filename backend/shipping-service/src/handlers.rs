//! HTTP surface of the shipping service.

use actix_web::{web, HttpResponse};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Result, ShippingError};
use crate::models::Shipment;

pub struct AppState {
    pub pool: PgPool,
}

/// GET /shipments/{order_id}
pub async fn get_shipment(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let order_id = path.into_inner();

    let shipment: Option<Shipment> =
        sqlx::query_as("SELECT * FROM shipments WHERE order_id = $1")
            .bind(order_id)
            .fetch_optional(&state.pool)
            .await?;

    match shipment {
        Some(shipment) => Ok(HttpResponse::Ok().json(shipment)),
        None => Err(ShippingError::NotFound(format!(
            "shipment for order {order_id}"
        ))),
    }
}

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "shipping-service",
    }))
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/shipments/{order_id}", web::get().to(get_shipment))
        .route("/health", web::get().to(health));
}
