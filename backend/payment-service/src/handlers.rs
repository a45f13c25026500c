//! HTTP surface of the payment service.

use actix_web::{web, HttpResponse};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{PaymentError, Result};
use crate::models::Transaction;

pub struct AppState {
    pub pool: PgPool,
}

/// GET /transactions/{order_id}
pub async fn get_transaction(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let order_id = path.into_inner();

    let transaction: Option<Transaction> =
        sqlx::query_as("SELECT * FROM transactions WHERE order_id = $1")
            .bind(order_id)
            .fetch_optional(&state.pool)
            .await?;

    match transaction {
        Some(transaction) => Ok(HttpResponse::Ok().json(transaction)),
        None => Err(PaymentError::NotFound(format!(
            "transaction for order {order_id}"
        ))),
    }
}

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "payment-service",
    }))
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/transactions/{order_id}", web::get().to(get_transaction))
        .route("/health", web::get().to(health));
}
