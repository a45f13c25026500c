//! HTTP surface of the inventory service.

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{InventoryError, Result};
use crate::models::{Product, Reservation};

pub struct AppState {
    pub pool: PgPool,
}

#[derive(Debug, Deserialize)]
pub struct ProductRequest {
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub quantity: i32,
}

/// POST /products
pub async fn create_product(
    state: web::Data<AppState>,
    request: web::Json<ProductRequest>,
) -> Result<HttpResponse> {
    let request = request.into_inner();

    if request.price < 0.0 {
        return Err(InventoryError::Validation("price must be >= 0".to_string()));
    }
    if request.quantity < 0 {
        return Err(InventoryError::Validation(
            "quantity must be >= 0".to_string(),
        ));
    }

    let product: Product = sqlx::query_as(
        r#"
        INSERT INTO products (id, name, description, price, available_quantity)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&request.name)
    .bind(&request.description)
    .bind(request.price)
    .bind(request.quantity)
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(product_id = %product.id, name = %product.name, "created product");

    Ok(HttpResponse::Created().json(product))
}

/// GET /products
pub async fn list_products(state: web::Data<AppState>) -> Result<HttpResponse> {
    let products: Vec<Product> = sqlx::query_as("SELECT * FROM products ORDER BY name")
        .fetch_all(&state.pool)
        .await?;

    Ok(HttpResponse::Ok().json(products))
}

/// GET /products/{id}
pub async fn get_product(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let product_id = path.into_inner();

    let product: Option<Product> = sqlx::query_as("SELECT * FROM products WHERE id = $1")
        .bind(product_id)
        .fetch_optional(&state.pool)
        .await?;

    match product {
        Some(product) => Ok(HttpResponse::Ok().json(product)),
        None => Err(InventoryError::NotFound(format!("product {product_id}"))),
    }
}

/// GET /reservations/{order_id}
pub async fn get_reservation(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let order_id = path.into_inner();

    let reservation: Option<Reservation> =
        sqlx::query_as("SELECT * FROM reservations WHERE order_id = $1")
            .bind(order_id)
            .fetch_optional(&state.pool)
            .await?;

    match reservation {
        Some(reservation) => Ok(HttpResponse::Ok().json(reservation)),
        None => Err(InventoryError::NotFound(format!(
            "reservation for order {order_id}"
        ))),
    }
}

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "inventory-service",
    }))
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/products", web::post().to(create_product))
        .route("/products", web::get().to(list_products))
        .route("/products/{id}", web::get().to(get_product))
        .route("/reservations/{order_id}", web::get().to(get_reservation))
        .route("/health", web::get().to(health));
}
