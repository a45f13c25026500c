use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use db_pool::{create_pool, DbConfig};
use inventory_service::config::Config;
use inventory_service::consumers;
use inventory_service::handlers::{self, AppState};
use inventory_service::stock::InventoryService;
use message_bus::MessageBus;
use transactional_outbox::OutboxPublisher;

#[actix_web::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,inventory_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting inventory-service");

    let config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    let db_config = DbConfig::from_env("inventory-service")
        .map_err(|e| anyhow::anyhow!("invalid database configuration: {e}"))?;
    db_config.log_config();

    let pool = create_pool(db_config)
        .await
        .context("failed to create database pool")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let bus = Arc::new(
        MessageBus::connect(&config.amqp_url)
            .await
            .context("failed to connect to message broker")?,
    );

    let service = Arc::new(InventoryService::new(pool.clone()));
    let publisher = Arc::new(OutboxPublisher::new(
        pool.clone(),
        bus.clone(),
        config.publisher_config(),
    ));

    {
        let publisher = publisher.clone();
        let cancel = bus.cancellation_token().child_token();
        tokio::spawn(async move {
            publisher.run(cancel).await;
        });
    }

    consumers::register(&bus, service.clone(), config.consumer_max_retries)
        .await
        .context("failed to register consumers")?;

    if config.seed_demo_data {
        service
            .seed_demo_products()
            .await
            .context("failed to seed demo products")?;
    }

    let state = web::Data::new(AppState { pool });

    tracing::info!(port = config.port, "starting HTTP server");

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(handlers::routes)
    })
    .bind(("0.0.0.0", config.port))
    .context("failed to bind HTTP server")?
    .run()
    .await
    .context("HTTP server error")?;

    tracing::info!("shutting down inventory-service");
    if let Err(e) = bus.close().await {
        tracing::warn!(error = %e, "error closing message bus");
    }

    Ok(())
}
