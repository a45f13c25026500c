use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use db_pool::{create_pool, DbConfig};
use message_bus::MessageBus;
use payment_service::config::Config;
use payment_service::consumers;
use payment_service::gateway::SimulatedGateway;
use payment_service::handlers::{self, AppState};
use payment_service::payments::PaymentService;
use transactional_outbox::OutboxPublisher;

#[actix_web::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,payment_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting payment-service");

    let config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    let db_config = DbConfig::from_env("payment-service")
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

    let gateway = Arc::new(SimulatedGateway::new(
        config.gateway_latency(),
        config.gateway_failure_rate,
    ));
    let service = Arc::new(PaymentService::new(pool.clone(), gateway));
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

    consumers::register(&bus, service, config.consumer_max_retries)
        .await
        .context("failed to register consumers")?;

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

    tracing::info!("shutting down payment-service");
    if let Err(e) = bus.close().await {
        tracing::warn!(error = %e, "error closing message bus");
    }

    Ok(())
}
