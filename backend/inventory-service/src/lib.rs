pub mod config;
pub mod consumers;
pub mod error;
pub mod handlers;
pub mod models;
pub mod stock;
