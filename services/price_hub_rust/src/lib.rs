//! price_hub_rust - live price fan-out service with per-user trigger routing

pub mod bridge;
pub mod commands;
pub mod config;
pub mod service;

pub use config::Config;
pub use service::PriceHubService;
