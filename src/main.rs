// src/main.rs
use anyhow::Result;
use gateflow::{Engine, GatewayConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,gateflow=debug".to_string()),
        )
        .init();

    gateflow::metrics::init_metrics(None)?;

    // Load configuration from file by default
    let config_path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "gateway.yml".to_string());
    let config = GatewayConfig::load_from_file(&config_path)?;
    config.validate()?;

    let engine = Arc::new(Engine::new());
    config.apply(&engine)?;

    engine.run(&config.listen_addr).await
}
