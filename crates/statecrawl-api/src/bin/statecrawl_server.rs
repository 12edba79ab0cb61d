//! Status surface server
//!
//! Loads the scanner configuration (path from `STATECRAWL_CONFIG`, default
//! `config.yaml`, falling back to built-in defaults when absent), picks the
//! store backend (`STATECRAWL_MONGODB_URI` selects MongoDB, otherwise runs
//! stay in memory), and serves the control routes.

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use statecrawl::config::Config;
use statecrawl::store::{MemoryStoreFactory, StoreFactory};
use statecrawl_api::{serve, AppState};
use statecrawl_mongodb::{MongoConfig, MongoStoreFactory};

#[tokio::main]
async fn main() -> statecrawl::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path =
        std::env::var("STATECRAWL_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        Config::from_yaml_file(&config_path)?
    } else {
        warn!(path = %config_path, "config file not found, using defaults");
        Arc::new(Config::default())
    };

    let factory: Arc<dyn StoreFactory> = match std::env::var("STATECRAWL_MONGODB_URI") {
        Ok(uri) => {
            info!(uri = %uri, "using MongoDB store backend");
            Arc::new(MongoStoreFactory::new(MongoConfig {
                uri,
                ..MongoConfig::default()
            }))
        }
        Err(_) => {
            info!("using in-memory store backend");
            Arc::new(MemoryStoreFactory::default())
        }
    };

    serve(AppState::new(config, factory)).await
}
