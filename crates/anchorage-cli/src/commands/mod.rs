pub mod bindings;
pub mod config;
pub mod documents;
pub mod lifecycle;
pub mod ports;

use std::sync::Arc;

use anyhow::{Context, Result};

use anchorage_core::Distance;
use anchorage_search::{Broker, HttpProviderFactory, ProviderFactory};
use anchorage_store::{Config, LifecycleController};

/// Bring the backing store up and connect a broker to it.
///
/// The broker is dropped without shutting down, so a managed container
/// keeps running for the next command. `anchorage down` stops it.
pub async fn connect(config: &Config) -> Result<Broker> {
    log::info!("Connecting to the backing store ({} mode)", config.mode);
    let lifecycle =
        LifecycleController::from_config(config).context("Invalid backend configuration")?;
    let factory: Arc<dyn ProviderFactory> = Arc::new(HttpProviderFactory::from_config(config));
    let broker = Broker::connect(config, Arc::new(lifecycle), factory)
        .await
        .context("Failed to connect to the backing store")?;
    log::debug!("Broker ready");
    Ok(broker)
}

/// Parse an optional `--distance` flag.
pub fn parse_distance(value: Option<&str>) -> Result<Option<Distance>> {
    value
        .map(str::parse::<Distance>)
        .transpose()
        .context("Invalid --distance")
}
