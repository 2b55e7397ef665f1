//! Bootstrap utilities for switchyard binaries.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bus::{init_broker, Broker, Result};
use crate::config::{Config, LOG_ENV_VAR};

/// Initialize tracing with SWITCHYARD_LOG environment variable.
///
/// Defaults to "info" level if SWITCHYARD_LOG is not set. Logs go to stderr:
/// a forked worker's stdout is its IPC link.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Load configuration and build the configured broker.
pub async fn broker_from_config(path: Option<&str>) -> Result<Arc<dyn Broker>> {
    let config = Config::load(path)?;
    info!(
        broker_type = ?config.broker.broker_type,
        group = %config.broker.group,
        "Loaded configuration"
    );
    init_broker(&config.broker).await
}
