//! examd server binary: load configuration, build the test catalog once,
//! then serve connections until shutdown.

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use examd::catalog::Catalog;
use examd::config::Config;
use examd::server::Server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration; a malformed file is fatal.
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        test_path = %config.test_path.display(),
        tests = config.tests.len(),
        "Starting examd"
    );

    // A test whose definition file fails to load is skipped; the server
    // still starts with whatever loaded.
    let catalog = Arc::new(Catalog::load(&config));
    if catalog.is_empty() {
        warn!("Catalog is empty; no test can be served");
    } else {
        info!(loaded = catalog.len(), "Catalog ready");
    }

    let server = Server::new(config, catalog);
    server.run().await
}
