//! TCP server for the examination protocol.
//!
//! One task per inbound connection; each connection carries exactly one
//! request and receives exactly one response. A background task sweeps
//! terminal sessions out of the registry.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::config::Config;
use crate::protocol::{self, Request, Response};
use crate::session::SessionRegistry;

/// Maximum number of concurrent connections
const MAX_CONNECTIONS: usize = 1024;

/// Maximum size of one request payload
const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// Server instance
pub struct Server {
    config: Config,
    catalog: Arc<Catalog>,
    registry: Arc<SessionRegistry>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance over an already-built catalog
    pub fn new(config: Config, catalog: Arc<Catalog>) -> Self {
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&catalog)));

        Server {
            config,
            catalog,
            registry,
            connection_limit: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        }
    }

    /// Accept connections until a shutdown signal arrives, then drain
    /// in-flight requests before returning.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(address = %self.config.listen, "Server listening");

        let registry = Arc::clone(&self.registry);
        let sweep_interval = self.config.sweep_interval;
        let retention = chrono::Duration::seconds(self.config.session_retention as i64);
        tokio::spawn(async move {
            sweep_task(registry, sweep_interval, retention).await;
        });

        loop {
            // Wait for a connection slot
            let permit = self.connection_limit.clone().acquire_owned().await?;

            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!(peer = %addr, "New connection");

                            let catalog = Arc::clone(&self.catalog);
                            let registry = Arc::clone(&self.registry);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, catalog, registry).await {
                                    debug!(error = %e, "Connection error");
                                }
                                drop(permit);
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received, draining in-flight requests");
                    drop(permit);
                    break;
                }
            }
        }

        drop(listener);

        // Every permit held means a handler still in flight; each exchange
        // is short and bounded.
        let _drain = self
            .connection_limit
            .acquire_many(MAX_CONNECTIONS as u32)
            .await?;
        info!("Shutdown complete");
        Ok(())
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

/// Background task evicting terminal sessions past the retention window
async fn sweep_task(
    registry: Arc<SessionRegistry>,
    interval_secs: u64,
    retention: chrono::Duration,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));

    loop {
        interval.tick().await;
        let evicted = registry.sweep(retention, Utc::now());
        if evicted > 0 {
            debug!(evicted, "Swept terminal sessions");
        }
    }
}

/// Handle a single client connection: one request, one response, close.
pub(crate) async fn handle_connection(
    mut stream: TcpStream,
    catalog: Arc<Catalog>,
    registry: Arc<SessionRegistry>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let payload = read_request(&mut stream).await?;

    let response = match serde_json::from_slice::<Request>(&payload) {
        Ok(request) => {
            debug!(user = %request.user, command = %request.command, "Processing request");
            protocol::dispatch(&catalog, &registry, &request)
        }
        Err(e) => {
            // No state was mutated; answer with an error and close.
            warn!(error = %e, "Undecodable request");
            Response::malformed(format!("invalid request payload: {e}"))
        }
    };

    let encoded = serde_json::to_vec(&response)?;
    stream.write_all(&encoded).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Read one request payload. Stops as soon as the buffer holds a complete
/// JSON document or the client half-closes, whichever comes first.
async fn read_request(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(1024);
    let mut buf = [0u8; 4096];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(payload);
        }
        if payload.len() + n > MAX_REQUEST_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request payload too large",
            ));
        }
        payload.extend_from_slice(&buf[..n]);

        if serde_json::from_slice::<Request>(&payload).is_ok() {
            return Ok(payload);
        }
    }
}
