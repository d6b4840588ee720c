//! Server lifecycle management
//!
//! Builds the HTTP/WebSocket router, runs the listen loop, and
//! coordinates graceful shutdown: viewers are told the broadcast is gone
//! for good, sessions are released within a bounded grace period, then
//! the process exits.

use std::future::IntoFuture;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use solocast_sfu::{Config, RegistryHandle};

use crate::http::{self, AppState};

/// Upper bound on session draining at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct SolocastServer {
    config: Config,
    registry: RegistryHandle,
}

impl SolocastServer {
    pub const fn new(config: Config, registry: RegistryHandle) -> Self {
        Self { config, registry }
    }

    /// Start serving and block until a shutdown signal arrives.
    pub async fn start(self) -> anyhow::Result<()> {
        let state = AppState {
            registry: self.registry.clone(),
            started_at: Instant::now(),
            started_wall: chrono::Utc::now(),
            keepalive: self.config.webrtc.keepalive_interval(),
        };

        let app = http::router(state, &self.config);
        let listener = tokio::net::TcpListener::bind(self.config.listen_addr()).await?;
        info!(addr = %self.config.listen_addr(), "listening");

        let server = axum::serve(listener, app).into_future();
        tokio::select! {
            result = server => {
                result?;
            }
            _ = shutdown_signal() => {
                info!("shutdown signal received; draining sessions");
                match tokio::time::timeout(SHUTDOWN_GRACE, self.registry.shutdown()).await {
                    Ok(Ok(())) => info!("sessions drained"),
                    Ok(Err(e)) => warn!(error = %e, "registry shutdown failed"),
                    Err(_) => warn!("shutdown grace period elapsed; exiting anyway"),
                }
            }
        }

        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        // Without a signal handler the future must never resolve, or the
        // server would exit immediately.
        std::future::pending::<()>().await;
    }
}
