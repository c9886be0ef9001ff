//! HTTP/WebSocket server wiring and lifecycle

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use livecast_core::{bootstrap::Services, Config};

use crate::ws::websocket_handler;

/// Shared state handed to every HTTP handler
#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub connection_requests_per_second: u32,
    pub connection_burst: u32,
}

/// Signaling server: one WebSocket endpoint plus background maintenance tasks
pub struct LiveCastServer {
    config: Config,
    services: Services,
    background: Vec<JoinHandle<()>>,
}

impl LiveCastServer {
    #[must_use]
    pub fn new(config: Config, services: Services) -> Self {
        Self {
            config,
            services,
            background: Vec::new(),
        }
    }

    /// Start serving and wait for a shutdown signal
    pub async fn start(mut self) -> anyhow::Result<()> {
        info!("Starting LiveCast server...");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Engine notifications (ICE/DTLS failures) feed back into teardown
        self.background
            .push(self.services.lifecycle.spawn_engine_event_pump());
        if let Some(janitor) = self.services.chat.spawn_janitor() {
            self.background.push(janitor);
        }

        let http_handle = self.start_http_server(shutdown_rx).await?;

        info!("All servers started successfully");

        tokio::select! {
            _ = http_handle => {
                error!("HTTP server stopped unexpectedly");
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
            }
        }

        let _ = shutdown_tx.send(true);
        self.shutdown().await;

        Ok(())
    }

    async fn shutdown(&mut self) {
        info!("Shutting down LiveCast server...");

        let drain_timeout = Duration::from_secs(10);
        let active = self.services.hub.connection_count();
        if active > 0 {
            info!(
                "Waiting up to {}s for {} active connection(s) to drain...",
                drain_timeout.as_secs(),
                active
            );
            let deadline = tokio::time::Instant::now() + drain_timeout;
            while self.services.hub.connection_count() > 0 {
                if tokio::time::Instant::now() >= deadline {
                    warn!(
                        "Drain timeout reached with {} connection(s) still open",
                        self.services.hub.connection_count()
                    );
                    break;
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }

        for handle in self.background.drain(..) {
            handle.abort();
        }

        info!("LiveCast server shut down");
    }

    async fn start_http_server(
        &self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let http_address = self.config.http_address();
        let state = AppState {
            services: self.services.clone(),
            connection_requests_per_second: self.config.server.connection_requests_per_second,
            connection_burst: self.config.server.connection_burst,
        };
        let router = create_router(state);

        let http_addr: std::net::SocketAddr = http_address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{http_address}': {e}"))?;
        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;

        info!("HTTP server listening on {}", http_addr);

        let handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }

            info!("HTTP server shut down gracefully");
        });

        Ok(handle)
    }
}

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let services = &state.services;
    Json(json!({
        "status": "ok",
        "connections": services.hub.connection_count(),
        "activeStreams": services.streams.list_active().len(),
        "transports": services.transports.transport_count(),
        "chatRooms": services.chat.room_count(),
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livecast_core::bootstrap::init_services;
    use livecast_sfu::LocalMediaEngine;
    use std::sync::Arc;

    fn state() -> AppState {
        let config = Config::default();
        let engine = Arc::new(LocalMediaEngine::new(Arc::new(config.media.clone())));
        AppState {
            services: init_services(&config, engine).unwrap(),
            connection_requests_per_second: config.server.connection_requests_per_second,
            connection_burst: config.server.connection_burst,
        }
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let Json(body) = health(State(state())).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["activeStreams"], 0);
    }
}
