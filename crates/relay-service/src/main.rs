//! Room Relay
//!
//! WebSocket room fan-out bridged over a shared pub/sub broker.
//!
//! # Servers
//!
//! - WebSocket server for clients (default: 0.0.0.0:8080, path `/ws`)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect the broker (Redis, or the in-process bus)
//! 4. Start the broker bridge listener and the subscription hub
//! 5. Start health HTTP server (liveness, readiness, metrics)
//! 6. Start WebSocket server
//! 7. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use relay_service::actors::SubscriptionHubHandle;
use relay_service::bridge::BrokerBridge;
use relay_service::broker::{Broker, BrokerEvents, BrokerStatus, MemoryBroker, RedisBroker};
use relay_service::config::{BrokerKind, Config};
use relay_service::membership::MembershipView;
use relay_service::observability::{health_router, init_metrics_recorder, HealthState};
use relay_service::router::Router as RelayRouter;
use relay_service::transport::{relay_router, TransportState};
use secrecy::ExposeSecret;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time given to open connections and background tasks to wind down.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration before tracing so the log format can be chosen
    let config_result = Config::from_env();
    let log_json = config_result.as_ref().is_ok_and(|c| c.log_json);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "relay_service=debug,tower_http=debug".into());
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Room Relay");

    let config = config_result.map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        broker = ?config.broker,
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        outbound_buffer = config.outbound_buffer,
        max_frame_bytes = config.max_frame_bytes,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let shutdown_token = CancellationToken::new();

    // Connect the broker
    let (broker, events): (Arc<dyn Broker>, BrokerEvents) = match config.broker {
        BrokerKind::Redis => {
            let redis_url = config
                .redis_url
                .as_ref()
                .ok_or("REDIS_URL is required for the redis broker")?;
            info!("Connecting to Redis...");
            let (broker, events) = RedisBroker::connect(
                redis_url.expose_secret(),
                config.broker_backoff,
                shutdown_token.child_token(),
            )
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to connect to Redis");
                e
            })?;
            info!("Redis connection established");
            (Arc::new(broker), events)
        }
        BrokerKind::Memory => {
            info!("Using in-process broker, messages stay on this instance");
            let (broker, events) = MemoryBroker::standalone();
            (Arc::new(broker), events)
        }
    };

    // Bridge, listener and hub
    let broker_status = BrokerStatus::new();
    let bridge = BrokerBridge::new(broker, MembershipView::new(), Arc::clone(&broker_status));
    let listener_handle = bridge.spawn_listener(events, shutdown_token.child_token());
    let hub = SubscriptionHubHandle::new(bridge.clone(), shutdown_token.child_token());
    let relay = RelayRouter::new(hub, bridge);
    info!("Subscription hub started");

    let health_state = Arc::new(HealthState::new(Arc::clone(&broker_status)));

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Start WebSocket server
    let ws_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        format!("Invalid bind address: {e}")
    })?;

    let ws_app = relay_router(TransportState {
        router: relay,
        outbound_buffer: config.outbound_buffer,
        max_frame_bytes: config.max_frame_bytes,
        cancel_token: shutdown_token.child_token(),
    });

    let ws_listener = tokio::net::TcpListener::bind(ws_addr).await.map_err(|e| {
        error!(error = %e, addr = %ws_addr, "Failed to bind WebSocket server");
        format!("Failed to bind WebSocket server to {ws_addr}: {e}")
    })?;

    let ws_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %ws_addr, "WebSocket server starting");
        let server = axum::serve(ws_listener, ws_app).with_graceful_shutdown(async move {
            ws_shutdown_token.cancelled().await;
            info!("WebSocket server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "WebSocket server failed");
        }
    });

    health_state.set_ready();
    info!("Room Relay running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so traffic drains to other instances
    health_state.set_not_ready();

    // Propagates to the hub, the listener, the broker task and both servers
    shutdown_token.cancel();

    tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;

    if !listener_handle.is_finished() {
        listener_handle.abort();
    }

    info!("Room Relay shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
