//! Rollcall Server - Main entry point.
//!
//! This binary starts the Rollcall API server with:
//! - Structured JSON logging
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//! - A background sweep of expired sessions and empty rooms
//!
//! # Configuration
//!
//! See [`rollcall_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! ROLLCALL_ACCESS_TOKEN_SECRET="access-secret" \
//! ROLLCALL_REFRESH_TOKEN_SECRET="refresh-secret" \
//! ROLLCALL_COOKIE_SECURE=false \
//! PORT=8000 \
//! cargo run --bin rollcall-server
//! ```

use std::process::ExitCode;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use rollcall_server::config::Config;
use rollcall_server::routes::{create_router, AppState};

/// Interval between sweeps of expired sessions and empty rooms.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  ROLLCALL_ACCESS_TOKEN_SECRET     - HMAC secret for access tokens");
            eprintln!("  ROLLCALL_REFRESH_TOKEN_SECRET    - HMAC secret for refresh tokens (must differ)");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  ROLLCALL_ACCESS_TOKEN_TTL_SECS   - Access token lifetime (default: 900)");
            eprintln!("  ROLLCALL_REFRESH_TOKEN_TTL_SECS  - Refresh token lifetime (default: 864000)");
            eprintln!("  ROLLCALL_MAX_SESSIONS_PER_USER   - Sessions kept per user (default: 10)");
            eprintln!("  ROLLCALL_COOKIE_SECURE           - Secure auth cookies (default: true)");
            eprintln!("  ROLLCALL_PUBLIC_ROOMS            - Unauthenticated WebSocket rooms (default: false)");
            eprintln!("  ROLLCALL_CORS_ORIGIN             - Allowed browser origin");
            eprintln!("  ROLLCALL_UPLOAD_DIR              - Avatar directory (default: ./uploads)");
            eprintln!("  PORT                             - HTTP server port (default: 8000)");
            eprintln!("  RUST_LOG                         - Log level filter (default: info)");
            return ExitCode::from(1);
        }
    };

    info!(
        port = config.port,
        access_ttl_secs = config.access_token_ttl.as_secs(),
        refresh_ttl_secs = config.refresh_token_ttl.as_secs(),
        public_rooms = config.public_rooms,
        "Rollcall server starting"
    );

    let state = AppState::new(config.clone());

    let maintenance_handle = state.spawn_maintenance_task(MAINTENANCE_INTERVAL);
    info!(
        interval_secs = MAINTENANCE_INTERVAL.as_secs(),
        "Maintenance task started"
    );

    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(port = config.port, address = %bind_addr, "Server listening");
            listener
        }
        Err(err) => {
            error!(error = %err, address = %bind_addr, "Failed to bind to address");
            return ExitCode::from(1);
        }
    };

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    info!("Server ready to accept connections");

    if let Err(err) = server.await {
        error!(error = %err, "Server error");
        return ExitCode::from(1);
    }

    info!("Server shutting down gracefully");
    maintenance_handle.abort();
    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

/// Initialize structured JSON logging, filtered by `RUST_LOG`.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
