//! Parley service binary.
//!
//! Wires the `PostgreSQL` connector, the default route table, and the
//! message socket into one running service, then serves until `Ctrl-C`.
//!
//! # Startup Sequence
//!
//! 1. Initialize structured logging (tracing)
//! 2. Resolve configuration from the environment
//! 3. Build the `PostgreSQL` connector from that configuration
//! 4. Bootstrap: pipeline, persistence, routes, socket, boundary, listen
//! 5. Serve until `Ctrl-C`, then drain, close the pool, and exit

mod error;

use std::process::ExitCode;

use parley_db::PostgresConnector;
use parley_gateway::{Bootstrap, DefaultRoutes, MessageSocket, ServerConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::error::StartupError;

/// Application entry point.
///
/// Any startup or serving failure is logged and turns into a non-zero
/// exit code.
#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => {
            info!("parley-server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "parley-server failed");
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` filters (default `info`); `LOG_FORMAT=json` selects JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

async fn run() -> Result<(), StartupError> {
    info!("parley-server starting");

    let config = ServerConfig::from_env()?;
    info!(
        host = config.host,
        port = config.port,
        public_dir = %config.public_dir.display(),
        "Configuration loaded"
    );

    // Clones share one pool, so the health route sees the connection the
    // bootstrap opens.
    let persistence = PostgresConnector::new(config.database.clone());
    let routes = DefaultRoutes::new(persistence.clone());
    let server = Bootstrap::new(persistence, routes, MessageSocket)
        .launch(config)
        .await?;

    server.run_until(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C, serving until killed");
        std::future::pending::<()>().await;
    }
}
