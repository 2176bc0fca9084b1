//! SBP Engine: Stigmergic Blackboard Protocol
//!
//! A coordination substrate for multi-agent systems. Agents never address
//! one another - they deposit time-decaying pheromones onto named trails
//! and register declarative scents whose predicates the engine re-tests on
//! a periodic loop, pushing trigger notifications to subscribers.
//!
//! When emitters fall silent, their signals decay naturally and dependent
//! scents go quiet - failing safely rather than acting on stale data.

pub mod core;
pub mod server;

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::core::{Blackboard, Config};
use crate::server::{start_server, SessionRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!("🧪 SBP Engine: Stigmergic Blackboard Protocol");
    info!("================================================");

    // Load configuration
    let mut config = Config::load_default().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config.toml: {}. Using defaults.", e);
        Config::default()
    });

    // Environment override for the listen port
    if let Ok(port) = std::env::var("SBP_PORT") {
        if let Ok(port) = port.parse() {
            config.server.port = port;
        }
    }
    let config = Arc::new(config);

    // Build the engine and its session registry
    let board = Arc::new(Blackboard::new(config.clone()));
    let sessions = Arc::new(SessionRegistry::new(config.server.replay_buffer_len));

    info!(
        "🧠 Blackboard online (tick {}ms, history window {}ms)",
        config.engine.tick_interval_ms, config.engine.history_window_ms
    );

    // Start the evaluation loop
    let loop_handle = board.clone().start();

    // Start the HTTP server
    let server_config = config.clone();
    let server_board = board.clone();
    let server_sessions = sessions.clone();
    tokio::spawn(async move {
        if let Err(e) = start_server(server_config, server_board, server_sessions).await {
            tracing::error!("Server error: {}", e);
        }
    });

    info!("================================================");
    info!("🌐 JSON-RPC endpoint: http://localhost:{}/sbp", config.server.port);
    info!("📡 Push channel: GET http://localhost:{}/sbp", config.server.port);
    info!("💚 Health check: http://localhost:{}/health", config.server.port);
    info!("================================================");
    info!("Press Ctrl+C to stop the engine");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    info!("🛑 Shutting down...");

    // Let the in-flight tick finish before exiting
    board.stop();
    let _ = loop_handle.await;

    info!("👋 SBP Engine stopped");

    Ok(())
}
