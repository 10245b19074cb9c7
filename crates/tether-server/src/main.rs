//! tether-server: reattachable terminal sessions over WebSocket.
//!
//! Hosts an interactive program in a PTY per session, keeps its recent output
//! so clients can disconnect and reattach, and persists resumable ids when
//! the server stops.

mod config;
mod mux;
mod server;
mod session;
mod shutdown;
mod store;
mod transport;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::TetherServer;
use session::{PtySpawner, SessionRegistry};
use shutdown::ShutdownCoordinator;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use store::ResumeStore;
use tracing::{error, info, warn};

/// tether-server: reattachable PTY sessions over WebSocket
#[derive(Parser, Debug)]
#[command(name = "tether-server", version, about = "Reattachable terminal session server")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Config file path
    #[arg(long, default_value = "~/.tether/config.toml")]
    config: String,

    /// Program hosted in each session
    #[arg(long)]
    program: Option<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// File holding resumable ids across restarts
    #[arg(long)]
    state_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting tether-server");

    // Load server config (file + CLI overrides)
    let overrides = CliOverrides {
        bind: cli.bind,
        port: cli.port,
        max_sessions: cli.max_sessions,
        program: cli.program.clone(),
        state_file: cli.state_file.clone(),
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    let scanner = match server_config.resume_scanner() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "invalid resume pattern");
            std::process::exit(1);
        }
    };

    // Read-once: offers from the previous run are cleared as they are loaded
    let store = ResumeStore::new(server_config.state_file.clone());
    let offers = store.take().await.unwrap_or_else(|e| {
        warn!(path = %store.path().display(), error = %e, "failed to read resume store");
        Vec::new()
    });

    let registry = SessionRegistry::new(
        server_config.session.clone(),
        scanner,
        Arc::new(PtySpawner),
    );
    let server = Arc::new(TetherServer::new(&server_config, registry.clone(), offers));

    // Run until shutdown signal
    tokio::select! {
        result = server.clone().run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    let coordinator = ShutdownCoordinator::new(
        registry,
        store,
        server_config.shutdown_grace,
        server_config.shutdown_poll,
    );
    let report = coordinator.run().await;

    // Close connections that never held a session, then let writers flush.
    info!("broadcasting shutdown to connected clients");
    server.notify_shutdown();
    tokio::time::sleep(server_config.shutdown_poll).await;

    info!(
        saved = report.saved,
        timed_out = report.timed_out,
        "tether-server stopped"
    );
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
