//! IdleSync Server
//!
//! Persistent-connection state synchronization server for an idle game.
//!
//! This server handles:
//! - Native clients over raw TCP
//! - Browser clients over WebSocket
//! - Session validation, command dispatch and delta sync of character state

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use idlesync_server::config::LogFormat;
use idlesync_server::net::handler::ConnectionHandler;
use idlesync_server::{AppState, ServerConfig, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before anything reads the environment
    dotenv::dotenv().ok();

    // The log format is part of the config, so it is loaded first
    let config = ServerConfig::load().await?;

    init_logging(config.log_format);

    info!("===========================================");
    info!("  IdleSync Server v{}", VERSION);
    info!("  {}", config.server_name);
    info!("===========================================");
    info!("Configuration loaded from: {}", config.config_path.display());
    info!(
        tcp_port = config.tcp_port,
        websocket_port = config.websocket_port,
        codec = %config.payload_codec,
        dev_mode = config.dev_mode,
        "Server configuration"
    );

    // Create shutdown signal channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let state = Arc::new(AppState::new(config.clone(), shutdown_tx.clone())?);
    state.start_maintenance();

    // Bind listeners
    let tcp_addr: SocketAddr = format!("0.0.0.0:{}", config.tcp_port).parse()?;
    let tcp_listener = TcpListener::bind(tcp_addr).await?;
    info!("TCP server listening on {}", tcp_addr);

    let ws_addr: SocketAddr = format!("0.0.0.0:{}", config.websocket_port).parse()?;
    let ws_listener = TcpListener::bind(ws_addr).await?;
    info!("WebSocket server listening on {}", ws_addr);

    let tcp_handle = spawn_acceptor(tcp_listener, state.clone(), Listener::Tcp);
    let ws_handle = spawn_acceptor(ws_listener, state.clone(), Listener::WebSocket);

    info!("Server started successfully. Press Ctrl+C to stop.");

    wait_for_shutdown().await;

    info!("Shutting down server...");
    state.shutdown();

    if let Err(e) = tcp_handle.await {
        warn!("TCP acceptor task failed: {}", e);
    }
    if let Err(e) = ws_handle.await {
        warn!("WebSocket acceptor task failed: {}", e);
    }

    info!(
        unsupported_packets = state.dispatcher.unsupported().count(),
        timeouts_fired = state.kernel.fired_count(),
        "Server shutdown complete"
    );
    Ok(())
}

/// Initialize the logging system
fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,idlesync_server=debug"));

    match format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_level(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_current_span(false)
            .init(),
    }
}

#[derive(Debug, Clone, Copy)]
enum Listener {
    Tcp,
    WebSocket,
}

/// Accept connections until shutdown, one task per connection
fn spawn_acceptor(listener: TcpListener, state: Arc<AppState>, kind: Listener) -> JoinHandle<()> {
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let handler = ConnectionHandler::new(state.clone());
                            tokio::spawn(async move {
                                let result = match kind {
                                    Listener::Tcp => handler.handle_tcp(stream, addr).await,
                                    Listener::WebSocket => handler.handle_websocket(stream, addr).await,
                                };
                                if let Err(e) = result {
                                    warn!(address = %addr, listener = ?kind, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(listener = ?kind, "Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!(listener = ?kind, "Listener shutting down");
                    break;
                }
            }
        }
    })
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
