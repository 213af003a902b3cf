//! Socksgate - SOCKS5 proxy server
//!
//! This is the main entry point for the Socksgate application.

use anyhow::Result;
use clap::Parser;
use socksgate::config::{load_config, Config};
use socksgate::events::{EventReceiver, ServerEvent};
use socksgate::server::Server;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Socksgate - SOCKS5 proxy server with pluggable auth and upstream chaining
#[derive(Parser, Debug)]
#[command(name = "socksgate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable diagnostic logging
    #[arg(short, long)]
    verbose: bool,

    /// Require username/password authentication
    #[arg(long)]
    require_auth: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    apply_overrides(&mut config, &args);
    config.server.validate()?;

    // Setup logging
    let level = if config.server.verbose {
        "debug"
    } else {
        args.log_level.as_str()
    };
    setup_logging(level, args.json_log)?;

    info!("Socksgate v{}", socksgate::VERSION);
    if let Some(path) = &args.config {
        info!("Configuration loaded from: {:?}", path);
    }
    if config.server.require_authentication {
        info!(
            "Username/password authentication enabled ({} users)",
            config.server.users.len()
        );
    }

    let server = Server::new(config.server)?;
    let events = server.subscribe();
    let listening = server.bind().await?;
    tokio::spawn(log_events(events));

    // Setup shutdown signal
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Handle Ctrl+C and termination signals (cross-platform)
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {
                            info!("Received Ctrl+C, shutting down...");
                        }
                        _ = sigterm.recv() => {
                            info!("Received SIGTERM, shutting down...");
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to setup SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received Ctrl+C, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            // On Windows, only handle Ctrl+C
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down...");
        }

        let _ = shutdown_tx.send(true);
    });

    // Run the server
    listening.run(shutdown_rx).await
}

/// Command line flags take precedence over the config file
fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if args.verbose {
        config.server.verbose = true;
    }
    if args.require_auth {
        config.server.require_authentication = true;
    }
}

/// Log connection closures and transport errors
async fn log_events(mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            ServerEvent::ConnectionClosed(summary) => {
                info!(
                    "Connection {} to {}:{} closed after {:?}: {} bytes up, {} bytes down",
                    summary.id,
                    summary.destination_host,
                    summary.destination_port,
                    summary.duration,
                    summary.stats.sent_to_destination,
                    summary.stats.sent_to_client
                );
            }
            ServerEvent::TransportError(e) => warn!("Transport error: {}", e),
            event => debug!("Server event: {:?}", event),
        }
    }
}

/// Setup logging based on configuration
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // RUST_LOG directives refine the base level
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
