//! mcp-host: serves the built-in tools over MCP until interrupted
//!
//! Stream mode speaks JSON-RPC on stdin/stdout; HTTP mode listens on
//! loopback. Logs always go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use mcp_host::builtin;
use mcp_host::config::{self, TransportKind};
use mcp_host::mcp::server::McpServer;

/// Transport selectable on the command line.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportArg {
    /// Newline-delimited JSON-RPC on stdin/stdout
    Stream,
    /// JSON-RPC over POST /mcp on 127.0.0.1
    Http,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Stream => Self::Stream,
            TransportArg::Http => Self::Http,
        }
    }
}

/// Lifecycle-managed MCP tool server.
///
/// Exposes the built-in `echo` and `add` tools over either a stdio stream
/// or loopback HTTP.
#[derive(Parser, Debug)]
#[command(name = "mcp-host")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(value_name = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Transport to serve on (overrides the configuration file)
    #[arg(short, long, value_enum)]
    transport: Option<TransportArg>,

    /// HTTP port (overrides the configuration file; a free port is chosen when unset)
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
    port: Option<u16>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long)]
    quiet: bool,
}

/// Determines the log level from CLI arguments.
#[allow(clippy::match_same_arms)] // Explicit "warn" arm for clarity
fn get_log_level(verbose: u8, quiet: bool, config_level: &str) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => match config_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber for logging.
fn init_tracing(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Waits for SIGINT/SIGTERM or for the stream peer to hang up.
#[cfg(unix)]
async fn wait_for_shutdown(peer_closed: Option<watch::Receiver<bool>>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
        _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
        () = peer_hang_up(peer_closed) => info!("Client disconnected, shutting down"),
    }
    Ok(())
}

/// Waits for Ctrl+C or for the stream peer to hang up.
#[cfg(windows)]
async fn wait_for_shutdown(peer_closed: Option<watch::Receiver<bool>>) -> std::io::Result<()> {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        () = peer_hang_up(peer_closed) => info!("Client disconnected, shutting down"),
    }
    Ok(())
}

async fn peer_hang_up(peer_closed: Option<watch::Receiver<bool>>) {
    match peer_closed {
        Some(mut rx) => {
            // A dropped sender means the stream task ended, which is also a hang-up.
            let _ = rx.wait_for(|closed| *closed).await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn serve(mut server: McpServer) -> Result<(), mcp_host::error::ServerError> {
    server.start().await?;

    if let Err(e) = wait_for_shutdown(server.transport_closed()).await {
        error!(error = %e, "Failed to install signal handlers");
    }

    server.stop().await
}

/// Entry point for the mcp-host server.
fn main() -> ExitCode {
    let args = Args::parse();

    let config_path = args.config.as_deref();
    let mut cfg = match config::load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(transport) = args.transport {
        cfg.server.transport = transport.into();
    }
    if let Some(port) = args.port {
        cfg.server.port = Some(port);
    }

    let log_level = get_log_level(args.verbose, args.quiet, &cfg.logging.level);
    init_tracing(log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        transport = %cfg.server.transport,
        "Starting mcp-host"
    );

    let server = match McpServer::new(cfg.server, builtin::tools()) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Invalid server configuration");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(server)) {
        Ok(()) => {
            info!("Server shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::FAILURE
        }
    }
}
