//! Origin Guard - TLS origin protection behind a CDN
//!
//! Serves HTTPS only to the CDN's edge: SNI-bound certificates, an edge IP
//! allowlist and optional origin-pull client certificates.

use std::net::IpAddr;
use std::process::ExitCode;

use axum::{Router, routing::get};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use origin_guard::{
    cli::{Cli, Command},
    config::Config,
    gate::ConnectionGate,
    ranges::{HttpRangeSource, RangeSource},
    server::OriginServer,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    // Handle subcommands
    match &cli.command {
        Some(Command::Ranges { check }) => run_ranges(&cli, *check).await,
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> Option<Config> {
    match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host.clone_from(host);
            }
            Some(config)
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            None
        }
    }
}

/// Fetch the edge ranges once and print them
async fn run_ranges(cli: &Cli, check: Option<IpAddr>) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    let source = match HttpRangeSource::from_config(&config.ip_filter) {
        Ok(source) => source,
        Err(e) => {
            error!("Failed to build range source: {e}");
            return ExitCode::FAILURE;
        }
    };

    let ranges = match source.fetch().await {
        Ok(ranges) => ranges,
        Err(e) => {
            eprintln!("Failed to fetch edge ranges: {e}");
            return ExitCode::FAILURE;
        }
    };

    for net in ranges.iter() {
        println!("{net}");
    }
    eprintln!("{} prefixes", ranges.len());

    match check {
        Some(ip) if ranges.contains(ip) => {
            println!("{ip} is inside the edge ranges");
            ExitCode::SUCCESS
        }
        Some(ip) => {
            println!("{ip} is NOT inside the edge ranges");
            ExitCode::FAILURE
        }
        None => ExitCode::SUCCESS,
    }
}

/// Run the origin server
async fn run_server(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    let addr = match config.server.bind_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        %addr,
        certificates = config.tls.certificates.len(),
        ip_filter = config.ip_filter.enabled,
        origin_pull = config.tls.origin_pull_ca.is_some(),
        "Starting Origin Guard"
    );

    // Bootstrap happens here; without a first range set nothing is served
    let gate = match ConnectionGate::from_config(&config).await {
        Ok(gate) => gate,
        Err(e) => {
            error!(fatal = e.is_fatal(), "Failed to build connection gate: {e}");
            return ExitCode::FAILURE;
        }
    };

    let server = match OriginServer::bind(addr, gate, &config.server).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to bind {addr}: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.serve_with_shutdown(app(), shutdown_signal()).await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Origin Guard shutdown complete");
    ExitCode::SUCCESS
}

/// Default application served behind the gate
fn app() -> Router {
    Router::new()
        .route("/", get(|| async { "Hello from the origin\n" }))
        .route("/health", get(|| async { "ok\n" }))
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
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
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
