use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::http::HttpServer;
use tollgate::ratelimit::RateLimiter;

/// Per-client token bucket admission control.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP server with every route behind the rate limiter
    Serve(ServeArgs),
    /// Fire a series of decisions for one client and print the outcomes
    Simulate(SimulateArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Bucket capacity (burst size)
    #[arg(long)]
    capacity: Option<u32>,

    /// Tokens refilled per second
    #[arg(long)]
    rate: Option<f64>,

    /// Identify clients by X-Forwarded-For / X-Real-IP
    #[arg(long)]
    trust_forwarded_headers: bool,
}

#[derive(Debug, Args)]
struct SimulateArgs {
    /// Client address to simulate
    #[arg(long, default_value = "192.168.1.1")]
    ip: String,

    /// Number of requests to issue
    #[arg(short = 'n', long, default_value_t = 20)]
    requests: u32,

    /// Bucket capacity (burst size)
    #[arg(long, default_value_t = 10)]
    capacity: u32,

    /// Tokens refilled per second
    #[arg(long, default_value_t = 1.0)]
    rate: f64,

    /// Pause after each rejected request, in milliseconds
    #[arg(long, default_value_t = 2000)]
    backoff_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Simulate(args) => simulate(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TollgateConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(capacity) = args.capacity {
        config.rate_limiting.capacity = capacity;
    }
    if let Some(rate) = args.rate {
        config.rate_limiting.refill_rate = rate;
    }
    if args.trust_forwarded_headers {
        config.server.trust_forwarded_headers = true;
    }
    config.validate()?;
    info!(listen_addr = %config.server.listen_addr, "Configuration loaded");

    let rate_limiter = Arc::new(RateLimiter::from_config(&config.rate_limiting)?);
    info!(
        capacity = rate_limiter.capacity(),
        refill_rate = rate_limiter.refill_rate(),
        "Rate limiter initialized"
    );

    let server = HttpServer::from_config(&config.server, rate_limiter)
        .sweep_interval(Duration::from_secs(config.rate_limiting.sweep_interval_secs));

    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Tollgate stopped");
    Ok(())
}

async fn simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let limiter = RateLimiter::new(args.capacity, args.rate)?;
    let backoff = Duration::from_millis(args.backoff_ms);

    for _ in 0..args.requests {
        if limiter.allow(&args.ip)? {
            println!("success");
        } else {
            println!("rate limited");
            tokio::time::sleep(backoff).await;
        }
    }

    println!("complete");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
