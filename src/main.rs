use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use windowgate::config::WindowgateConfig;
use windowgate::ratelimit::{Decision, RateLimiter, REJECTION_MESSAGE};
use windowgate::store::RedisCounterStore;

/// Probe and administer Windowgate rate limit windows in the shared store.
#[derive(Debug, Parser)]
#[command(name = "windowgate", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count requests for a resource and print each decision
    Check {
        /// Resource id, e.g. a webhook id
        #[arg(long)]
        id: String,
        /// Override the configured namespace
        #[arg(long)]
        namespace: Option<String>,
        /// Number of requests to count
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
    /// Show the current window for a resource without counting
    Peek {
        #[arg(long)]
        id: String,
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Clear the window for a resource
    Reset {
        #[arg(long)]
        id: String,
        #[arg(long)]
        namespace: Option<String>,
    },
}

impl Command {
    fn namespace(&self) -> Option<&str> {
        match self {
            Command::Check { namespace, .. }
            | Command::Peek { namespace, .. }
            | Command::Reset { namespace, .. } => namespace.as_deref(),
        }
    }
}

#[derive(Serialize)]
struct Report<'a> {
    key: &'a str,
    #[serde(flatten)]
    decision: Decision,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Configuration problems surface before any connection attempt
    let settings = WindowgateConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    let mut config = settings
        .rate_limiter_config()
        .context("Invalid rate limiter configuration")?;
    if let Some(namespace) = cli.command.namespace() {
        config = config
            .with_namespace(namespace)
            .context("Invalid namespace")?;
    }
    info!(config = ?config, "Configuration loaded");

    let limiter: RateLimiter<RedisCounterStore> = RateLimiter::redis(config)?;
    limiter
        .connect()
        .await
        .context("Failed to connect to counter store")?;

    let outcome = tokio::select! {
        result = run(&limiter, &cli) => result,
        _ = shutdown_signal() => Ok(()),
    };

    // Release the store session on every path, including errors
    if let Err(e) = limiter.close().await {
        warn!(error = %e, "Failed to close counter store cleanly");
    }

    info!("Windowgate stopped");
    outcome
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(limiter: &RateLimiter<RedisCounterStore>, cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Command::Check { id, repeat, .. } => {
            let key = limiter.key(id)?;
            for _ in 0..*repeat {
                let decision = limiter.check(&key).await?;
                print_decision(key.as_str(), decision, cli.json)?;
            }
        }
        Command::Peek { id, .. } => {
            let key = limiter.key(id)?;
            match limiter.peek(&key).await? {
                Some(window) => println!(
                    "{}: count={} limit={} ttl_ms={}",
                    key,
                    window.count,
                    limiter.config().limit(),
                    window.ttl.as_millis()
                ),
                None => println!("{}: no active window", key),
            }
        }
        Command::Reset { id, .. } => {
            let key = limiter.key(id)?;
            limiter.reset(&key).await?;
            println!("{}: window reset", key);
        }
    }
    Ok(())
}

fn print_decision(key: &str, decision: Decision, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(&Report { key, decision })?);
        return Ok(());
    }

    let now_ms = chrono::Utc::now().timestamp_millis();
    let verdict = if decision.allowed { "allowed" } else { "denied" };
    println!(
        "{}: {} ({}) remaining={} reset_at_ms={}",
        key,
        verdict,
        decision.status_code(),
        decision.remaining,
        decision.reset_at_epoch_ms
    );
    if !decision.allowed {
        println!("  {}", REJECTION_MESSAGE);
    }
    for (name, value) in decision.headers(now_ms) {
        println!("  {}: {}", name, value);
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
