use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use fastlimiter::ratelimit::AsyncObserver;
use fastlimiter::{Decision, LimiterConfig, RateLimiter};

/// Exercise a token bucket configuration from the command line.
#[derive(Parser, Debug)]
#[command(name = "fastlimiter", version, about)]
struct Cli {
    /// YAML configuration file. FASTLIMITER_* environment variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration and print the effective values
    Check,

    /// Send requests for one or more client keys through the limiter
    Simulate {
        /// Client key, e.g. a remote address. Repeat for several clients.
        #[arg(short, long = "key", default_value = "127.0.0.1")]
        keys: Vec<String>,

        /// Requests per client
        #[arg(short = 'n', long, default_value_t = 20)]
        requests: u32,

        /// Pause between rounds, in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
}

/// Logs every decision off the admission path.
struct DecisionLogger;

#[async_trait]
impl AsyncObserver for DecisionLogger {
    async fn on_decision(&self, allowed: bool, key: String) -> anyhow::Result<()> {
        debug!(key = %key, allowed, "Decision observed");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = LimiterConfig::load(cli.config.as_deref())?;
    config.validate()?;
    info!(
        rate = config.rate,
        period_secs = config.period.total_seconds(),
        capacity = config.capacity,
        burst = config.burst,
        "Configuration loaded"
    );

    match cli.command {
        Command::Check => {
            print!("{}", serde_yaml::to_string(&config)?);
            let limiter = RateLimiter::new(&config)?;
            let limits = limiter.config().limits;
            println!(
                "# {:.4} tokens/s, ceiling {} tokens",
                limits.refill_rate(),
                limits.ceiling()
            );
        }
        Command::Simulate {
            keys,
            requests,
            interval_ms,
        } => {
            let limiter = Arc::new(RateLimiter::new(&config)?);
            limiter.on_decision_async(Arc::new(DecisionLogger));

            tokio::select! {
                _ = simulate(&limiter, &keys, requests, Duration::from_millis(interval_ms)) => {}
                _ = shutdown_signal() => {}
            }

            for key in &keys {
                let report = serde_json::json!({ "key": key, "stats": limiter.stats(key) });
                println!("{}", serde_json::to_string(&report)?);
            }
        }
    }

    Ok(())
}

async fn simulate(limiter: &RateLimiter, keys: &[String], requests: u32, interval: Duration) {
    for round in 1..=requests {
        for key in keys {
            match limiter.admit(key) {
                Decision::Allowed => println!("{} #{}: 200 OK", key, round),
                Decision::Denied { wait } => println!(
                    "{} #{}: 429 Too Many Requests (retry after {:.2}s)",
                    key,
                    round,
                    wait.as_secs_f64()
                ),
            }
        }

        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }
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

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping simulation");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping simulation");
        }
    }
}
