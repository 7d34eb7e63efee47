use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sms_ratelimit::config::{LimiterConfig, LogFormat, LoggingConfig, StorageBackend};
use sms_ratelimit::ratelimit::{Clock, Decision, PhoneIpRateLimiter, SystemClock};

/// Exit code of `check` when the request is denied.
const EXIT_DENIED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "sms-ratelimit", version, about = "Rate limit SMS verification requests")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Print decisions as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check and record a single request
    Check {
        #[arg(long)]
        ip: String,
        #[arg(long)]
        phone: String,
    },
    /// Check that the configured storage is reachable
    Ping,
    /// Check `<ip> <phone>` lines read from stdin
    Stdin,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config =
        LimiterConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging, cli.log_format.unwrap_or(config.logging.format));

    info!(version = env!("CARGO_PKG_VERSION"), "Starting SMS rate limiter");

    let backend = config
        .connect_storage()
        .await
        .context("Failed to initialize storage")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let limiter = config.build_limiter(backend.storage(), clock.clone());

    match cli.command {
        Command::Check { ip, phone } => {
            let decision = limiter.allow(&ip, &phone).await;
            print_decision(&decision, cli.json)?;
            if decision.allowed {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_DENIED))
            }
        }
        Command::Ping => {
            backend.storage().ping().await.context("Storage ping failed")?;
            println!("ok");
            Ok(ExitCode::SUCCESS)
        }
        Command::Stdin => {
            let sweeper = match &backend {
                StorageBackend::Memory(memory) => Some(
                    memory
                        .clone()
                        .spawn_retention_sweeper(clock, config.rate_limiting.sweep_interval)
                        .context("Failed to start retention sweeper")?,
                ),
                StorageBackend::Redis(_) => None,
            };

            let result = serve_stdin(&limiter, cli.json).await;

            if let Some(sweeper) = sweeper {
                sweeper.abort();
            }
            info!("SMS rate limiter stopped");
            result.map(|_| ExitCode::SUCCESS)
        }
    }
}

/// Initialize tracing; `RUST_LOG` takes precedence over the configured level.
fn init_tracing(logging: &LoggingConfig, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    // Decisions go to stdout, so logs go to stderr.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.with_thread_ids(true).init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Answer one `<ip> <phone>` line at a time until EOF or a shutdown signal.
async fn serve_stdin(limiter: &PhoneIpRateLimiter, json: bool) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!("Reading requests from stdin");

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = &mut shutdown => break,
        };
        let Some(line) = line else {
            info!("End of input reached");
            break;
        };

        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next(), fields.next()) {
            (None, _, _) => continue,
            (Some(ip), Some(phone), None) => {
                let decision = limiter.allow(ip, phone).await;
                print_decision(&decision, json)?;
            }
            _ => warn!(line = %line, "Expected '<ip> <phone>', skipping line"),
        }
    }

    Ok(())
}

fn print_decision(decision: &Decision, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(decision)?);
    } else if decision.allowed {
        println!("allowed");
    } else {
        println!("denied {}", humantime::format_duration(decision.remaining));
    }
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
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
