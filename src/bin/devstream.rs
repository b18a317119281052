//! devstream CLI binary.
//!
//! Device-side stream negotiation agent.
//!
//! # Commands
//!
//! - `simulate` - Run a device session against an in-process loopback broker
//! - `inspect` - Parse a device connection string and print a redacted summary
//! - `config [--file <path>]` - Print the effective configuration

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use devstream::{
    config::Config,
    session::SessionRunner,
    transport::{ConnectionString, LoopbackHub, ServiceReply},
    VERSION,
};

/// Connection string used by `simulate` when none is configured
const SIMULATED_CONNECTION_STRING: &str =
    "HostName=loopback.local;DeviceId=devstream-sim;SharedAccessKey=c2ltdWxhdGVk";

#[derive(Parser)]
#[command(name = "devstream")]
#[command(version = VERSION)]
#[command(about = "Device-side stream negotiation agent", long_about = None)]
struct Cli {
    /// Config file path (default: <config dir>/devstream/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a device session against an in-process loopback broker
    Simulate {
        /// Payload the simulated service sends (repeatable)
        #[arg(short, long = "message", default_value = "hello")]
        messages: Vec<String>,

        /// Device connection string (default: configured or a simulated identity)
        #[arg(long)]
        connection_string: Option<String>,

        /// Reject stream requests instead of accepting them
        #[arg(long)]
        reject: bool,

        /// Keep listening until every message has been served
        #[arg(short, long)]
        keep_listening: bool,

        /// Per-attempt timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Answer with the upper-cased payload instead of echoing it
        #[arg(short, long)]
        uppercase: bool,

        /// Print session statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Parse a device connection string and print a redacted summary
    Inspect {
        /// Device connection string
        connection_string: String,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Config file to load (overrides the global --config)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = match &cli.command {
        Commands::Config { file: Some(file) } => Some(file.clone()),
        _ => cli.config.clone(),
    };
    let config = Config::load(config_path.as_deref())?;

    match cli.command {
        Commands::Simulate {
            messages,
            connection_string,
            reject,
            keep_listening,
            timeout,
            uppercase,
            json,
        } => cmd_simulate(
            config,
            messages,
            connection_string,
            reject,
            keep_listening,
            timeout,
            uppercase,
            json,
        ),
        Commands::Inspect { connection_string } => cmd_inspect(&connection_string),
        Commands::Config { .. } => cmd_config(&config),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_simulate(
    config: Config,
    messages: Vec<String>,
    connection_string: Option<String>,
    reject: bool,
    keep_listening: bool,
    timeout: Option<u64>,
    uppercase: bool,
    json: bool,
) -> anyhow::Result<()> {
    let mut session = config.session.clone();
    if let Some(secs) = timeout {
        session = session.with_timeout(Duration::from_secs(secs));
    }
    if reject {
        session = session.with_accept_requests(false);
    }
    if keep_listening {
        session = session.with_keep_listening(true);
    }
    let keep_listening = session.keep_listening;

    let connection_string = connection_string
        .or(config.device.connection_string)
        .unwrap_or_else(|| SIMULATED_CONNECTION_STRING.to_string());

    // An unparsable string is reported by the session itself
    let device_id = connection_string
        .parse::<ConnectionString>()
        .map(|parsed| parsed.device_id)
        .unwrap_or_default();

    let hub = Arc::new(LoopbackHub::new());
    let runner = SessionRunner::new(hub.clone(), hub.clone())
        .with_config(session)
        .with_transport(config.device.transport);

    let transform: Option<fn(&str) -> String> = if uppercase {
        Some(|msg: &str| msg.to_uppercase())
    } else {
        None
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let stats = runtime.block_on(async {
        let interrupt = runner.cancellation_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, cancelling session");
                interrupt.cancel();
            }
        });

        let service = hub.clone();
        let done = runner.cancellation_token();
        let service_task = tokio::spawn(async move {
            for message in messages {
                match service.initiate(&device_id, &message).await {
                    Ok(ServiceReply::Response(text)) => {
                        println!("service: sent {message:?}, device answered {text:?}");
                    },
                    Ok(ServiceReply::Rejected) => {
                        println!("service: device rejected {message:?}");
                    },
                    Err(e) => println!("service: stream for {message:?} failed: {e}"),
                }
            }
            if keep_listening {
                done.cancel();
            }
        });

        let stats = runner
            .run_session(&connection_string, transform, |status: &str| {
                println!("device: {status}");
            })
            .await;

        // Messages beyond the first stay pending when the device stops listening
        service_task.abort();
        stats
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!(
            "Session {}: {} attempts, {} exchanged, {} rejected, {} empty, {} failed",
            stats.session_id,
            stats.attempts,
            stats.exchanged,
            stats.rejected,
            stats.empty,
            stats.failed
        );
    }

    Ok(())
}

fn cmd_inspect(connection_string: &str) -> anyhow::Result<()> {
    let parsed: ConnectionString = connection_string.parse()?;
    println!("{}", serde_json::to_string_pretty(&parsed.summary())?);
    Ok(())
}

fn cmd_config(config: &Config) -> anyhow::Result<()> {
    print!("{}", config.to_toml()?);
    Ok(())
}
