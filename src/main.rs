//! lloadd: LDAP load balancer daemon.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌──────────────────────────────────────────────────────┐
//!                      │                     LOAD BALANCER                      │
//!                      │                                                        │
//!   Client PDU         │  ┌──────────┐   ┌───────────┐   ┌────────────────┐     │
//!   ───────────────────┼─▶│   net    │──▶│  session  │──▶│ load_balancer  │     │
//!                      │  │ listener │   │  client   │   │ pool::select   │     │
//!                      │  └──────────┘   └─────┬─────┘   └───────┬────────┘     │
//!                      │                       │ bind            │              │
//!                      │                       ▼                 ▼              │
//!   Client result      │  ┌──────────┐   ┌───────────┐   ┌────────────────┐     │
//!   ◀──────────────────┼──│connection│◀──│  session  │◀──│   upstream     │◀────┼── Backend
//!                      │  │  writer  │   │ upstream  │   │  connection    │     │   directory
//!                      │  └──────────┘   └───────────┘   └───────▲────────┘     │
//!                      │                                         │              │
//!                      │                                 ┌───────┴────────┐     │
//!                      │                                 │   supervisor   │     │
//!                      │                                 │ retry/connect  │     │
//!                      │                                 └────────────────┘     │
//!                      └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use lload_proxy::config::load_config;
use lload_proxy::lifecycle::{signals, Daemon, Shutdown};
use lload_proxy::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "lloadd")]
#[command(version, about = "LDAP load balancer", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Log level override (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", cli.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if cli.check {
        println!("{}: configuration OK", cli.config.display());
        return ExitCode::SUCCESS;
    }

    if let Err(e) = logging::init(&config.observability, cli.log_level.as_deref()) {
        eprintln!("failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "lloadd starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    tracing::info!(
        listeners = config.listener.listen.len(),
        backends = config.backends.len(),
        features = ?config.proxy.features,
        "Configuration loaded"
    );

    let daemon = match Daemon::bind(&config).await {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = Shutdown::new();
    signals::spawn_signal_handler(shutdown.clone());
    daemon.run(shutdown).await;
    ExitCode::SUCCESS
}
