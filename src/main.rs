use std::process::ExitCode;

use clap::Parser;

use chainsync::config::AppConfig;
use chainsync::supervisor::{self, RunOutcome};
use chainsync::telemetry::{init_tracing, TelemetryConfig};

/// EVM-chain block indexer: syncs blocks and Transfer logs into PostgreSQL.
///
/// All configuration comes from the environment (RPC_URL, DATABASE_URL, ...);
/// the flags below override their env counterparts for local runs.
#[derive(Parser, Debug)]
#[command(name = "chainsync", version, about)]
struct Cli {
    /// Override HEALTH_CHECK_PORT.
    #[arg(long)]
    health_port: Option<u16>,

    /// Override API_PORT.
    #[arg(long)]
    api_port: Option<u16>,

    /// Validate configuration and exit.
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("chainsync: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = cli.health_port {
        config.health_check_port = port;
    }
    if let Some(port) = cli.api_port {
        config.api_port = port;
    }

    if cli.check_config {
        println!(
            "configuration ok (database {}, {} rpc endpoint(s))",
            config.redacted_database_url(),
            config.rpc_urls.len()
        );
        return ExitCode::SUCCESS;
    }

    if let Err(e) = init_tracing(TelemetryConfig::new(&config.log_level, &config.log_format)) {
        eprintln!("chainsync: failed to initialise logging: {e}");
        return ExitCode::FAILURE;
    }

    match supervisor::run(config).await {
        Ok(RunOutcome::Graceful) => {
            tracing::info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Ok(RunOutcome::LockContention) => ExitCode::SUCCESS,
        Ok(RunOutcome::Fatal(e)) => {
            tracing::error!(error = %e, "exiting after fatal condition");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            ExitCode::FAILURE
        }
    }
}
