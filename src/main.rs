use clap::Parser;
use rebalancer::cli::commands::{self, PaperRunArgs};
use rebalancer::cli::output::OutputMode;
use rebalancer::cli::{Cli, Commands};
use rebalancer::config::AppConfig;
use rebalancer::telemetry::{init_logging, init_logging_simple};
use std::time::Duration;
use tokio::signal;
use tracing::{error, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mode = OutputMode::from_json_flag(cli.json);
    let config = AppConfig::load_from(&cli.config)?;

    match cli.command {
        Commands::Plan {
            usdt,
            usdc,
            target_bps,
            min_drift_bps,
            max_step_usd,
            protocol,
        } => {
            init_logging_simple();
            commands::plan(&config, usdt, usdc, target_bps, min_drift_bps, max_step_usd, protocol)
                .await?;
        }
        Commands::Compare => {
            init_logging_simple();
            commands::compare(&config, mode).await?;
        }
        Commands::PaperRun {
            amount,
            run_id,
            slippage_bps,
            fail_swap,
            max_attempts,
            wait_secs,
        } => {
            init_logging(&config.logging);
            let args = PaperRunArgs {
                amount,
                run_id,
                slippage_bps,
                fail_swap,
                max_attempts,
                wait: Duration::from_secs(wait_secs),
            };
            tokio::select! {
                result = commands::paper_run(config, args) => result?,
                _ = shutdown_signal() => warn!("Interrupted, paper run abandoned"),
            }
        }
        Commands::Rpc { method, params } => {
            init_logging_simple();
            commands::rpc(&config, &method, &params, mode).await?;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
