//! Rebalancer CLI
//!
//! Commands:
//! - `rebalancer plan` - Compute the yield plan and execution readiness
//! - `rebalancer compare` - Compare protocol APRs
//! - `rebalancer paper-run` - Run one rebalance through the queue on paper chains
//! - `rebalancer rpc` - Perform one routed JSON-RPC call

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use rust_decimal::Decimal;

#[derive(Parser, Debug)]
#[command(name = "rebalancer")]
#[command(author, version, about = "Stablecoin rebalance and yield execution engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config directory (default.toml plus $REBALANCER_ENV overrides)
    #[arg(short, long, default_value = "config", global = true)]
    pub config: String,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compute the yield plan for a USDT/USDC book
    Plan {
        /// USDT balance in base units
        #[arg(long)]
        usdt: u128,
        /// USDC balance in base units
        #[arg(long)]
        usdc: u128,
        /// Target USDC share in bps
        #[arg(long)]
        target_bps: Option<u32>,
        #[arg(long)]
        min_drift_bps: Option<u32>,
        /// Per-step cap in dollars
        #[arg(long)]
        max_step_usd: Option<Decimal>,
        /// Execution protocol override
        #[arg(short, long)]
        protocol: Option<String>,
    },

    /// Compare APRs across configured protocols
    Compare,

    /// Run the primary flow through the job queue against paper chains
    PaperRun {
        /// Amount in token base units
        #[arg(short, long)]
        amount: String,
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        slippage_bps: Option<u32>,
        /// Script a rate-limited swap failure to exercise rollback and retry
        #[arg(long)]
        fail_swap: bool,
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Give up waiting for the job after this many seconds
        #[arg(long, default_value = "30")]
        wait_secs: u64,
    },

    /// Perform one routed JSON-RPC call
    Rpc {
        method: String,
        /// JSON params
        #[arg(short, long, default_value = "{}")]
        params: String,
    },
}
