//! Risk controls applied before any side-effecting step

pub mod guards;

pub use guards::{
    daily_day_key, divergence_bps, min_out_for, parse_amount_raw, quote_divergence_within,
    GuardPolicy, GuardResult, PreExecutionInput, QuoteInput,
};
