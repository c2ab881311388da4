//! Pre-execution risk guards
//!
//! Every guard is a pure function over the proposed transfer. A failing guard
//! aborts the run before the side-effecting step it protects.

use crate::config::GuardConfig;
use crate::error::GuardViolation;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

pub type GuardResult = std::result::Result<(), GuardViolation>;

const BPS_DENOMINATOR: u128 = 10_000;

/// Parse a base-unit integer string. Zero is not a transferable amount.
pub fn parse_amount_raw(raw: &str) -> std::result::Result<u128, GuardViolation> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(GuardViolation::InvalidAmount {
            raw: raw.to_string(),
        });
    }
    match trimmed.parse::<u128>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(GuardViolation::InvalidAmount {
            raw: raw.to_string(),
        }),
    }
}

pub fn amount_within_max(amount_raw: u128, max_amount_raw: u128) -> GuardResult {
    if amount_raw > max_amount_raw {
        return Err(GuardViolation::AmountExceedsMax {
            amount_raw,
            max_raw: max_amount_raw,
        });
    }
    Ok(())
}

pub fn quote_above_minimum(quote_out_raw: u128, min_quote_out_raw: u128) -> GuardResult {
    if quote_out_raw < min_quote_out_raw {
        return Err(GuardViolation::QuoteBelowMinimum {
            quote_out_raw,
            min_raw: min_quote_out_raw,
        });
    }
    Ok(())
}

pub fn slippage_within_bound(slippage_bps: u32, max_slippage_bps: u32) -> GuardResult {
    if slippage_bps > max_slippage_bps {
        return Err(GuardViolation::SlippageExceedsMax {
            slippage_bps,
            max_bps: max_slippage_bps,
        });
    }
    Ok(())
}

/// `min_out` must be positive and no larger than the quote it was derived from
pub fn min_out_valid(min_amount_out_raw: u128, quote_out_raw: u128) -> GuardResult {
    if min_amount_out_raw == 0 || min_amount_out_raw > quote_out_raw {
        return Err(GuardViolation::InvalidMinOutBoundary {
            min_out_raw: min_amount_out_raw,
            quote_out_raw,
        });
    }
    Ok(())
}

/// Catches catastrophically mispriced quotes between same-decimals stablecoins
pub fn effective_rate_above_floor(
    quote_out_raw: u128,
    amount_raw: u128,
    min_effective_rate: Decimal,
) -> GuardResult {
    let rate = effective_rate(quote_out_raw, amount_raw);
    if rate < min_effective_rate {
        return Err(GuardViolation::EffectiveRateBelowFloor {
            rate,
            floor: min_effective_rate,
        });
    }
    Ok(())
}

pub fn daily_limit_not_reached(daily_count: u32, daily_max: u32) -> GuardResult {
    if daily_count >= daily_max {
        return Err(GuardViolation::DailyLimitReached {
            count: daily_count,
            max: daily_max,
        });
    }
    Ok(())
}

pub fn cooldown_elapsed(
    last_executed_at: Option<DateTime<Utc>>,
    cooldown_seconds: i64,
    now: DateTime<Utc>,
) -> GuardResult {
    let Some(last) = last_executed_at else {
        return Ok(());
    };
    let elapsed = now.signed_duration_since(last).num_seconds();
    if elapsed < cooldown_seconds {
        return Err(GuardViolation::CooldownActive {
            remaining_secs: cooldown_seconds - elapsed,
        });
    }
    Ok(())
}

/// Off-chain price vs on-chain router quote, secondary chain only
pub fn quote_divergence_within(
    offchain_out_raw: u128,
    onchain_out_raw: u128,
    max_divergence_bps: u32,
) -> GuardResult {
    let divergence_bps = divergence_bps(offchain_out_raw, onchain_out_raw);
    if divergence_bps > max_divergence_bps {
        return Err(GuardViolation::QuoteDivergence {
            divergence_bps,
            max_bps: max_divergence_bps,
        });
    }
    Ok(())
}

/// Relative difference of two quotes against the larger one, in bps
pub fn divergence_bps(a: u128, b: u128) -> u32 {
    let hi = a.max(b);
    if hi == 0 {
        return 0;
    }
    let diff = a.abs_diff(b);
    let bps = diff.saturating_mul(BPS_DENOMINATOR) / hi;
    u32::try_from(bps).unwrap_or(u32::MAX)
}

/// `quote * (10000 - slippage) / 10000`, rounded down
pub fn min_out_for(quote_out_raw: u128, slippage_bps: u32) -> u128 {
    let keep = BPS_DENOMINATOR.saturating_sub(u128::from(slippage_bps));
    quote_out_raw.saturating_mul(keep) / BPS_DENOMINATOR
}

fn effective_rate(quote_out_raw: u128, amount_raw: u128) -> Decimal {
    let (Some(quote), Some(amount)) = (Decimal::from_u128(quote_out_raw), Decimal::from_u128(amount_raw)) else {
        return Decimal::ZERO;
    };
    quote.checked_div(amount).unwrap_or(Decimal::ZERO)
}

/// UTC day key used for the daily run window
pub fn daily_day_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// Guard thresholds bundled from configuration
#[derive(Debug, Clone)]
pub struct GuardPolicy {
    pub max_amount_raw: u128,
    pub max_slippage_bps: u32,
    pub min_quote_out_raw: u128,
    pub min_effective_rate: Decimal,
    pub daily_max: u32,
    pub cooldown_secs: i64,
    pub max_divergence_bps: u32,
}

impl From<&GuardConfig> for GuardPolicy {
    fn from(config: &GuardConfig) -> Self {
        Self {
            max_amount_raw: u128::from(config.max_amount_raw),
            max_slippage_bps: config.max_slippage_bps,
            min_quote_out_raw: u128::from(config.min_quote_out_raw),
            min_effective_rate: config.min_effective_rate,
            daily_max: config.daily_max,
            cooldown_secs: config.cooldown_secs,
            max_divergence_bps: config.max_divergence_bps,
        }
    }
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self::from(&GuardConfig::default())
    }
}

/// Inputs checked before any on-chain mutation
#[derive(Debug, Clone, Copy)]
pub struct PreExecutionInput {
    pub amount_raw: u128,
    pub slippage_bps: u32,
    pub daily_count: u32,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// Inputs checked once a swap quote is known
#[derive(Debug, Clone, Copy)]
pub struct QuoteInput {
    pub amount_raw: u128,
    pub quote_out_raw: u128,
    pub min_out_raw: u128,
}

impl GuardPolicy {
    /// First failing pre-execution guard, in evaluation order
    pub fn check_pre_execution(&self, input: &PreExecutionInput) -> GuardResult {
        amount_within_max(input.amount_raw, self.max_amount_raw)?;
        slippage_within_bound(input.slippage_bps, self.max_slippage_bps)?;
        daily_limit_not_reached(input.daily_count, self.daily_max)?;
        cooldown_elapsed(input.last_executed_at, self.cooldown_secs, input.now)?;
        Ok(())
    }

    /// First failing quote guard, in evaluation order
    pub fn check_quote(&self, input: &QuoteInput) -> GuardResult {
        quote_above_minimum(input.quote_out_raw, self.min_quote_out_raw)?;
        min_out_valid(input.min_out_raw, input.quote_out_raw)?;
        effective_rate_above_floor(input.quote_out_raw, input.amount_raw, self.min_effective_rate)?;
        Ok(())
    }

    /// Every failing guard, for reporting
    pub fn evaluate_all(
        &self,
        pre: &PreExecutionInput,
        quote: Option<&QuoteInput>,
    ) -> Vec<GuardViolation> {
        let mut results = vec![
            amount_within_max(pre.amount_raw, self.max_amount_raw),
            slippage_within_bound(pre.slippage_bps, self.max_slippage_bps),
            daily_limit_not_reached(pre.daily_count, self.daily_max),
            cooldown_elapsed(pre.last_executed_at, self.cooldown_secs, pre.now),
        ];
        if let Some(q) = quote {
            results.push(quote_above_minimum(q.quote_out_raw, self.min_quote_out_raw));
            results.push(min_out_valid(q.min_out_raw, q.quote_out_raw));
            results.push(effective_rate_above_floor(
                q.quote_out_raw,
                q.amount_raw,
                self.min_effective_rate,
            ));
        }
        results.into_iter().filter_map(|r| r.err()).collect()
    }
}
