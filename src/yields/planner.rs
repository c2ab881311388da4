//! Hold / rebalance decision for the USDT-USDC stable book

use crate::domain::amount;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;

pub const BPS_DENOMINATOR: u32 = 10_000;

pub const TOKEN_USDT: &str = "USDT";
pub const TOKEN_USDC: &str = "USDC";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Balances {
    pub usdt_raw: u128,
    pub usdc_raw: u128,
}

impl Balances {
    pub fn new(usdt_raw: u128, usdc_raw: u128) -> Self {
        Self { usdt_raw, usdc_raw }
    }

    pub fn total(&self) -> u128 {
        self.usdt_raw.saturating_add(self.usdc_raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AprPair {
    pub usdt_bps: u32,
    pub usdc_bps: u32,
}

#[derive(Debug, Clone)]
pub struct PlanInput {
    pub balances: Balances,
    /// Desired USDC share in bps
    pub target_bps: u32,
    pub min_drift_bps: u32,
    /// Cap on a single step, in whole dollars
    pub max_step_usd: Decimal,
    pub token_decimals: u32,
    pub apr: Option<AprPair>,
    pub min_apr_delta_bps: u32,
    pub apr_bias_cap_bps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Hold,
    Rebalance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct YieldPlan {
    pub action: PlanAction,
    pub reason: String,
    pub target_bps: u32,
    pub effective_target_bps: u32,
    pub current_bps: u32,
    pub drift_bps: u32,
    #[serde(with = "amount")]
    pub recommended_amount_raw: u128,
    pub from_token: Option<String>,
    pub to_token: Option<String>,
}

impl YieldPlan {
    pub fn is_rebalance(&self) -> bool {
        self.action == PlanAction::Rebalance
    }
}

/// Shifts the target toward whichever token pays more, by at most `cap_bps`
pub fn biased_target_bps(target_bps: u32, apr: Option<AprPair>, min_delta_bps: u32, cap_bps: u32) -> u32 {
    let Some(apr) = apr else {
        return target_bps;
    };
    let delta = apr.usdc_bps.abs_diff(apr.usdt_bps);
    if delta <= min_delta_bps {
        return target_bps;
    }
    let shift = delta.min(cap_bps);
    if apr.usdc_bps > apr.usdt_bps {
        target_bps.saturating_add(shift).min(BPS_DENOMINATOR)
    } else {
        target_bps.saturating_sub(shift)
    }
}

/// `max_step_usd` in token base units
pub fn step_cap_raw(max_step_usd: Decimal, decimals: u32) -> u128 {
    if max_step_usd <= Decimal::ZERO {
        return 0;
    }
    let scale = Decimal::from(10u64.saturating_pow(decimals));
    max_step_usd
        .checked_mul(scale)
        .and_then(|raw| raw.floor().to_u128())
        .unwrap_or(u128::MAX)
}

fn share_bps(part: u128, total: u128) -> u32 {
    if total == 0 {
        return 0;
    }
    (part.saturating_mul(u128::from(BPS_DENOMINATOR)) / total) as u32
}

pub fn plan(input: &PlanInput) -> YieldPlan {
    let balances = input.balances;
    let total = balances.total();
    let effective = biased_target_bps(
        input.target_bps,
        input.apr,
        input.min_apr_delta_bps,
        input.apr_bias_cap_bps,
    );
    let current = share_bps(balances.usdc_raw, total);

    let hold = |reason: &str, drift: u32| YieldPlan {
        action: PlanAction::Hold,
        reason: reason.to_string(),
        target_bps: input.target_bps,
        effective_target_bps: effective,
        current_bps: current,
        drift_bps: drift,
        recommended_amount_raw: 0,
        from_token: None,
        to_token: None,
    };

    if total == 0 {
        return hold("empty_portfolio", 0);
    }
    if current >= effective {
        return hold("usdc_at_or_above_target", current - effective);
    }

    let drift = effective - current;
    if drift < input.min_drift_bps {
        return hold("drift_below_threshold", drift);
    }

    let desired_usdc = total.saturating_mul(u128::from(effective)) / u128::from(BPS_DENOMINATOR);
    let needed = desired_usdc.saturating_sub(balances.usdc_raw);
    let amount = needed
        .min(balances.usdt_raw)
        .min(step_cap_raw(input.max_step_usd, input.token_decimals));

    if amount == 0 {
        return hold("no_available_balance", drift);
    }

    YieldPlan {
        action: PlanAction::Rebalance,
        reason: "usdc_below_target".to_string(),
        target_bps: input.target_bps,
        effective_target_bps: effective,
        current_bps: current,
        drift_bps: drift,
        recommended_amount_raw: amount,
        from_token: Some(TOKEN_USDT.to_string()),
        to_token: Some(TOKEN_USDC.to_string()),
    }
}
