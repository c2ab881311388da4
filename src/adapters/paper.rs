//! In-memory paper chain
//!
//! Simulates one wallet and one collateral position per token with a fixed
//! swap rate. Failures can be scripted per operation, which is how the
//! rollback and retry paths are exercised without a network.

use super::traits::{
    AdapterResult, ChainAdapter, PostActionExecutor, PostActionRequest, PostActionResult, Quote,
    QuoteSource, TxResult,
};
use crate::domain::Chain;
use crate::error::AdapterError;
use async_trait::async_trait;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// Operation a scripted failure applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    Withdraw,
    Swap,
    Supply,
    Balance,
    Quote,
    PostAction,
}

#[derive(Debug, Default)]
struct PaperState {
    wallet: HashMap<String, u128>,
    collateral: HashMap<String, u128>,
    /// Scripted failures per op: calls to let through first, then the error
    failures: HashMap<PaperOp, VecDeque<(usize, AdapterError)>>,
    calls: Vec<String>,
    tx_counter: u64,
}

impl PaperState {
    fn next_tx(&mut self, op: &str) -> String {
        self.tx_counter += 1;
        format!("paper-{}-{}", op, self.tx_counter)
    }

    fn take_failure(&mut self, op: PaperOp) -> Option<AdapterError> {
        let queue = self.failures.get_mut(&op)?;
        match queue.front_mut() {
            Some((skip, _)) if *skip > 0 => {
                *skip -= 1;
                None
            }
            Some(_) => queue.pop_front().map(|(_, err)| err),
            None => None,
        }
    }
}

pub struct PaperChain {
    chain: Chain,
    /// Output per unit of input on swap
    swap_rate: Decimal,
    /// Output per unit of input on quote; defaults to `swap_rate`
    quote_rate: Decimal,
    quote_source: String,
    state: Mutex<PaperState>,
}

impl PaperChain {
    pub fn new(chain: Chain) -> Self {
        Self {
            chain,
            swap_rate: dec!(1),
            quote_rate: dec!(1),
            quote_source: "paper".to_string(),
            state: Mutex::new(PaperState::default()),
        }
    }

    pub fn with_wallet(self, token: &str, amount_raw: u128) -> Self {
        self.lock().wallet.insert(token.to_string(), amount_raw);
        self
    }

    pub fn with_collateral(self, token: &str, amount_raw: u128) -> Self {
        self.lock().collateral.insert(token.to_string(), amount_raw);
        self
    }

    /// Set both the executed and the quoted rate
    pub fn with_rate(mut self, rate: Decimal) -> Self {
        self.swap_rate = rate;
        self.quote_rate = rate;
        self
    }

    /// Quote at a different rate than swaps execute at
    pub fn with_quote_rate(mut self, rate: Decimal) -> Self {
        self.quote_rate = rate;
        self
    }

    pub fn with_quote_source(mut self, source: impl Into<String>) -> Self {
        self.quote_source = source.into();
        self
    }

    /// Queue a failure for the next call of `op`
    pub fn fail_next(&self, op: PaperOp, error: AdapterError) {
        self.fail_after(op, 0, error);
    }

    /// Let `skip` calls of `op` through, then fail one
    pub fn fail_after(&self, op: PaperOp, skip: usize, error: AdapterError) {
        self.lock()
            .failures
            .entry(op)
            .or_default()
            .push_back((skip, error));
    }

    pub fn wallet_balance(&self, token: &str) -> u128 {
        self.lock().wallet.get(token).copied().unwrap_or(0)
    }

    pub fn collateral_balance(&self, token: &str) -> u128 {
        self.lock().collateral.get(token).copied().unwrap_or(0)
    }

    /// Log of mutating calls, in order
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn apply_rate(amount_raw: u128, rate: Decimal) -> AdapterResult<u128> {
    Decimal::from_u128(amount_raw)
        .and_then(|amount| amount.checked_mul(rate))
        .and_then(|out| out.floor().to_u128())
        .ok_or_else(|| AdapterError::Execution {
            reason: format!("amount {} out of range at rate {}", amount_raw, rate),
            retryable: false,
        })
}

fn debit(
    book: &mut HashMap<String, u128>,
    token: &str,
    amount_raw: u128,
    what: &str,
) -> AdapterResult<()> {
    let balance = book.entry(token.to_string()).or_insert(0);
    if *balance < amount_raw {
        return Err(AdapterError::Execution {
            reason: format!(
                "insufficient {} {}: have {}, need {}",
                what, token, balance, amount_raw
            ),
            retryable: false,
        });
    }
    *balance -= amount_raw;
    Ok(())
}

fn credit(book: &mut HashMap<String, u128>, token: &str, amount_raw: u128) {
    *book.entry(token.to_string()).or_insert(0) += amount_raw;
}

#[async_trait]
impl ChainAdapter for PaperChain {
    fn chain(&self) -> Chain {
        self.chain
    }

    async fn withdraw(&self, token: &str, amount_raw: u128) -> AdapterResult<TxResult> {
        let mut state = self.lock();
        state.calls.push(format!("withdraw {} {}", token, amount_raw));
        if let Some(err) = state.take_failure(PaperOp::Withdraw) {
            return Err(err);
        }
        debit(&mut state.collateral, token, amount_raw, "collateral")?;
        credit(&mut state.wallet, token, amount_raw);
        Ok(TxResult::with_hash(state.next_tx("withdraw")))
    }

    async fn swap(
        &self,
        token_in: &str,
        token_out: &str,
        amount_raw: u128,
        min_out_raw: u128,
    ) -> AdapterResult<TxResult> {
        let mut state = self.lock();
        state
            .calls
            .push(format!("swap {} {} -> {}", amount_raw, token_in, token_out));
        if let Some(err) = state.take_failure(PaperOp::Swap) {
            return Err(err);
        }
        let out = apply_rate(amount_raw, self.swap_rate)?;
        if out < min_out_raw {
            return Err(AdapterError::Execution {
                reason: format!("slippage: output {} below min out {}", out, min_out_raw),
                retryable: true,
            });
        }
        debit(&mut state.wallet, token_in, amount_raw, "wallet")?;
        credit(&mut state.wallet, token_out, out);
        Ok(TxResult::with_hash(state.next_tx("swap")))
    }

    async fn supply(&self, token: &str, amount_raw: u128) -> AdapterResult<TxResult> {
        let mut state = self.lock();
        state.calls.push(format!("supply {} {}", token, amount_raw));
        if let Some(err) = state.take_failure(PaperOp::Supply) {
            return Err(err);
        }
        debit(&mut state.wallet, token, amount_raw, "wallet")?;
        credit(&mut state.collateral, token, amount_raw);
        Ok(TxResult::with_hash(state.next_tx("supply")))
    }

    async fn balance(&self, token: &str) -> AdapterResult<u128> {
        let mut state = self.lock();
        if let Some(err) = state.take_failure(PaperOp::Balance) {
            return Err(err);
        }
        Ok(state.wallet.get(token).copied().unwrap_or(0))
    }
}

#[async_trait]
impl QuoteSource for PaperChain {
    async fn quote(
        &self,
        _token_in: &str,
        _token_out: &str,
        amount_raw: u128,
    ) -> AdapterResult<Quote> {
        if let Some(err) = self.lock().take_failure(PaperOp::Quote) {
            return Err(err);
        }
        Ok(Quote {
            amount_out_raw: apply_rate(amount_raw, self.quote_rate)?,
            source: self.quote_source.clone(),
            divergence_bps: None,
        })
    }
}

#[async_trait]
impl PostActionExecutor for PaperChain {
    async fn execute(&self, protocol_id: &str, request: &PostActionRequest) -> PostActionResult {
        let mut state = self.lock();
        state.calls.push(format!(
            "post_action {} {} {}",
            protocol_id, request.token, request.amount_raw
        ));
        if let Some(err) = state.take_failure(PaperOp::PostAction) {
            let retryable = crate::error::RebalanceError::from(err.clone()).is_retryable();
            return PostActionResult::failure(err.to_string(), retryable);
        }
        if let Err(err) = debit(&mut state.wallet, &request.token, request.amount_raw, "wallet") {
            return PostActionResult::failure(err.to_string(), false);
        }
        credit(&mut state.collateral, &request.token, request.amount_raw);
        PostActionResult::success(Some(state.next_tx(protocol_id)))
    }
}
