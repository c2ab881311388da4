use crate::domain::Chain;
use crate::error::AdapterError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Result of a submitted transaction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxResult {
    pub tx_hash: Option<String>,
    /// Adapter-specific output, kept for audit
    #[serde(default)]
    pub raw_output: Option<serde_json::Value>,
}

impl TxResult {
    pub fn with_hash(tx_hash: impl Into<String>) -> Self {
        Self {
            tx_hash: Some(tx_hash.into()),
            raw_output: None,
        }
    }
}

/// Expected swap output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    #[serde(with = "crate::domain::amount")]
    pub amount_out_raw: u128,
    pub source: String,
    #[serde(default)]
    pub divergence_bps: Option<u32>,
}

/// Wallet/collateral operations on one chain
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain(&self) -> Chain;

    /// Move `amount_raw` of `token` from the collateral position to the wallet
    async fn withdraw(&self, token: &str, amount_raw: u128) -> AdapterResult<TxResult>;

    async fn swap(
        &self,
        token_in: &str,
        token_out: &str,
        amount_raw: u128,
        min_out_raw: u128,
    ) -> AdapterResult<TxResult>;

    /// Move `amount_raw` of `token` from the wallet into the collateral position
    async fn supply(&self, token: &str, amount_raw: u128) -> AdapterResult<TxResult>;

    /// Wallet balance of `token` in base units
    async fn balance(&self, token: &str) -> AdapterResult<u128>;
}

#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn quote(&self, token_in: &str, token_out: &str, amount_raw: u128)
        -> AdapterResult<Quote>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostActionRequest {
    #[serde(with = "crate::domain::amount")]
    pub amount_raw: u128,
    pub token: String,
    pub run_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostActionResult {
    pub ok: bool,
    pub tx_hash: Option<String>,
    pub retryable: bool,
    pub reason: Option<String>,
}

impl PostActionResult {
    pub fn success(tx_hash: Option<String>) -> Self {
        Self {
            ok: true,
            tx_hash,
            retryable: false,
            reason: None,
        }
    }

    pub fn failure(reason: impl Into<String>, retryable: bool) -> Self {
        Self {
            ok: false,
            tx_hash: None,
            retryable,
            reason: Some(reason.into()),
        }
    }
}

/// Per-protocol supply step run after a secondary-chain swap.
///
/// Failures are reported in the result, never as `Err`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PostActionExecutor: Send + Sync {
    async fn execute(&self, protocol_id: &str, request: &PostActionRequest) -> PostActionResult;
}
