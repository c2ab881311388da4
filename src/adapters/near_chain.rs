//! Primary-chain adapter over the routed RPC
//!
//! Balance reads, swap quotes and transaction broadcasts all go through the
//! shared `RpcRouter`. Signing is injected: the adapter builds function calls
//! and hands them to a `TxSigner`, which owns the operating account's keys.

use super::near_ft::{parse_u128, view_function, FtBalanceReader};
use super::traits::{AdapterResult, ChainAdapter, Quote, QuoteSource, TxResult};
use crate::config::EngineConfig;
use crate::domain::Chain;
use crate::error::{AdapterError, RebalanceError, Result};
use crate::rpc::RpcRouter;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, instrument};

/// 300 Tgas, the per-transaction maximum
const MAX_GAS: u64 = 300_000_000_000_000;
/// `ft_transfer_call` and lending `execute` require exactly one yoctoNEAR
const ONE_YOCTO: u128 = 1;

/// A single function-call action for the signer to wrap in a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub receiver_id: String,
    pub method_name: String,
    pub args: Value,
    #[serde(with = "crate::domain::amount")]
    pub deposit_yocto: u128,
    pub gas: u64,
}

impl FunctionCall {
    fn new(receiver_id: &str, method_name: &str, args: Value) -> Self {
        Self {
            receiver_id: receiver_id.to_string(),
            method_name: method_name.to_string(),
            args,
            deposit_yocto: ONE_YOCTO,
            gas: MAX_GAS,
        }
    }
}

/// Signs function calls as the operating account
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TxSigner: Send + Sync {
    /// Base64 of the borsh-serialized signed transaction
    async fn sign(&self, call: &FunctionCall) -> AdapterResult<String>;
}

pub struct NearChain {
    router: Arc<RpcRouter>,
    balances: FtBalanceReader,
    signer: Arc<dyn TxSigner>,
    lending_contract: String,
    dex_contract: String,
    pool_id: u64,
}

impl NearChain {
    pub fn from_config(
        config: &EngineConfig,
        router: Arc<RpcRouter>,
        signer: Arc<dyn TxSigner>,
    ) -> Result<Self> {
        let account_id = config.account_id.clone().ok_or_else(|| {
            RebalanceError::AdapterConfig("engine.account_id is required for on-chain runs".into())
        })?;
        let pool_id = config.pool_id.parse::<u64>().map_err(|_| {
            RebalanceError::Validation(format!("pool id is not numeric: {}", config.pool_id))
        })?;

        Ok(Self {
            balances: FtBalanceReader::new(router.clone(), account_id),
            router,
            signer,
            lending_contract: config.lending_contract.clone(),
            dex_contract: config.dex_contract.clone(),
            pool_id,
        })
    }

    pub fn account_id(&self) -> &str {
        self.balances.account_id()
    }

    /// Sign and broadcast, waiting for the final outcome. Rebroadcasting the
    /// same signed transaction yields the same hash, so router failover
    /// cannot double-submit.
    #[instrument(skip(self, call), fields(receiver = %call.receiver_id, method = %call.method_name))]
    async fn submit(&self, call: FunctionCall) -> AdapterResult<TxResult> {
        let signed = self.signer.sign(&call).await?;
        let response = self
            .router
            .call("broadcast_tx_commit", json!([signed]))
            .await
            .map_err(AdapterError::from)?;
        let tx = tx_outcome(&response.result)?;
        debug!(tx = ?tx.tx_hash, endpoint = %response.endpoint, "Transaction final");
        Ok(tx)
    }

    fn ft_transfer_call(&self, token: &str, receiver_id: &str, amount_raw: u128, msg: Value) -> FunctionCall {
        FunctionCall::new(
            token,
            "ft_transfer_call",
            json!({
                "receiver_id": receiver_id,
                "amount": amount_raw.to_string(),
                "msg": msg.to_string(),
            }),
        )
    }
}

/// Map a `broadcast_tx_commit` result to a tx result or an execution failure
fn tx_outcome(result: &Value) -> AdapterResult<TxResult> {
    let tx_hash = result
        .pointer("/transaction/hash")
        .and_then(Value::as_str)
        .map(str::to_string);
    let status = result.get("status").ok_or_else(|| AdapterError::Execution {
        reason: "broadcast result has no status".to_string(),
        retryable: false,
    })?;

    if let Some(failure) = status.get("Failure") {
        return Err(AdapterError::Execution {
            reason: format!(
                "transaction {} failed: {}",
                tx_hash.as_deref().unwrap_or("<unknown>"),
                failure
            ),
            retryable: false,
        });
    }

    Ok(TxResult {
        tx_hash,
        raw_output: Some(status.clone()),
    })
}

#[async_trait]
impl ChainAdapter for NearChain {
    fn chain(&self) -> Chain {
        Chain::Primary
    }

    async fn withdraw(&self, token: &str, amount_raw: u128) -> AdapterResult<TxResult> {
        let amount = amount_raw.to_string();
        let call = FunctionCall::new(
            &self.lending_contract,
            "execute",
            json!({
                "actions": [
                    { "DecreaseCollateral": { "token_id": token, "amount": amount } },
                    { "Withdraw": { "token_id": token, "max_amount": amount } },
                ]
            }),
        );
        self.submit(call).await
    }

    async fn swap(
        &self,
        token_in: &str,
        token_out: &str,
        amount_raw: u128,
        min_out_raw: u128,
    ) -> AdapterResult<TxResult> {
        let msg = json!({
            "force": 0,
            "actions": [{
                "pool_id": self.pool_id,
                "token_in": token_in,
                "token_out": token_out,
                "amount_in": amount_raw.to_string(),
                "min_amount_out": min_out_raw.to_string(),
            }]
        });
        let call = self.ft_transfer_call(token_in, &self.dex_contract, amount_raw, msg);
        self.submit(call).await
    }

    async fn supply(&self, token: &str, amount_raw: u128) -> AdapterResult<TxResult> {
        let msg = json!({
            "Execute": {
                "actions": [{
                    "IncreaseCollateral": { "token_id": token, "max_amount": amount_raw.to_string() }
                }]
            }
        });
        let call = self.ft_transfer_call(token, &self.lending_contract, amount_raw, msg);
        self.submit(call).await
    }

    async fn balance(&self, token: &str) -> AdapterResult<u128> {
        self.balances.balance_of(token).await.map_err(AdapterError::from)
    }
}

#[async_trait]
impl QuoteSource for NearChain {
    async fn quote(&self, token_in: &str, token_out: &str, amount_raw: u128) -> AdapterResult<Quote> {
        let args = json!({
            "pool_id": self.pool_id,
            "token_in": token_in,
            "amount_in": amount_raw.to_string(),
            "token_out": token_out,
        });
        let value = view_function(&self.router, &self.dex_contract, "get_return", &args)
            .await
            .map_err(AdapterError::from)?;
        Ok(Quote {
            amount_out_raw: parse_u128(&value).map_err(AdapterError::from)?,
            source: format!("{}#{}", self.dex_contract, self.pool_id),
            divergence_bps: None,
        })
    }
}

/// In-memory NEAR node behind a mocked transport, for driving runs end to end
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::adapters::near_ft::view_bytes;
    use crate::rpc::transport::MockRpcTransport;
    use crate::rpc::TransportFailure;
    use base64::Engine;
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub const LENDING: &str = "contract.main.burrow.near";
    pub const DEX: &str = "v2.ref-finance.near";

    #[derive(Debug, Default)]
    pub struct NodeState {
        pub wallet: HashMap<String, u128>,
        pub collateral: HashMap<String, u128>,
        /// Output per 10_000 units in, for swaps and quotes
        pub rate_bps: u128,
        /// Method names whose next broadcast fails on-chain
        pub fail_methods: Vec<String>,
        pub broadcasts: Vec<FunctionCall>,
    }

    fn b64() -> base64::engine::GeneralPurpose {
        base64::engine::general_purpose::STANDARD
    }

    fn amount(v: &Value) -> u128 {
        parse_u128(v).unwrap()
    }

    /// Signer that "signs" by base64-encoding the call as JSON
    pub fn json_signer() -> MockTxSigner {
        let mut signer = MockTxSigner::new();
        signer
            .expect_sign()
            .returning(|call| Ok(b64().encode(serde_json::to_vec(call).unwrap())));
        signer
    }

    pub fn node_transport(state: Arc<Mutex<NodeState>>) -> MockRpcTransport {
        let mut transport = MockRpcTransport::new();
        transport.expect_post().returning(move |_, req| {
            let mut node = state.lock().unwrap();
            match req.method.as_str() {
                "query" => {
                    let raw = b64().decode(req.params["args_base64"].as_str().unwrap()).unwrap();
                    let args: Value = serde_json::from_slice(&raw).unwrap();
                    let out = match req.params["method_name"].as_str().unwrap() {
                        "ft_balance_of" => {
                            let token = req.params["account_id"].as_str().unwrap();
                            node.wallet.get(token).copied().unwrap_or(0)
                        }
                        "get_return" => amount(&args["amount_in"]) * node.rate_bps / 10_000,
                        other => panic!("unexpected view {}", other),
                    };
                    Ok(view_bytes(&format!("\"{}\"", out)))
                }
                "broadcast_tx_commit" => {
                    let raw = b64().decode(req.params[0].as_str().unwrap()).unwrap();
                    let call: FunctionCall = serde_json::from_slice(&raw).unwrap();
                    node.broadcasts.push(call.clone());
                    let hash = format!("tx{}", node.broadcasts.len());

                    if let Some(i) = node.fail_methods.iter().position(|m| *m == call.method_name) {
                        node.fail_methods.remove(i);
                        return Ok(json!({
                            "status": { "Failure": { "ActionError": { "index": 0 } } },
                            "transaction": { "hash": hash },
                        }));
                    }
                    apply(&mut node, &call);
                    Ok(json!({
                        "status": { "SuccessValue": "" },
                        "transaction": { "hash": hash },
                    }))
                }
                other => Err(TransportFailure::Http {
                    status: 400,
                    body: format!("unknown method {}", other),
                }),
            }
        });
        transport
    }

    fn apply(node: &mut NodeState, call: &FunctionCall) {
        match (call.method_name.as_str(), call.args["receiver_id"].as_str()) {
            ("execute", _) => {
                let withdraw = &call.args["actions"][1]["Withdraw"];
                let token = withdraw["token_id"].as_str().unwrap().to_string();
                let amt = amount(&withdraw["max_amount"]);
                *node.collateral.entry(token.clone()).or_default() -= amt;
                *node.wallet.entry(token).or_default() += amt;
            }
            ("ft_transfer_call", Some(DEX)) => {
                let msg: Value = serde_json::from_str(call.args["msg"].as_str().unwrap()).unwrap();
                let action = &msg["actions"][0];
                let amt = amount(&action["amount_in"]);
                let out = amt * node.rate_bps / 10_000;
                *node.wallet.entry(call.receiver_id.clone()).or_default() -= amt;
                *node
                    .wallet
                    .entry(action["token_out"].as_str().unwrap().to_string())
                    .or_default() += out;
            }
            ("ft_transfer_call", Some(LENDING)) => {
                let amt = amount(&call.args["amount"]);
                *node.wallet.entry(call.receiver_id.clone()).or_default() -= amt;
                *node.collateral.entry(call.receiver_id.clone()).or_default() += amt;
            }
            other => panic!("unexpected call {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::config::RpcConfig;
    use crate::domain::RunStatus;
    use crate::engine::{EngineSettings, PrimaryRunner, RunLedger, RunRequest};
    use crate::risk::GuardPolicy;
    use crate::telemetry::RecordingSink;
    use std::sync::Mutex;
    use std::time::Duration;

    const USDT: &str = "usdt.tether-token.near";
    const USDC: &str = "usdc.near";

    fn node() -> Arc<Mutex<NodeState>> {
        let mut state = NodeState {
            rate_bps: 9_995,
            ..Default::default()
        };
        state.collateral.insert(USDT.to_string(), 5_000_000);
        Arc::new(Mutex::new(state))
    }

    fn near_chain(state: Arc<Mutex<NodeState>>) -> (Arc<NearChain>, Arc<RpcRouter>) {
        let rpc = RpcConfig {
            endpoints: vec!["https://rpc.one".into(), "https://rpc.two".into()],
            warmup_calls: 0,
            retry_rounds: 0,
            base_backoff_ms: 0,
            request_timeout_ms: 1000,
        };
        let router = Arc::new(RpcRouter::new(&rpc, Arc::new(node_transport(state))));
        let engine = EngineConfig {
            account_id: Some("bot.near".into()),
            ..EngineConfig::default()
        };
        let chain = NearChain::from_config(&engine, router.clone(), Arc::new(json_signer())).unwrap();
        (Arc::new(chain), router)
    }

    fn runner(chain: Arc<NearChain>) -> PrimaryRunner {
        PrimaryRunner::new(
            chain.clone(),
            chain,
            Arc::new(RunLedger::new(50)),
            GuardPolicy::default(),
            EngineSettings {
                token_in: USDT.into(),
                token_out: USDC.into(),
                pool_id: "4179".into(),
                default_slippage_bps: 50,
                dust_threshold_raw: 10,
                adapter_timeout: Duration::from_secs(5),
            },
            Arc::new(RecordingSink::new()),
        )
    }

    #[test]
    fn test_tx_outcome_failure_is_not_retryable() {
        let err = tx_outcome(&json!({
            "status": { "Failure": { "ActionError": {} } },
            "transaction": { "hash": "abc" },
        }))
        .unwrap_err();
        assert!(matches!(err, AdapterError::Execution { retryable: false, .. }));

        let ok = tx_outcome(&json!({
            "status": { "SuccessValue": "" },
            "transaction": { "hash": "abc" },
        }))
        .unwrap();
        assert_eq!(ok.tx_hash.as_deref(), Some("abc"));
    }

    #[test]
    fn test_requires_account_id() {
        let rpc = RpcConfig {
            endpoints: vec!["https://rpc.one".into()],
            ..RpcConfig::default()
        };
        let router = Arc::new(RpcRouter::new(&rpc, Arc::new(node_transport(node()))));
        let err = NearChain::from_config(&EngineConfig::default(), router, Arc::new(json_signer()))
            .err()
            .unwrap();
        assert!(matches!(err, RebalanceError::AdapterConfig(_)));
    }

    #[tokio::test]
    async fn test_run_goes_through_router() {
        let state = node();
        let (chain, router) = near_chain(state.clone());

        let record = runner(chain)
            .execute(&RunRequest::new("1000000").with_run_id("near-1"))
            .await
            .unwrap();

        assert_eq!(record.status, RunStatus::Success);
        assert!(record.reconciled);
        assert_eq!(record.supplied_raw, Some(999_500));
        assert_eq!(record.route.as_deref(), Some("v2.ref-finance.near#4179"));
        assert_eq!(record.txs.supply.as_deref(), Some("tx3"));

        let node = state.lock().unwrap();
        assert_eq!(node.collateral[USDC], 999_500);
        assert_eq!(node.collateral[USDT], 4_000_000);
        let methods: Vec<&str> = node.broadcasts.iter().map(|c| c.method_name.as_str()).collect();
        assert_eq!(methods, vec!["execute", "ft_transfer_call", "ft_transfer_call"]);

        // quote, 2 balance reads around the swap, 3 broadcasts, 2 reconcile reads
        let snapshot = router.snapshot();
        assert_eq!(snapshot.total_calls, 8);
        assert_eq!(snapshot.total_retries, 0);
    }

    #[tokio::test]
    async fn test_failed_swap_tx_rolls_back_on_chain() {
        let state = node();
        state.lock().unwrap().fail_methods.push("ft_transfer_call".into());
        let (chain, _router) = near_chain(state.clone());

        let record = runner(chain).execute(&RunRequest::new("1000000")).await.unwrap();

        assert_eq!(record.status, RunStatus::Rollback);
        assert!(!record.retryable);
        let node = state.lock().unwrap();
        assert_eq!(node.collateral[USDT], 5_000_000);
        assert_eq!(node.wallet.get(USDT).copied().unwrap_or(0), 0);
    }
}
