//! NEP-141 balance reads over the routed RPC

use crate::error::{RebalanceError, Result};
use crate::rpc::RpcRouter;
use base64::Engine;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// `call_function` view against `contract` at final finality, returning the
/// JSON value the contract produced
pub async fn view_function(
    router: &RpcRouter,
    contract: &str,
    method: &str,
    args: &Value,
) -> Result<Value> {
    let params = json!({
        "request_type": "call_function",
        "finality": "final",
        "account_id": contract,
        "method_name": method,
        "args_base64": base64::engine::general_purpose::STANDARD.encode(args.to_string()),
    });

    let response = router.call("query", params).await?;
    debug!(contract, method, endpoint = %response.endpoint, "View call");
    decode_view_result(&response.result)
}

pub struct FtBalanceReader {
    router: Arc<RpcRouter>,
    account_id: String,
}

impl FtBalanceReader {
    pub fn new(router: Arc<RpcRouter>, account_id: impl Into<String>) -> Self {
        Self {
            router,
            account_id: account_id.into(),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// `ft_balance_of` for the operating account on `token_contract`
    pub async fn balance_of(&self, token_contract: &str) -> Result<u128> {
        let args = json!({ "account_id": self.account_id });
        let value = view_function(&self.router, token_contract, "ft_balance_of", &args).await?;
        let balance = parse_u128(&value)?;
        debug!(token = token_contract, account = %self.account_id, balance, "ft_balance_of");
        Ok(balance)
    }
}

/// View results come back as a byte array holding JSON, e.g. `"1000"`
fn decode_view_result(result: &Value) -> Result<Value> {
    let bytes: Vec<u8> = result
        .get("result")
        .and_then(Value::as_array)
        .ok_or_else(|| RebalanceError::Validation("view result missing byte array".into()))?
        .iter()
        .map(|b| {
            b.as_u64()
                .and_then(|b| u8::try_from(b).ok())
                .ok_or_else(|| RebalanceError::Validation(format!("invalid byte in view result: {}", b)))
        })
        .collect::<Result<_>>()?;

    Ok(serde_json::from_slice(&bytes)?)
}

/// NEAR `U128` values are JSON strings
pub(crate) fn parse_u128(value: &Value) -> Result<u128> {
    value
        .as_str()
        .and_then(|s| s.parse::<u128>().ok())
        .ok_or_else(|| RebalanceError::Validation(format!("not a U128 string: {}", value)))
}

#[cfg(test)]
pub(crate) fn view_bytes(s: &str) -> Value {
    let bytes: Vec<Value> = s.bytes().map(|b| json!(b)).collect();
    json!({ "result": bytes, "logs": [], "block_height": 1 })
}
