//! JSON-RPC over HTTP
//!
//! Failures are classified here, once, into retryable causes and fatal errors.

use crate::error::TransientCause;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: String,
    pub method: String,
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JsonRpcErrorObject {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    /// NEAR-style structured cause (`{"name": "TIMEOUT_ERROR", ...}`)
    #[serde(default)]
    pub cause: Option<Value>,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
}

/// JSON-RPC codes that mean "try elsewhere"
const RETRYABLE_RPC_CODES: &[i64] = &[-32005, -32429, 429];

/// NEAR error cause names that mean "try elsewhere"
const RETRYABLE_CAUSE_NAMES: &[&str] = &["TIMEOUT_ERROR", "TOO_MANY_REQUESTS", "NO_SYNCED_BLOCKS"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    Http { status: u16, body: String },
    Timeout { elapsed_ms: u64 },
    Network { message: String },
    JsonRpc { code: i64, message: String, retryable: bool },
    Decode { message: String },
}

impl TransportFailure {
    /// Classify a JSON-RPC error object
    pub fn from_rpc_error(err: &JsonRpcErrorObject) -> Self {
        let cause_name = err
            .cause
            .as_ref()
            .and_then(|c| c.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let message = err.message.to_ascii_lowercase();
        let retryable = RETRYABLE_RPC_CODES.contains(&err.code)
            || RETRYABLE_CAUSE_NAMES.contains(&cause_name)
            || message.contains("rate limit")
            || message.contains("too many requests")
            || message.contains("timeout")
            || message.contains("timed out");

        let detail = if cause_name.is_empty() {
            err.message.clone()
        } else {
            format!("{} ({})", err.message, cause_name)
        };

        TransportFailure::JsonRpc {
            code: err.code,
            message: detail,
            retryable,
        }
    }

    /// `Some` when another endpoint (or a later round) may succeed
    pub fn transient_cause(&self) -> Option<TransientCause> {
        match self {
            TransportFailure::Http { status: 429, .. } => Some(TransientCause::RateLimited),
            TransportFailure::Http { status, .. } if (500..600).contains(status) => {
                Some(TransientCause::ServerError { status: *status })
            }
            TransportFailure::Http { .. } => None,
            TransportFailure::Timeout { elapsed_ms } => Some(TransientCause::Timeout {
                elapsed_ms: *elapsed_ms,
            }),
            TransportFailure::Network { message } => Some(TransientCause::Network {
                message: message.clone(),
            }),
            TransportFailure::JsonRpc {
                code,
                message,
                retryable: true,
            } => {
                if RETRYABLE_RPC_CODES.contains(code) {
                    Some(TransientCause::RateLimited)
                } else {
                    Some(TransientCause::Network {
                        message: message.clone(),
                    })
                }
            }
            TransportFailure::JsonRpc { .. } => None,
            TransportFailure::Decode { .. } => None,
        }
    }

    /// Whether the failure reflects on the endpoint rather than the request
    pub fn counts_against_endpoint(&self) -> bool {
        !matches!(
            self,
            TransportFailure::JsonRpc {
                retryable: false,
                ..
            }
        )
    }
}

impl std::fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportFailure::Http { status, body } => write!(f, "HTTP {}: {}", status, body),
            TransportFailure::Timeout { elapsed_ms } => write!(f, "timed out after {}ms", elapsed_ms),
            TransportFailure::Network { message } => write!(f, "network: {}", message),
            TransportFailure::JsonRpc { code, message, .. } => {
                write!(f, "JSON-RPC error {}: {}", code, message)
            }
            TransportFailure::Decode { message } => write!(f, "decode: {}", message),
        }
    }
}

/// Sends one JSON-RPC request to one endpoint
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn post(
        &self,
        endpoint: &str,
        request: &JsonRpcRequest,
    ) -> std::result::Result<Value, TransportFailure>;
}

/// reqwest-backed transport
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("rebalancer/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn post(
        &self,
        endpoint: &str,
        request: &JsonRpcRequest,
    ) -> std::result::Result<Value, TransportFailure> {
        let started = Instant::now();
        let response = self
            .client
            .post(endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportFailure::Timeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    }
                } else {
                    TransportFailure::Network {
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportFailure::Http {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let parsed: JsonRpcResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                TransportFailure::Timeout {
                    elapsed_ms: self.timeout.as_millis() as u64,
                }
            } else {
                TransportFailure::Decode {
                    message: e.to_string(),
                }
            }
        })?;

        if let Some(err) = parsed.error {
            return Err(TransportFailure::from_rpc_error(&err));
        }
        parsed.result.ok_or_else(|| TransportFailure::Decode {
            message: "response has neither result nor error".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_http_classification() {
        let rate_limited = TransportFailure::Http {
            status: 429,
            body: String::new(),
        };
        assert_eq!(rate_limited.transient_cause(), Some(TransientCause::RateLimited));

        let bad_gateway = TransportFailure::Http {
            status: 502,
            body: String::new(),
        };
        assert_eq!(
            bad_gateway.transient_cause(),
            Some(TransientCause::ServerError { status: 502 })
        );

        let not_found = TransportFailure::Http {
            status: 404,
            body: String::new(),
        };
        assert_eq!(not_found.transient_cause(), None);
    }

    #[test]
    fn test_rpc_error_classification() {
        let err: JsonRpcErrorObject = serde_json::from_value(json!({
            "code": -32000,
            "message": "Server error",
            "cause": {"name": "TIMEOUT_ERROR"}
        }))
        .unwrap();
        assert!(TransportFailure::from_rpc_error(&err).transient_cause().is_some());

        let err: JsonRpcErrorObject = serde_json::from_value(json!({
            "code": -32005,
            "message": "limit exceeded"
        }))
        .unwrap();
        assert_eq!(
            TransportFailure::from_rpc_error(&err).transient_cause(),
            Some(TransientCause::RateLimited)
        );

        let err: JsonRpcErrorObject = serde_json::from_value(json!({
            "code": -32000,
            "message": "Server error",
            "cause": {"name": "UNKNOWN_ACCOUNT"}
        }))
        .unwrap();
        let failure = TransportFailure::from_rpc_error(&err);
        assert_eq!(failure.transient_cause(), None);
        assert!(!failure.counts_against_endpoint());
    }
}
