//! Health-scored RPC endpoint router with per-call failover

use super::stats::{select_order, EndpointStats};
use super::transport::{HttpTransport, JsonRpcRequest, RpcTransport, TransportFailure};
use crate::config::RpcConfig;
use crate::error::{RebalanceError, Result, TransientCause};
use crate::telemetry::{EventSink, RunEvent};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A successful routed call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutedResponse {
    pub result: Value,
    pub endpoint: String,
}

/// Point-in-time view of router health
#[derive(Debug, Clone, Serialize)]
pub struct RouterSnapshot {
    pub total_calls: u64,
    pub total_attempts: u64,
    pub total_retries: u64,
    pub retry_rate: f64,
    pub http429: u64,
    pub endpoints: Vec<(String, EndpointStats)>,
}

pub struct RpcRouter {
    endpoints: Vec<String>,
    transport: Arc<dyn RpcTransport>,
    stats: DashMap<String, EndpointStats>,
    total_calls: AtomicU64,
    total_attempts: AtomicU64,
    total_retries: AtomicU64,
    http429: AtomicU64,
    next_request_id: AtomicU64,
    warmup_calls: u64,
    retry_rounds: u32,
    base_backoff: Duration,
    sink: Option<Arc<dyn EventSink>>,
}

impl RpcRouter {
    pub fn new(config: &RpcConfig, transport: Arc<dyn RpcTransport>) -> Self {
        let stats = DashMap::new();
        for endpoint in &config.endpoints {
            stats.insert(endpoint.clone(), EndpointStats::default());
        }

        Self {
            endpoints: config.endpoints.clone(),
            transport,
            stats,
            total_calls: AtomicU64::new(0),
            total_attempts: AtomicU64::new(0),
            total_retries: AtomicU64::new(0),
            http429: AtomicU64::new(0),
            next_request_id: AtomicU64::new(1),
            warmup_calls: config.warmup_calls,
            retry_rounds: config.retry_rounds,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            sink: None,
        }
    }

    /// Router over the real HTTP transport
    pub fn from_config(config: &RpcConfig) -> Result<Self> {
        let transport = HttpTransport::new(Duration::from_millis(config.request_timeout_ms))?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Route one JSON-RPC call, failing over across endpoints.
    ///
    /// Retryable failures move on to the next endpoint; once every endpoint
    /// has failed in a round the router sleeps `base_backoff * round` and
    /// starts again, up to `retry_rounds` extra rounds. Any other failure is
    /// returned immediately.
    pub async fn call(&self, method: &str, params: Value) -> Result<RoutedResponse> {
        if self.endpoints.is_empty() {
            return Err(RebalanceError::AllEndpointsExhausted {
                rounds: 0,
                last_error: "no endpoints configured".to_string(),
            });
        }

        let call_index = self.total_calls.fetch_add(1, Ordering::Relaxed);
        let order = select_order(
            &self.endpoints,
            &self.stats_map(),
            call_index,
            self.warmup_calls,
        );
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(format!("rebalancer-{}", request_id), method, params);

        let mut attempts_this_call = 0u64;
        let mut last_error = String::new();

        for round in 0..=self.retry_rounds {
            if round > 0 {
                let delay = self.base_backoff * round;
                debug!(method, round, delay_ms = delay.as_millis() as u64, "RPC retry round");
                tokio::time::sleep(delay).await;
            }

            for endpoint in &order {
                self.total_attempts.fetch_add(1, Ordering::Relaxed);
                if attempts_this_call > 0 {
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                }
                attempts_this_call += 1;
                self.bump(endpoint, |s| s.attempts += 1);

                match self.transport.post(endpoint, &request).await {
                    Ok(result) => {
                        self.bump(endpoint, |s| s.success += 1);
                        return Ok(RoutedResponse {
                            result,
                            endpoint: endpoint.clone(),
                        });
                    }
                    Err(failure) => match failure.transient_cause() {
                        Some(cause) => {
                            self.record_transient(endpoint, &cause);
                            warn!(endpoint = %endpoint, method, %failure, "RPC endpoint failed, trying next");
                            last_error = format!("{}: {}", endpoint, failure);
                        }
                        None => {
                            if failure.counts_against_endpoint() {
                                self.bump(endpoint, |s| s.errors += 1);
                            }
                            return Err(fatal_error(endpoint, &failure));
                        }
                    },
                }
            }
        }

        Err(RebalanceError::AllEndpointsExhausted {
            rounds: self.retry_rounds + 1,
            last_error,
        })
    }

    pub fn snapshot(&self) -> RouterSnapshot {
        let total_attempts = self.total_attempts.load(Ordering::Relaxed);
        let total_retries = self.total_retries.load(Ordering::Relaxed);
        let retry_rate = if total_attempts == 0 {
            0.0
        } else {
            total_retries as f64 / total_attempts as f64
        };
        let endpoints = self
            .endpoints
            .iter()
            .map(|e| (e.clone(), self.stats.get(e).map(|s| *s).unwrap_or_default()))
            .collect();

        RouterSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_attempts,
            total_retries,
            retry_rate,
            http429: self.http429.load(Ordering::Relaxed),
            endpoints,
        }
    }

    fn stats_map(&self) -> HashMap<String, EndpointStats> {
        self.stats
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    fn bump(&self, endpoint: &str, f: impl FnOnce(&mut EndpointStats)) {
        let mut entry = self.stats.entry(endpoint.to_string()).or_default();
        f(entry.value_mut());
    }

    fn record_transient(&self, endpoint: &str, cause: &TransientCause) {
        self.bump(endpoint, |s| {
            s.errors += 1;
            match cause {
                TransientCause::RateLimited => s.http429 += 1,
                TransientCause::ServerError { .. } => s.http5xx += 1,
                _ => {}
            }
        });
        if matches!(cause, TransientCause::RateLimited) {
            self.http429.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(sink) = &self.sink {
            sink.record(&RunEvent::EndpointFailure {
                endpoint: endpoint.to_string(),
                cause: cause.to_string(),
            });
        }
    }
}

fn fatal_error(endpoint: &str, failure: &TransportFailure) -> RebalanceError {
    RebalanceError::Rpc {
        endpoint: endpoint.to_string(),
        message: failure.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::transport::MockRpcTransport;
    use crate::telemetry::RecordingSink;
    use serde_json::json;

    fn config(endpoints: &[&str], warmup: u64, retry_rounds: u32) -> RpcConfig {
        RpcConfig {
            endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
            warmup_calls: warmup,
            retry_rounds,
            base_backoff_ms: 0,
            request_timeout_ms: 1000,
        }
    }

    #[tokio::test]
    async fn test_fails_over_on_rate_limit() {
        let mut transport = MockRpcTransport::new();
        transport.expect_post().returning(|endpoint, _| {
            if endpoint == "https://a" {
                Err(TransportFailure::Http {
                    status: 429,
                    body: String::new(),
                })
            } else {
                Ok(json!({"ok": true}))
            }
        });

        let sink = Arc::new(RecordingSink::new());
        let router = RpcRouter::new(&config(&["https://a", "https://b"], 0, 1), Arc::new(transport))
            .with_sink(sink.clone());

        let response = router.call("query", json!({})).await.unwrap();
        assert_eq!(response.endpoint, "https://b");

        let snapshot = router.snapshot();
        assert_eq!(snapshot.total_calls, 1);
        assert_eq!(snapshot.total_attempts, 2);
        assert_eq!(snapshot.total_retries, 1);
        assert_eq!(snapshot.http429, 1);
        assert_eq!(sink.count("endpoint_failure"), 1);

        let (_, a_stats) = &snapshot.endpoints[0];
        assert_eq!(a_stats.http429, 1);
        assert_eq!(a_stats.errors, 1);
    }

    #[tokio::test]
    async fn test_exhausts_all_rounds() {
        let mut transport = MockRpcTransport::new();
        transport
            .expect_post()
            .times(4)
            .returning(|_, _| Err(TransportFailure::Http {
                status: 503,
                body: "unavailable".into(),
            }));

        let router = RpcRouter::new(&config(&["https://a", "https://b"], 0, 1), Arc::new(transport));

        let err = router.call("query", json!({})).await.unwrap_err();
        assert!(matches!(err, RebalanceError::AllEndpointsExhausted { rounds: 2, .. }));
        for (_, stats) in router.snapshot().endpoints {
            assert_eq!(stats.attempts, 2);
            assert_eq!(stats.http5xx, 2);
            assert!(stats.attempts >= stats.success + stats.errors);
        }
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let mut transport = MockRpcTransport::new();
        transport.expect_post().times(1).returning(|_, _| {
            Err(TransportFailure::Http {
                status: 400,
                body: "bad request".into(),
            })
        });

        let router = RpcRouter::new(&config(&["https://a", "https://b"], 0, 2), Arc::new(transport));

        let err = router.call("query", json!({})).await.unwrap_err();
        assert!(matches!(err, RebalanceError::Rpc { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_healthy_endpoint_preferred_after_warmup() {
        let mut transport = MockRpcTransport::new();
        transport.expect_post().returning(|endpoint, _| {
            if endpoint == "https://flaky" {
                Err(TransportFailure::Timeout { elapsed_ms: 10 })
            } else {
                Ok(json!(1))
            }
        });

        let router = RpcRouter::new(
            &config(&["https://flaky", "https://good"], 4, 0),
            Arc::new(transport),
        );

        for _ in 0..4 {
            router.call("status", json!([])).await.unwrap();
        }
        let before = router.snapshot().total_attempts;
        let response = router.call("status", json!([])).await.unwrap();
        assert_eq!(response.endpoint, "https://good");
        assert_eq!(router.snapshot().total_attempts, before + 1);
    }

    #[tokio::test]
    async fn test_no_endpoints() {
        let transport = MockRpcTransport::new();
        let router = RpcRouter::new(&config(&[], 0, 0), Arc::new(transport));
        assert!(router.call("status", json!([])).await.is_err());
    }
}
