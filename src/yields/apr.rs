//! Per-protocol APR cache with TTL, static fallbacks and source health

use crate::config::ProtocolConfig;
use crate::error::{RebalanceError, Result, TransientCause};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Rates as reported by an APR source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AprQuote {
    pub usdt_apr_bps: u32,
    pub usdc_apr_bps: u32,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintSource {
    Live,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AprHint {
    pub usdt_apr_bps: u32,
    pub usdc_apr_bps: u32,
    pub source: HintSource,
    /// Age of the underlying data; unknown for static fallbacks
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceHealth {
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SourceHealth {
    /// The latest fetch failed
    pub fn has_recent_error(&self) -> bool {
        match (self.last_error_at, self.last_success_at) {
            (Some(err), Some(ok)) => err > ok,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AprSource: Send + Sync {
    async fn fetch(&self, protocol_id: &str) -> Result<AprQuote>;
}

/// GETs a JSON `{usdtAprBps, usdcAprBps, updatedAt}` document per protocol
pub struct HttpAprSource {
    client: reqwest::Client,
    urls: HashMap<String, String>,
}

impl HttpAprSource {
    pub fn new(urls: HashMap<String, String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, urls })
    }

    pub fn from_protocols(protocols: &[ProtocolConfig], timeout: Duration) -> Result<Self> {
        let urls = protocols
            .iter()
            .filter_map(|p| p.apr_url.as_ref().map(|url| (p.id.clone(), url.clone())))
            .collect();
        Self::new(urls, timeout)
    }
}

#[async_trait]
impl AprSource for HttpAprSource {
    async fn fetch(&self, protocol_id: &str) -> Result<AprQuote> {
        let url = self.urls.get(protocol_id).ok_or_else(|| {
            RebalanceError::AdapterConfig(format!("no APR url for protocol {}", protocol_id))
        })?;

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                RebalanceError::AdapterTransient(TransientCause::Timeout { elapsed_ms: 0 })
            } else {
                RebalanceError::AdapterTransient(TransientCause::Network {
                    message: e.to_string(),
                })
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(RebalanceError::AdapterTransient(TransientCause::RateLimited));
        }
        if status.is_server_error() {
            return Err(RebalanceError::AdapterTransient(TransientCause::ServerError {
                status: status.as_u16(),
            }));
        }
        if !status.is_success() {
            return Err(RebalanceError::AdapterExecution {
                reason: format!("APR source for {} returned HTTP {}", protocol_id, status),
                retryable: false,
            });
        }

        Ok(response.json::<AprQuote>().await?)
    }
}

/// Serves fixed rates; for paper mode and tests
#[derive(Debug, Clone, Default)]
pub struct StaticAprSource {
    quotes: HashMap<String, AprQuote>,
}

impl StaticAprSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, protocol_id: &str, usdt_apr_bps: u32, usdc_apr_bps: u32) -> Self {
        self.quotes.insert(
            protocol_id.to_string(),
            AprQuote {
                usdt_apr_bps,
                usdc_apr_bps,
                updated_at: None,
            },
        );
        self
    }
}

#[async_trait]
impl AprSource for StaticAprSource {
    async fn fetch(&self, protocol_id: &str) -> Result<AprQuote> {
        let mut quote = self.quotes.get(protocol_id).copied().ok_or_else(|| {
            RebalanceError::AdapterConfig(format!("no static APR for {}", protocol_id))
        })?;
        quote.updated_at = Some(quote.updated_at.unwrap_or_else(Utc::now));
        Ok(quote)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    /// `None` caches a failed refresh with nothing to fall back on
    hint: Option<AprHint>,
    fetched_at: DateTime<Utc>,
}

pub struct AprCache {
    source: Arc<dyn AprSource>,
    ttl: chrono::Duration,
    fallbacks: HashMap<String, (u32, u32)>,
    entries: RwLock<HashMap<String, CacheEntry>>,
    health: RwLock<HashMap<String, SourceHealth>>,
}

impl AprCache {
    pub fn new(source: Arc<dyn AprSource>, ttl: chrono::Duration) -> Self {
        Self {
            source,
            ttl,
            fallbacks: HashMap::new(),
            entries: RwLock::new(HashMap::new()),
            health: RwLock::new(HashMap::new()),
        }
    }

    /// Static hint served when the source fails and nothing live is cached
    pub fn with_fallback(mut self, protocol_id: &str, usdt_apr_bps: u32, usdc_apr_bps: u32) -> Self {
        self.fallbacks
            .insert(protocol_id.to_string(), (usdt_apr_bps, usdc_apr_bps));
        self
    }

    /// Cached hint, refreshed from the source once the TTL has lapsed.
    /// A miss is cached for one TTL too.
    pub async fn get(&self, protocol_id: &str) -> Option<AprHint> {
        let now = Utc::now();
        let previous = self.entries.read().await.get(protocol_id).cloned();
        if let Some(entry) = &previous {
            if now - entry.fetched_at < self.ttl {
                return entry.hint.clone();
            }
        }

        let hint = match self.source.fetch(protocol_id).await {
            Ok(quote) => {
                debug!(protocol = protocol_id, usdt = quote.usdt_apr_bps, usdc = quote.usdc_apr_bps, "APR refreshed");
                self.health
                    .write()
                    .await
                    .entry(protocol_id.to_string())
                    .or_default()
                    .last_success_at = Some(now);
                Some(AprHint {
                    usdt_apr_bps: quote.usdt_apr_bps,
                    usdc_apr_bps: quote.usdc_apr_bps,
                    source: HintSource::Live,
                    updated_at: Some(quote.updated_at.unwrap_or(now)),
                })
            }
            Err(e) => {
                warn!(protocol = protocol_id, error = %e, "APR fetch failed");
                {
                    let mut health = self.health.write().await;
                    let entry = health.entry(protocol_id.to_string()).or_default();
                    entry.last_error_at = Some(now);
                    entry.last_error = Some(e.to_string());
                }
                let stale = previous
                    .and_then(|p| p.hint)
                    .filter(|hint| hint.source == HintSource::Live);
                stale.or_else(|| {
                    self.fallbacks
                        .get(protocol_id)
                        .map(|&(usdt, usdc)| AprHint {
                            usdt_apr_bps: usdt,
                            usdc_apr_bps: usdc,
                            source: HintSource::Fallback,
                            updated_at: None,
                        })
                })
            }
        };

        self.entries.write().await.insert(
            protocol_id.to_string(),
            CacheEntry {
                hint: hint.clone(),
                fetched_at: now,
            },
        );
        hint
    }

    pub async fn health(&self, protocol_id: &str) -> SourceHealth {
        self.health
            .read()
            .await
            .get(protocol_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(usdt: u32, usdc: u32) -> AprQuote {
        AprQuote {
            usdt_apr_bps: usdt,
            usdc_apr_bps: usdc,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_cache_hit_within_ttl() {
        let mut source = MockAprSource::new();
        source
            .expect_fetch()
            .times(1)
            .returning(|_| Ok(quote(300, 450)));

        let cache = AprCache::new(Arc::new(source), chrono::Duration::minutes(5));
        let first = cache.get("burrow").await.unwrap();
        let second = cache.get("burrow").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.source, HintSource::Live);
        assert!(cache.health("burrow").await.last_success_at.is_some());
    }

    #[tokio::test]
    async fn test_falls_back_to_static_hint() {
        let mut source = MockAprSource::new();
        source
            .expect_fetch()
            .returning(|_| Err(RebalanceError::AdapterTransient(TransientCause::RateLimited)));

        let cache = AprCache::new(Arc::new(source), chrono::Duration::minutes(5))
            .with_fallback("burrow", 300, 350);

        let hint = cache.get("burrow").await.unwrap();
        assert_eq!(hint.source, HintSource::Fallback);
        assert_eq!(hint.usdc_apr_bps, 350);
        assert!(hint.updated_at.is_none());
        assert!(cache.health("burrow").await.has_recent_error());

        assert!(cache.get("unknown").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_live_hint_served_when_refresh_fails() {
        let mut source = MockAprSource::new();
        let mut seq = mockall::Sequence::new();
        source
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(quote(300, 450)));
        source
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(RebalanceError::AdapterTransient(TransientCause::Timeout { elapsed_ms: 10 })));

        let cache = AprCache::new(Arc::new(source), chrono::Duration::zero())
            .with_fallback("burrow", 1, 1);

        cache.get("burrow").await.unwrap();
        let hint = cache.get("burrow").await.unwrap();
        assert_eq!(hint.source, HintSource::Live);
        assert_eq!(hint.usdc_apr_bps, 450);
    }

    #[tokio::test]
    async fn test_miss_without_fallback_is_cached() {
        let mut source = MockAprSource::new();
        source
            .expect_fetch()
            .times(1)
            .returning(|_| Err(RebalanceError::AdapterTransient(TransientCause::RateLimited)));

        let cache = AprCache::new(Arc::new(source), chrono::Duration::minutes(5));
        assert!(cache.get("venus").await.is_none());
        assert!(cache.get("venus").await.is_none());
        assert!(cache.health("venus").await.has_recent_error());
    }

    #[test]
    fn test_recent_error() {
        let now = Utc::now();
        let mut health = SourceHealth::default();
        assert!(!health.has_recent_error());
        health.last_error_at = Some(now);
        assert!(health.has_recent_error());
        health.last_success_at = Some(now + chrono::Duration::seconds(1));
        assert!(!health.has_recent_error());
    }
}
