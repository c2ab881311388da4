//! Cross-protocol APR comparison with health and risk tagging

use super::apr::{AprHint, HintSource, SourceHealth};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// APR above which a hint is treated as an outlier (20%)
pub const APR_OUTLIER_BPS: u32 = 2000;

const MAX_RISK_SCORE: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthTag {
    Fresh,
    Stale,
    Unknown,
}

impl HealthTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthTag::Fresh => "fresh",
            HealthTag::Stale => "stale",
            HealthTag::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTag {
    Unknown,
    StaleData,
    FallbackSource,
    AprOutlier,
    RecentSourceError,
}

impl RiskTag {
    pub fn weight(&self) -> u8 {
        match self {
            RiskTag::Unknown => 40,
            RiskTag::StaleData => 25,
            RiskTag::FallbackSource => 20,
            RiskTag::AprOutlier => 25,
            RiskTag::RecentSourceError => 15,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTag::Unknown => "unknown",
            RiskTag::StaleData => "stale_data",
            RiskTag::FallbackSource => "fallback_source",
            RiskTag::AprOutlier => "apr_outlier",
            RiskTag::RecentSourceError => "recent_source_error",
        }
    }
}

/// Inputs for one protocol row
#[derive(Debug, Clone)]
pub struct ProtocolObservation {
    pub protocol_id: String,
    pub hint: Option<AprHint>,
    pub health: SourceHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProtocolApr {
    pub protocol_id: String,
    pub usdt_apr_bps: Option<u32>,
    pub usdc_apr_bps: Option<u32>,
    pub source: Option<HintSource>,
    pub updated_at: Option<DateTime<Utc>>,
    pub health: HealthTag,
    pub risk_tags: Vec<RiskTag>,
    pub risk_score: u8,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AprComparison {
    pub protocols: Vec<ProtocolApr>,
    pub best_usdt: Option<String>,
    pub best_usdc: Option<String>,
    pub generated_at: DateTime<Utc>,
}

impl AprComparison {
    pub fn protocol(&self, protocol_id: &str) -> Option<&ProtocolApr> {
        self.protocols.iter().find(|p| p.protocol_id == protocol_id)
    }
}

pub fn health_tag(hint: Option<&AprHint>, now: DateTime<Utc>, stale_after: chrono::Duration) -> HealthTag {
    match hint.and_then(|h| h.updated_at) {
        Some(updated_at) if now - updated_at <= stale_after => HealthTag::Fresh,
        Some(_) => HealthTag::Stale,
        None => HealthTag::Unknown,
    }
}

pub fn risk_tags(hint: Option<&AprHint>, health: HealthTag, source_health: &SourceHealth) -> Vec<RiskTag> {
    let mut tags = Vec::new();
    match health {
        HealthTag::Unknown => tags.push(RiskTag::Unknown),
        HealthTag::Stale => tags.push(RiskTag::StaleData),
        HealthTag::Fresh => {}
    }
    if let Some(hint) = hint {
        if hint.source == HintSource::Fallback {
            tags.push(RiskTag::FallbackSource);
        }
        if hint.usdt_apr_bps > APR_OUTLIER_BPS || hint.usdc_apr_bps > APR_OUTLIER_BPS {
            tags.push(RiskTag::AprOutlier);
        }
    }
    if source_health.has_recent_error() {
        tags.push(RiskTag::RecentSourceError);
    }
    tags
}

pub fn risk_score(tags: &[RiskTag]) -> u8 {
    let total: u32 = tags.iter().map(|t| u32::from(t.weight())).sum();
    total.min(u32::from(MAX_RISK_SCORE)) as u8
}

/// Highest rate wins; ties go to the lower risk score, then list order
fn best_by<F>(rows: &[ProtocolApr], rate: F) -> Option<String>
where
    F: Fn(&ProtocolApr) -> Option<u32>,
{
    let mut best: Option<(&ProtocolApr, u32)> = None;
    for row in rows {
        let Some(bps) = rate(row) else { continue };
        let better = match best {
            None => true,
            Some((current, current_bps)) => {
                bps > current_bps || (bps == current_bps && row.risk_score < current.risk_score)
            }
        };
        if better {
            best = Some((row, bps));
        }
    }
    best.map(|(row, _)| row.protocol_id.clone())
}

pub fn compare(
    observations: &[ProtocolObservation],
    now: DateTime<Utc>,
    stale_after: chrono::Duration,
) -> AprComparison {
    let protocols: Vec<ProtocolApr> = observations
        .iter()
        .map(|obs| {
            let hint = obs.hint.as_ref();
            let health = health_tag(hint, now, stale_after);
            let tags = risk_tags(hint, health, &obs.health);
            ProtocolApr {
                protocol_id: obs.protocol_id.clone(),
                usdt_apr_bps: hint.map(|h| h.usdt_apr_bps),
                usdc_apr_bps: hint.map(|h| h.usdc_apr_bps),
                source: hint.map(|h| h.source),
                updated_at: hint.and_then(|h| h.updated_at),
                health,
                risk_score: risk_score(&tags),
                risk_tags: tags,
                last_error: obs.health.last_error.clone(),
            }
        })
        .collect();

    AprComparison {
        best_usdt: best_by(&protocols, |p| p.usdt_apr_bps),
        best_usdc: best_by(&protocols, |p| p.usdc_apr_bps),
        protocols,
        generated_at: now,
    }
}
