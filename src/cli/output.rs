//! Output formatting: human-readable tables (default) or JSON (--json).

use crate::rpc::RouterSnapshot;
use crate::yields::{AprComparison, ProtocolApr};
use serde::Serialize;
use tabled::{Table, Tabled};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Table,
    Json,
}

impl OutputMode {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputMode::Json
        } else {
            OutputMode::Table
        }
    }
}

/// Print a vec of Tabled + Serialize items in the chosen mode.
pub fn print_items<T: Tabled + Serialize>(items: &[T], mode: OutputMode) -> anyhow::Result<()> {
    match mode {
        OutputMode::Table => {
            if items.is_empty() {
                println!("(no results)");
            } else {
                println!("{}", Table::new(items));
            }
        }
        OutputMode::Json => println!("{}", serde_json::to_string_pretty(items)?),
    }
    Ok(())
}

/// Print a single item as pretty JSON; nested reports have no table form.
pub fn print_item<T: Serialize>(item: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(item)?);
    Ok(())
}

#[derive(Debug, Serialize, Tabled)]
pub struct AprRow {
    pub protocol: String,
    pub usdt_apr_bps: String,
    pub usdc_apr_bps: String,
    pub source: String,
    pub health: String,
    pub risk_score: u8,
    pub risk_tags: String,
    pub best_for: String,
}

fn bps(value: Option<u32>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

impl AprRow {
    fn from_protocol(row: &ProtocolApr, comparison: &AprComparison) -> Self {
        let mut best = Vec::new();
        if comparison.best_usdt.as_deref() == Some(row.protocol_id.as_str()) {
            best.push("USDT");
        }
        if comparison.best_usdc.as_deref() == Some(row.protocol_id.as_str()) {
            best.push("USDC");
        }

        Self {
            protocol: row.protocol_id.clone(),
            usdt_apr_bps: bps(row.usdt_apr_bps),
            usdc_apr_bps: bps(row.usdc_apr_bps),
            source: row
                .source
                .map_or_else(|| "-".to_string(), |s| format!("{:?}", s).to_lowercase()),
            health: row.health.as_str().to_string(),
            risk_score: row.risk_score,
            risk_tags: row
                .risk_tags
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(","),
            best_for: best.join(","),
        }
    }
}

pub fn apr_rows(comparison: &AprComparison) -> Vec<AprRow> {
    comparison
        .protocols
        .iter()
        .map(|row| AprRow::from_protocol(row, comparison))
        .collect()
}

#[derive(Debug, Serialize, Tabled)]
pub struct EndpointRow {
    pub endpoint: String,
    pub attempts: u64,
    pub success: u64,
    pub errors: u64,
    pub http429: u64,
    pub http5xx: u64,
    pub score: String,
}

pub fn endpoint_rows(snapshot: &RouterSnapshot) -> Vec<EndpointRow> {
    snapshot
        .endpoints
        .iter()
        .map(|(endpoint, stats)| EndpointRow {
            endpoint: endpoint.clone(),
            attempts: stats.attempts,
            success: stats.success,
            errors: stats.errors,
            http429: stats.http429,
            http5xx: stats.http5xx,
            score: format!("{:.3}", stats.score()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::yields::{HealthTag, HintSource, RiskTag};
    use chrono::Utc;

    #[test]
    fn test_apr_rows_mark_best() {
        let comparison = AprComparison {
            protocols: vec![ProtocolApr {
                protocol_id: "burrow".to_string(),
                usdt_apr_bps: Some(300),
                usdc_apr_bps: None,
                source: Some(HintSource::Fallback),
                updated_at: None,
                health: HealthTag::Unknown,
                risk_tags: vec![RiskTag::Unknown, RiskTag::FallbackSource],
                risk_score: 60,
                last_error: None,
            }],
            best_usdt: Some("burrow".to_string()),
            best_usdc: None,
            generated_at: Utc::now(),
        };

        let rows = apr_rows(&comparison);
        assert_eq!(rows[0].usdc_apr_bps, "-");
        assert_eq!(rows[0].source, "fallback");
        assert_eq!(rows[0].risk_tags, "unknown,fallback_source");
        assert_eq!(rows[0].best_for, "USDT");
    }
}
