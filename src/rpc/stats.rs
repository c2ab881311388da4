//! Per-endpoint health counters and endpoint ordering

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Health counters for one RPC endpoint. `attempts >= success + errors`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub attempts: u64,
    pub success: u64,
    pub errors: u64,
    pub http429: u64,
    pub http5xx: u64,
}

impl EndpointStats {
    /// `(success - errors) / attempts`; never-tried endpoints score a neutral 0
    pub fn score(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        (self.success as f64 - self.errors as f64) / self.attempts as f64
    }

    pub fn has_history(&self) -> bool {
        self.attempts > 0
    }
}

/// Order candidate endpoints for the next call.
///
/// During warmup the list is rotated by call count so every endpoint gets
/// early traffic. Afterwards endpoints are ranked by score (ties: more
/// attempts first) and endpoints without history go last.
pub fn select_order(
    endpoints: &[String],
    stats: &HashMap<String, EndpointStats>,
    total_calls: u64,
    warmup_threshold: u64,
) -> Vec<String> {
    let n = endpoints.len();
    if n <= 1 {
        return endpoints.to_vec();
    }

    if total_calls < warmup_threshold {
        let offset = (total_calls % n as u64) as usize;
        return endpoints
            .iter()
            .cycle()
            .skip(offset)
            .take(n)
            .cloned()
            .collect();
    }

    let (mut scored, untested): (Vec<(&String, EndpointStats)>, Vec<(&String, EndpointStats)>) =
        endpoints
            .iter()
            .map(|e| (e, stats.get(e).copied().unwrap_or_default()))
            .partition(|(_, s)| s.has_history());

    // Stable sort: full ties keep configured order.
    scored.sort_by(|(_, a), (_, b)| {
        b.score()
            .partial_cmp(&a.score())
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.attempts.cmp(&a.attempts))
    });

    scored
        .into_iter()
        .chain(untested)
        .map(|(e, _)| e.clone())
        .collect()
}
