//! Whether the execution protocol is operationally able to take a plan

use super::planner::{YieldPlan, TOKEN_USDC};
use crate::config::ProtocolConfig;
use serde::Serialize;

/// Execution-side view of a protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolProfile {
    pub id: String,
    pub enabled: bool,
    pub requires_credentials: bool,
    pub credentials_present: bool,
    pub command_template: Option<String>,
    pub allowed_tokens: Vec<String>,
    pub max_amount_raw: Option<u128>,
}

impl ProtocolProfile {
    /// Credentials count as present when the named env var is set and non-blank
    pub fn from_config(config: &ProtocolConfig) -> Self {
        let credentials_present = config
            .credentials_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .map_or(false, |value| !value.trim().is_empty());

        Self {
            id: config.id.clone(),
            enabled: config.enabled,
            requires_credentials: config.requires_credentials,
            credentials_present,
            command_template: config.command_template.clone(),
            allowed_tokens: config.allowed_tokens.clone(),
            max_amount_raw: config.max_amount_raw.map(u128::from),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum Blocker {
    ProtocolDisabled,
    MissingCredentials,
    MissingCommandTemplate,
    TokenNotAllowed { token: String },
    AmountExceedsProtocolCap { amount_raw: String, cap_raw: String },
}

impl Blocker {
    pub fn code(&self) -> &'static str {
        match self {
            Blocker::ProtocolDisabled => "protocol_disabled",
            Blocker::MissingCredentials => "missing_credentials",
            Blocker::MissingCommandTemplate => "missing_command_template",
            Blocker::TokenNotAllowed { .. } => "token_not_allowed",
            Blocker::AmountExceedsProtocolCap { .. } => "amount_exceeds_protocol_cap",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecuteReadiness {
    pub protocol_id: String,
    pub can_execute: bool,
    pub blockers: Vec<Blocker>,
}

pub fn execute_readiness(plan: &YieldPlan, protocol: &ProtocolProfile) -> ExecuteReadiness {
    let mut blockers = Vec::new();

    if !protocol.enabled {
        blockers.push(Blocker::ProtocolDisabled);
    }
    if protocol.requires_credentials && !protocol.credentials_present {
        blockers.push(Blocker::MissingCredentials);
    }
    if protocol
        .command_template
        .as_deref()
        .map_or(true, |t| t.trim().is_empty())
    {
        blockers.push(Blocker::MissingCommandTemplate);
    }

    let token = plan.to_token.as_deref().unwrap_or(TOKEN_USDC);
    if !protocol
        .allowed_tokens
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(token))
    {
        blockers.push(Blocker::TokenNotAllowed {
            token: token.to_string(),
        });
    }

    if let Some(cap) = protocol.max_amount_raw {
        if plan.recommended_amount_raw > cap {
            blockers.push(Blocker::AmountExceedsProtocolCap {
                amount_raw: plan.recommended_amount_raw.to_string(),
                cap_raw: cap.to_string(),
            });
        }
    }

    ExecuteReadiness {
        protocol_id: protocol.id.clone(),
        can_execute: blockers.is_empty(),
        blockers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::yields::planner::PlanAction;

    fn profile() -> ProtocolProfile {
        ProtocolProfile {
            id: "burrow".to_string(),
            enabled: true,
            requires_credentials: false,
            credentials_present: false,
            command_template: Some("near call {contract} execute {args}".to_string()),
            allowed_tokens: vec!["USDT".to_string(), "USDC".to_string()],
            max_amount_raw: Some(5_000_000),
        }
    }

    fn rebalance(amount: u128) -> YieldPlan {
        YieldPlan {
            action: PlanAction::Rebalance,
            reason: "usdc_below_target".to_string(),
            target_bps: 7000,
            effective_target_bps: 7000,
            current_bps: 0,
            drift_bps: 7000,
            recommended_amount_raw: amount,
            from_token: Some("USDT".to_string()),
            to_token: Some("USDC".to_string()),
        }
    }

    #[test]
    fn test_ready_protocol() {
        let readiness = execute_readiness(&rebalance(1_000_000), &profile());
        assert!(readiness.can_execute);
        assert!(readiness.blockers.is_empty());
    }

    #[test]
    fn test_blockers_are_ordered() {
        let protocol = ProtocolProfile {
            enabled: false,
            requires_credentials: true,
            command_template: None,
            allowed_tokens: vec!["USDT".to_string()],
            ..profile()
        };
        let readiness = execute_readiness(&rebalance(9_000_000), &protocol);

        assert!(!readiness.can_execute);
        let codes: Vec<_> = readiness.blockers.iter().map(Blocker::code).collect();
        assert_eq!(
            codes,
            vec![
                "protocol_disabled",
                "missing_credentials",
                "missing_command_template",
                "token_not_allowed",
                "amount_exceeds_protocol_cap"
            ]
        );
    }

    #[test]
    fn test_credentials_from_env() {
        let mut config = ProtocolConfig {
            id: "venus".to_string(),
            enabled: true,
            apr_url: None,
            fallback_usdt_apr_bps: None,
            fallback_usdc_apr_bps: None,
            requires_credentials: true,
            credentials_env: Some("REBALANCER_TEST_VENUS_KEY_UNSET".to_string()),
            command_template: Some("venus supply".to_string()),
            allowed_tokens: vec!["USDC".to_string()],
            max_amount_raw: None,
        };
        assert!(!ProtocolProfile::from_config(&config).credentials_present);

        config.credentials_env = None;
        let readiness = execute_readiness(&rebalance(1), &ProtocolProfile::from_config(&config));
        assert_eq!(readiness.blockers, vec![Blocker::MissingCredentials]);
    }
}
