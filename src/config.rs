use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub guards: GuardConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub secondary: SecondaryConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub yields: YieldConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    /// Candidate JSON-RPC endpoints, in configured preference order
    #[serde(default = "default_rpc_endpoints")]
    pub endpoints: Vec<String>,
    /// Calls during which endpoints are rotated round-robin instead of scored
    #[serde(default = "default_warmup_calls")]
    pub warmup_calls: u64,
    /// Extra passes over the endpoint list after the first
    #[serde(default = "default_retry_rounds")]
    pub retry_rounds: u32,
    /// Linear backoff unit between rounds
    #[serde(default = "default_rpc_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Per-request HTTP timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_rpc_endpoints() -> Vec<String> {
    vec![
        "https://rpc.mainnet.near.org".to_string(),
        "https://free.rpc.fastnear.com".to_string(),
    ]
}

fn default_warmup_calls() -> u64 {
    20
}

fn default_retry_rounds() -> u32 {
    1
}

fn default_rpc_backoff_ms() -> u64 {
    250
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            endpoints: default_rpc_endpoints(),
            warmup_calls: default_warmup_calls(),
            retry_rounds: default_retry_rounds(),
            base_backoff_ms: default_rpc_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Risk guard thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct GuardConfig {
    /// Largest amount a single run may move (token base units)
    #[serde(default = "default_max_amount_raw")]
    pub max_amount_raw: u64,
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: u32,
    /// Smallest acceptable swap quote (token base units)
    #[serde(default = "default_min_quote_out_raw")]
    pub min_quote_out_raw: u64,
    /// Floor for quote_out / amount_in (same-decimals stablecoins)
    #[serde(default = "default_min_effective_rate")]
    pub min_effective_rate: Decimal,
    #[serde(default = "default_daily_max")]
    pub daily_max: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: i64,
    /// Max off-chain vs router quote divergence on the secondary chain
    #[serde(default = "default_max_divergence_bps")]
    pub max_divergence_bps: u32,
}

fn default_max_amount_raw() -> u64 {
    5_000_000
}

fn default_max_slippage_bps() -> u32 {
    100
}

fn default_min_quote_out_raw() -> u64 {
    1
}

fn default_min_effective_rate() -> Decimal {
    dec!(0.95)
}

fn default_daily_max() -> u32 {
    10
}

fn default_cooldown_secs() -> i64 {
    0
}

fn default_max_divergence_bps() -> u32 {
    150
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_amount_raw: default_max_amount_raw(),
            max_slippage_bps: default_max_slippage_bps(),
            min_quote_out_raw: default_min_quote_out_raw(),
            min_effective_rate: default_min_effective_rate(),
            daily_max: default_daily_max(),
            cooldown_secs: default_cooldown_secs(),
            max_divergence_bps: default_max_divergence_bps(),
        }
    }
}

/// Primary-chain run settings
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Token withdrawn from collateral and swapped away
    #[serde(default = "default_token_in")]
    pub token_in: String,
    /// Token received from the swap and supplied back
    #[serde(default = "default_token_out")]
    pub token_out: String,
    #[serde(default = "default_pool_id")]
    pub pool_id: String,
    #[serde(default = "default_slippage_bps")]
    pub default_slippage_bps: u32,
    /// Residual wallet balance at or below which a run counts as reconciled
    #[serde(default = "default_dust_threshold_raw")]
    pub dust_threshold_raw: u64,
    #[serde(default = "default_recent_runs_capacity")]
    pub recent_runs_capacity: usize,
    /// Timeout budget for every external adapter call
    #[serde(default = "default_adapter_timeout_secs")]
    pub adapter_timeout_secs: u64,
    /// Operating account for on-chain runs; paper mode ignores it
    #[serde(default)]
    pub account_id: Option<String>,
    /// Lending contract holding the collateral position
    #[serde(default = "default_lending_contract")]
    pub lending_contract: String,
    /// DEX contract the swap is routed through
    #[serde(default = "default_dex_contract")]
    pub dex_contract: String,
}

fn default_lending_contract() -> String {
    "contract.main.burrow.near".to_string()
}

fn default_dex_contract() -> String {
    "v2.ref-finance.near".to_string()
}

fn default_token_in() -> String {
    "usdt.tether-token.near".to_string()
}

fn default_token_out() -> String {
    "17208628f84f5d6ad33f0da3bbbeb27ffcb398eac501a31bd6ad2011e36133a1".to_string()
}

fn default_pool_id() -> String {
    "4179".to_string()
}

fn default_slippage_bps() -> u32 {
    50
}

fn default_dust_threshold_raw() -> u64 {
    10
}

fn default_recent_runs_capacity() -> usize {
    50
}

fn default_adapter_timeout_secs() -> u64 {
    120
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            token_in: default_token_in(),
            token_out: default_token_out(),
            pool_id: default_pool_id(),
            default_slippage_bps: default_slippage_bps(),
            dust_threshold_raw: default_dust_threshold_raw(),
            recent_runs_capacity: default_recent_runs_capacity(),
            adapter_timeout_secs: default_adapter_timeout_secs(),
            account_id: None,
            lending_contract: default_lending_contract(),
            dex_contract: default_dex_contract(),
        }
    }
}

/// Secondary (EVM-style) chain swap settings
#[derive(Debug, Clone, Deserialize)]
pub struct SecondaryConfig {
    #[serde(default = "default_secondary_token_in")]
    pub token_in: String,
    #[serde(default = "default_secondary_token_out")]
    pub token_out: String,
    /// Protocol that receives the swap output
    #[serde(default = "default_post_action_protocol")]
    pub post_action_protocol: String,
}

fn default_secondary_token_in() -> String {
    "USDT".to_string()
}

fn default_secondary_token_out() -> String {
    "USDC".to_string()
}

fn default_post_action_protocol() -> String {
    "venus".to_string()
}

impl Default for SecondaryConfig {
    fn default() -> Self {
        Self {
            token_in: default_secondary_token_in(),
            token_out: default_secondary_token_out(),
            post_action_protocol: default_post_action_protocol(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    /// Unit of the exponential retry backoff
    #[serde(default = "default_queue_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Upper bound on retained jobs
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
    /// How long dismissed jobs are kept before purge
    #[serde(default = "default_dismissed_retention_secs")]
    pub dismissed_retention_secs: i64,
    /// Optional JSON snapshot of the job list
    #[serde(default)]
    pub store_path: Option<String>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_queue_backoff_ms() -> u64 {
    1000
}

fn default_max_jobs() -> usize {
    200
}

fn default_dismissed_retention_secs() -> i64 {
    7 * 24 * 3600
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: default_max_attempts(),
            base_backoff_ms: default_queue_backoff_ms(),
            max_jobs: default_max_jobs(),
            dismissed_retention_secs: default_dismissed_retention_secs(),
            store_path: None,
        }
    }
}

/// Yield planning and APR source settings
#[derive(Debug, Clone, Deserialize)]
pub struct YieldConfig {
    #[serde(default = "default_apr_ttl_secs")]
    pub apr_ttl_secs: i64,
    /// Age after which cached APR data is reported stale
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: i64,
    /// Target USDC share of the stable book
    #[serde(default = "default_target_usdc_bps")]
    pub target_usdc_bps: u32,
    #[serde(default = "default_min_drift_bps")]
    pub min_drift_bps: u32,
    #[serde(default = "default_max_step_usd")]
    pub max_step_usd: Decimal,
    #[serde(default = "default_min_apr_delta_bps")]
    pub min_apr_delta_bps: u32,
    /// Largest shift of the target allocation caused by an APR gap
    #[serde(default = "default_apr_bias_cap_bps")]
    pub apr_bias_cap_bps: u32,
    #[serde(default = "default_token_decimals")]
    pub token_decimals: u32,
    /// Protocol used to execute the plan
    #[serde(default = "default_execution_protocol")]
    pub execution_protocol: String,
    #[serde(default = "default_protocols")]
    pub protocols: Vec<ProtocolConfig>,
}

/// One lending protocol: its APR source and its execution readiness inputs
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    pub id: String,
    #[serde(default)]
    pub enabled: bool,
    /// Rate API returning `{usdtAprBps, usdcAprBps, updatedAt}`
    #[serde(default)]
    pub apr_url: Option<String>,
    #[serde(default)]
    pub fallback_usdt_apr_bps: Option<u32>,
    #[serde(default)]
    pub fallback_usdc_apr_bps: Option<u32>,
    #[serde(default)]
    pub requires_credentials: bool,
    /// Name of the environment variable holding the signing credential
    #[serde(default)]
    pub credentials_env: Option<String>,
    #[serde(default)]
    pub command_template: Option<String>,
    #[serde(default)]
    pub allowed_tokens: Vec<String>,
    #[serde(default)]
    pub max_amount_raw: Option<u64>,
}

fn default_apr_ttl_secs() -> i64 {
    300
}

fn default_stale_after_secs() -> i64 {
    3600
}

fn default_target_usdc_bps() -> u32 {
    5000
}

fn default_min_drift_bps() -> u32 {
    500
}

fn default_max_step_usd() -> Decimal {
    dec!(50)
}

fn default_min_apr_delta_bps() -> u32 {
    100
}

fn default_apr_bias_cap_bps() -> u32 {
    1500
}

fn default_token_decimals() -> u32 {
    6
}

fn default_execution_protocol() -> String {
    "burrow".to_string()
}

fn default_protocols() -> Vec<ProtocolConfig> {
    vec![ProtocolConfig {
        id: "burrow".to_string(),
        enabled: true,
        apr_url: None,
        fallback_usdt_apr_bps: Some(300),
        fallback_usdc_apr_bps: Some(350),
        requires_credentials: false,
        credentials_env: None,
        command_template: Some("near call {contract} execute {args}".to_string()),
        allowed_tokens: vec!["USDT".to_string(), "USDC".to_string()],
        max_amount_raw: Some(default_max_amount_raw()),
    }]
}

impl Default for YieldConfig {
    fn default() -> Self {
        Self {
            apr_ttl_secs: default_apr_ttl_secs(),
            stale_after_secs: default_stale_after_secs(),
            target_usdc_bps: default_target_usdc_bps(),
            min_drift_bps: default_min_drift_bps(),
            max_step_usd: default_max_step_usd(),
            min_apr_delta_bps: default_min_apr_delta_bps(),
            apr_bias_cap_bps: default_apr_bias_cap_bps(),
            token_decimals: default_token_decimals(),
            execution_protocol: default_execution_protocol(),
            protocols: default_protocols(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rotated log files
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("REBALANCER_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // REBALANCER_GUARDS__MAX_AMOUNT_RAW, etc.
            .add_source(
                Environment::with_prefix("REBALANCER")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.rpc.endpoints.is_empty() {
            errors.push("rpc.endpoints must not be empty".to_string());
        }
        for endpoint in &self.rpc.endpoints {
            if let Err(e) = url::Url::parse(endpoint) {
                errors.push(format!("rpc endpoint {} is not a valid URL: {}", endpoint, e));
            }
        }

        if self.guards.max_amount_raw == 0 {
            errors.push("guards.max_amount_raw must be positive".to_string());
        }
        if self.guards.max_slippage_bps > 10_000 {
            errors.push("guards.max_slippage_bps must be <= 10000".to_string());
        }
        if self.guards.min_effective_rate < Decimal::ZERO {
            errors.push("guards.min_effective_rate must not be negative".to_string());
        }
        if self.engine.default_slippage_bps > self.guards.max_slippage_bps {
            errors.push("engine.default_slippage_bps exceeds guards.max_slippage_bps".to_string());
        }
        if self.engine.recent_runs_capacity == 0 {
            errors.push("engine.recent_runs_capacity must be positive".to_string());
        }

        if self.queue.default_max_attempts == 0 {
            errors.push("queue.default_max_attempts must be positive".to_string());
        }
        if self.queue.max_jobs == 0 {
            errors.push("queue.max_jobs must be positive".to_string());
        }

        if self.yields.target_usdc_bps > 10_000 {
            errors.push("yields.target_usdc_bps must be <= 10000".to_string());
        }
        if self.yields.max_step_usd <= Decimal::ZERO {
            errors.push("yields.max_step_usd must be positive".to_string());
        }
        for protocol in &self.yields.protocols {
            if let Some(apr_url) = &protocol.apr_url {
                if url::Url::parse(apr_url).is_err() {
                    errors.push(format!("protocol {} apr_url is not a valid URL", protocol.id));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
