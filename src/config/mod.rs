//! Configuration management for the Up/Down arbitrage engine.
//!
//! Loads settings from `config.toml` (optional) and `UPDOWN__*` environment
//! variables, with `.env` support.

use crate::market::Cohort;
use crate::risk::RiskMode;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Polymarket credentials and endpoints
    #[serde(default)]
    pub polymarket: PolymarketConfig,
    /// Which markets to track
    #[serde(default)]
    pub markets: MarketsConfig,
    /// Opportunity scanner thresholds
    #[serde(default)]
    pub scanner: ScannerConfig,
    /// Order sizing and hazard controls
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Near-expiry risk detection
    #[serde(default)]
    pub risk: RiskConfig,
    /// Loss-capping hedge behaviour
    #[serde(default)]
    pub hedge: HedgeConfig,
    /// Market data stream settings
    #[serde(default)]
    pub feed: FeedConfig,
    /// Main loop timing and storage
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolymarketConfig {
    /// CLOB API key (L2 auth)
    #[serde(default)]
    pub api_key: String,
    /// CLOB API secret, url-safe base64
    #[serde(default)]
    pub api_secret: String,
    /// CLOB API passphrase
    #[serde(default)]
    pub passphrase: String,
    /// Funding wallet address
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_clob_url")]
    pub clob_url: String,
    #[serde(default = "default_gamma_url")]
    pub gamma_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketsConfig {
    /// Underlying assets, lowercase as they appear in slugs
    #[serde(default = "default_assets")]
    pub assets: Vec<String>,
    /// Settlement cohorts to trade
    #[serde(default = "default_cohorts")]
    pub cohorts: Vec<Cohort>,
    /// Market discovery cache lifetime
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Combined cost below which a pair is a real arbitrage
    #[serde(default = "default_arbitrage_threshold")]
    pub arbitrage_threshold: Decimal,
    /// Minimum profit percent for an opening `buy_both` (1.0 = 1%)
    #[serde(default = "default_min_profit_pct")]
    pub min_profit_pct: Decimal,
    /// Fraction of top-of-book depth to take (0.0-1.0)
    #[serde(default = "default_depth_utilization")]
    pub depth_utilization: Decimal,
    /// Imbalance (shares) ignored by rebalancing
    #[serde(default = "default_noise_floor")]
    pub noise_floor: Decimal,
    /// Rebalances only buy a side quoted below this price
    #[serde(default = "default_rebalance_price_ceiling")]
    pub rebalance_price_ceiling: Decimal,
    /// Suppress repeat decisions for a cohort within this window
    #[serde(default = "default_cohort_cooldown_ms")]
    pub cohort_cooldown_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum USD notional for one order (or one matched pair batch)
    #[serde(default = "default_max_order_notional")]
    pub max_order_notional: Decimal,
    /// Orders below this USD notional are skipped
    #[serde(default = "default_min_order_notional")]
    pub min_order_notional: Decimal,
    /// Limit price slack above the best ask (0.02 = 2%)
    #[serde(default = "default_price_tolerance")]
    pub price_tolerance: Decimal,
    /// Hard ceiling for any buy limit price
    #[serde(default = "default_max_limit_price")]
    pub max_limit_price: Decimal,
    /// Per-market repeat-submission window
    #[serde(default = "default_market_cooldown_ms")]
    pub market_cooldown_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// What a triggered cohort does: hedge or stop trading
    #[serde(default)]
    pub mode: RiskMode,
    /// Seconds before expiry during which samples are counted
    #[serde(default = "default_window_secs")]
    pub window_secs: i64,
    /// Combined cost below which a sample counts as a trigger
    #[serde(default = "default_cost_threshold")]
    pub cost_threshold: Decimal,
    /// Trigger/check ratio that latches the cohort (0.0-1.0)
    #[serde(default = "default_trigger_ratio")]
    pub trigger_ratio: Decimal,
    /// Minimum triggers before the ratio is considered
    #[serde(default = "default_min_triggers")]
    pub min_triggers: u32,

    // Malfunction detection
    /// Consecutive order failures on one market before alerting
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Feed disconnects per hour before alerting
    #[serde(default = "default_max_disconnects_per_hour")]
    pub max_disconnects_per_hour: u32,
    /// Seconds a malfunction halt blocks new arbitrage before it lifts
    #[serde(default = "default_halt_cooldown_secs")]
    pub halt_cooldown_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeConfig {
    /// Enter hedging when risk triggers in hedge mode
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Hedge legs are not bought at or above this ask
    #[serde(default = "default_hedge_max_price")]
    pub max_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Quotes older than this are not used
    #[serde(default = "default_quote_ttl_secs")]
    pub quote_ttl_secs: i64,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Consecutive failed reconnects before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Scan loop interval
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Bound on one cycle's concurrent order batch
    #[serde(default = "default_batch_timeout_secs")]
    pub batch_timeout_secs: u64,
    /// Settlement resolution polling interval
    #[serde(default = "default_settlement_poll_secs")]
    pub settlement_poll_secs: u64,
    /// Periodic ledger save interval
    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: u64,
    /// Status line interval
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Starting balance for paper trading
    #[serde(default = "default_paper_balance")]
    pub paper_balance: Decimal,
}

// Default value functions
fn default_clob_url() -> String {
    "https://clob.polymarket.com".to_string()
}

fn default_gamma_url() -> String {
    "https://gamma-api.polymarket.com".to_string()
}

fn default_ws_url() -> String {
    "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_assets() -> Vec<String> {
    vec!["btc".to_string(), "eth".to_string()]
}

fn default_cohorts() -> Vec<Cohort> {
    vec![Cohort::FifteenMin, Cohort::Hourly]
}

fn default_refresh_secs() -> u64 {
    15
}

fn default_arbitrage_threshold() -> Decimal {
    Decimal::new(995, 3) // 0.995
}

fn default_min_profit_pct() -> Decimal {
    Decimal::ONE // 1%
}

fn default_depth_utilization() -> Decimal {
    Decimal::new(8, 1) // 0.8
}

fn default_noise_floor() -> Decimal {
    Decimal::ONE // 1 share
}

fn default_rebalance_price_ceiling() -> Decimal {
    Decimal::new(65, 2) // 0.65
}

fn default_cohort_cooldown_ms() -> u64 {
    2000
}

fn default_max_order_notional() -> Decimal {
    Decimal::new(100, 0) // $100
}

fn default_min_order_notional() -> Decimal {
    Decimal::ONE // venue minimum is $1
}

fn default_price_tolerance() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_max_limit_price() -> Decimal {
    Decimal::new(99, 2) // 0.99
}

fn default_market_cooldown_ms() -> u64 {
    3000
}

fn default_window_secs() -> i64 {
    180
}

fn default_cost_threshold() -> Decimal {
    Decimal::new(55, 2) // 0.55
}

fn default_trigger_ratio() -> Decimal {
    Decimal::new(7, 1) // 0.7
}

fn default_min_triggers() -> u32 {
    30
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_max_disconnects_per_hour() -> u32 {
    5
}

fn default_halt_cooldown_secs() -> i64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_hedge_max_price() -> Decimal {
    Decimal::new(99, 2) // 0.99
}

fn default_quote_ttl_secs() -> i64 {
    10
}

fn default_reconnect_initial_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_ping_interval_secs() -> u64 {
    10
}

fn default_tick_ms() -> u64 {
    50
}

fn default_batch_timeout_secs() -> u64 {
    10
}

fn default_settlement_poll_secs() -> u64 {
    30
}

fn default_save_interval_secs() -> u64 {
    60
}

fn default_status_interval_secs() -> u64 {
    60
}

fn default_db_path() -> String {
    "updown_arb.db".to_string()
}

fn default_paper_balance() -> Decimal {
    Decimal::new(1000, 0) // $1,000
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("UPDOWN")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("markets.assets")
                    .with_list_parse_key("markets.cohorts")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.markets.assets.is_empty(), "markets.assets must not be empty");
        anyhow::ensure!(!self.markets.cohorts.is_empty(), "markets.cohorts must not be empty");
        anyhow::ensure!(
            (5..=30).contains(&self.markets.refresh_secs),
            "markets.refresh_secs must be between 5 and 30"
        );

        anyhow::ensure!(
            self.scanner.arbitrage_threshold > Decimal::ZERO
                && self.scanner.arbitrage_threshold <= Decimal::ONE,
            "arbitrage_threshold must be between 0 and 1"
        );
        anyhow::ensure!(
            self.scanner.depth_utilization > Decimal::ZERO
                && self.scanner.depth_utilization <= Decimal::ONE,
            "depth_utilization must be between 0 and 1"
        );
        anyhow::ensure!(
            self.scanner.noise_floor >= Decimal::ZERO,
            "noise_floor must not be negative"
        );

        anyhow::ensure!(
            self.execution.min_order_notional > Decimal::ZERO
                && self.execution.min_order_notional < self.execution.max_order_notional,
            "min_order_notional must be positive and below max_order_notional"
        );
        anyhow::ensure!(
            self.execution.price_tolerance >= Decimal::ZERO
                && self.execution.price_tolerance < Decimal::new(5, 1),
            "price_tolerance must be between 0 and 0.5"
        );
        anyhow::ensure!(
            self.execution.max_limit_price > Decimal::ZERO
                && self.execution.max_limit_price < Decimal::ONE,
            "max_limit_price must be between 0 and 1"
        );

        anyhow::ensure!(self.risk.window_secs > 0, "risk.window_secs must be positive");
        anyhow::ensure!(self.risk.halt_cooldown_secs > 0, "risk.halt_cooldown_secs must be positive");
        anyhow::ensure!(
            self.risk.trigger_ratio > Decimal::ZERO && self.risk.trigger_ratio <= Decimal::ONE,
            "trigger_ratio must be between 0 and 1"
        );

        anyhow::ensure!(self.feed.quote_ttl_secs > 0, "feed.quote_ttl_secs must be positive");
        anyhow::ensure!(
            self.feed.backoff_multiplier >= 1.0,
            "feed.backoff_multiplier must be at least 1.0"
        );

        anyhow::ensure!(self.engine.tick_ms > 0, "engine.tick_ms must be positive");
        anyhow::ensure!(
            self.engine.batch_timeout_secs > 0,
            "engine.batch_timeout_secs must be positive"
        );

        Ok(())
    }

    /// Additional checks for live trading.
    pub fn validate_live(&self) -> Result<()> {
        anyhow::ensure!(
            self.polymarket.has_credentials(),
            "live trading requires UPDOWN__POLYMARKET__API_KEY, API_SECRET, PASSPHRASE and ADDRESS"
        );
        Ok(())
    }
}

impl PolymarketConfig {
    pub fn has_credentials(&self) -> bool {
        !self.api_key.trim().is_empty()
            && !self.api_secret.trim().is_empty()
            && !self.passphrase.trim().is_empty()
            && !self.address.trim().is_empty()
    }
}

impl Default for PolymarketConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            passphrase: String::new(),
            address: String::new(),
            clob_url: default_clob_url(),
            gamma_url: default_gamma_url(),
            ws_url: default_ws_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for MarketsConfig {
    fn default() -> Self {
        Self {
            assets: default_assets(),
            cohorts: default_cohorts(),
            refresh_secs: default_refresh_secs(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            arbitrage_threshold: default_arbitrage_threshold(),
            min_profit_pct: default_min_profit_pct(),
            depth_utilization: default_depth_utilization(),
            noise_floor: default_noise_floor(),
            rebalance_price_ceiling: default_rebalance_price_ceiling(),
            cohort_cooldown_ms: default_cohort_cooldown_ms(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_order_notional: default_max_order_notional(),
            min_order_notional: default_min_order_notional(),
            price_tolerance: default_price_tolerance(),
            max_limit_price: default_max_limit_price(),
            market_cooldown_ms: default_market_cooldown_ms(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            mode: RiskMode::default(),
            window_secs: default_window_secs(),
            cost_threshold: default_cost_threshold(),
            trigger_ratio: default_trigger_ratio(),
            min_triggers: default_min_triggers(),
            max_consecutive_failures: default_max_consecutive_failures(),
            max_disconnects_per_hour: default_max_disconnects_per_hour(),
            halt_cooldown_secs: default_halt_cooldown_secs(),
        }
    }
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_price: default_hedge_max_price(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            quote_ttl_secs: default_quote_ttl_secs(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            batch_timeout_secs: default_batch_timeout_secs(),
            settlement_poll_secs: default_settlement_poll_secs(),
            save_interval_secs: default_save_interval_secs(),
            status_interval_secs: default_status_interval_secs(),
            db_path: default_db_path(),
            paper_balance: default_paper_balance(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_thresholds() {
        let config = Config::default();
        assert_eq!(config.scanner.arbitrage_threshold, dec!(0.995));
        assert_eq!(config.risk.window_secs, 180);
        assert_eq!(config.risk.cost_threshold, dec!(0.55));
        assert_eq!(config.risk.min_triggers, 30);
        assert_eq!(config.engine.tick_ms, 50);
        assert_eq!(config.markets.cohorts, vec![Cohort::FifteenMin, Cohort::Hourly]);
    }

    #[test]
    fn test_invalid_depth_utilization() {
        let mut config = Config::default();
        config.scanner.depth_utilization = dec!(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_live_requires_credentials() {
        let mut config = Config::default();
        assert!(config.validate_live().is_err());

        config.polymarket.api_key = "key".to_string();
        config.polymarket.api_secret = "c2VjcmV0".to_string();
        config.polymarket.passphrase = "pass".to_string();
        config.polymarket.address = "0xabc".to_string();
        assert!(config.validate_live().is_ok());
    }

    #[test]
    fn test_cohorts_deserialize_from_keys() {
        let markets: MarketsConfig =
            serde_json::from_str(r#"{"assets": ["btc"], "cohorts": ["15min"]}"#).unwrap();
        assert_eq!(markets.cohorts, vec![Cohort::FifteenMin]);
        assert_eq!(markets.refresh_secs, 15);
    }
}
