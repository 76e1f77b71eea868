// Engine configuration, loaded once at startup from the environment
// (a `.env` file is honored via dotenv). Every knob has a safe default:
// out of the box the agent runs in dry-run mode with trading disabled.

use std::env;
use std::str::FromStr;

use rust_decimal::Decimal;

use crate::errors::EngineError;

pub const POOL_CACHE_TTL_SEC: u64 = 60;
pub const FIAT_CACHE_TTL_SEC: u64 = 60;
pub const SCHEMA_VERSION: u32 = 2;

/// Reference TVL for the position-sizing pool factor: pools at or above
/// this TVL take full size, smaller pools scale down linearly.
pub const TVL_REF_USD: f64 = 250_000.0;

#[derive(Debug, Clone)]
pub struct Config {
    // Master switches
    pub trading_enabled: bool,
    pub dry_run: bool,

    // Sizing and capacity
    pub max_absolute_position_sol: Decimal,
    pub min_position_sol: Decimal,
    pub max_concurrent_positions: usize,
    pub reserve_sol: Decimal,
    pub slippage_pct: f64,

    // Exit thresholds
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub max_hold_hours: f64,
    pub max_il_pct: f64,

    // Pool filtering thresholds
    pub min_liquidity_usd: f64,
    pub min_volume_tvl_ratio: f64,
    pub min_apr_24h: f64,
    pub min_burn_pct: f64,

    // Token-safety thresholds
    pub max_score: f64,
    pub max_top10_holder_pct: f64,
    pub max_single_holder_pct: f64,
    pub min_token_holders: u64,

    // LP-lock thresholds
    pub min_safe_lp_pct: f64,
    pub max_single_lp_holder_pct: f64,

    // Escalation policy
    pub cooldown_tiers_sec: Vec<u64>,
    pub permanent_blacklist_strikes: u32,

    // Worker periods
    pub position_check_sec: u64,
    pub display_sec: u64,
    pub pool_scan_sec: u64,

    // Environment
    pub rpc_url: String,
    pub wallet_keypair_path: String,
    pub executor_cmd: Option<String>,
    pub state_dir: String,
    pub backend_timeout_sec: u64,
    pub coingecko_api_key: Option<String>,
    pub recovery_auto: bool,
}

fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T, EngineError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| EngineError::Config(format!("{}: cannot parse {:?}", key, raw))),
        Err(_) => Ok(default),
    }
}

fn parse_bool(key: &str, default: bool) -> Result<bool, EngineError> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(EngineError::Config(format!(
                "{}: expected boolean, got {:?}",
                key, other
            ))),
        },
        Err(_) => Ok(default),
    }
}

fn parse_tiers(key: &str, default: &[u64]) -> Result<Vec<u64>, EngineError> {
    match env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<u64>()
                    .map_err(|_| EngineError::Config(format!("{}: bad tier {:?}", key, part)))
            })
            .collect(),
        Err(_) => Ok(default.to_vec()),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, EngineError> {
        let config = Config {
            trading_enabled: parse_bool("TRADING_ENABLED", false)?,
            dry_run: parse_bool("DRY_RUN", true)?,

            max_absolute_position_sol: parse_var(
                "MAX_ABSOLUTE_POSITION_SOL",
                Decimal::new(5, 0),
            )?,
            min_position_sol: parse_var("MIN_POSITION_SOL", Decimal::new(5, 2))?,
            max_concurrent_positions: parse_var("MAX_CONCURRENT_POSITIONS", 5usize)?,
            reserve_sol: parse_var("RESERVE_SOL", Decimal::new(1, 1))?,
            slippage_pct: parse_var("SLIPPAGE_PCT", 1.0f64)?,

            stop_loss_pct: parse_var("STOP_LOSS_PCT", -15.0f64)?,
            take_profit_pct: parse_var("TAKE_PROFIT_PCT", 25.0f64)?,
            max_hold_hours: parse_var("MAX_HOLD_HOURS", 48.0f64)?,
            max_il_pct: parse_var("MAX_IL_PCT", -10.0f64)?,

            min_liquidity_usd: parse_var("MIN_LIQUIDITY_USD", 20_000.0f64)?,
            min_volume_tvl_ratio: parse_var("MIN_VOLUME_TVL_RATIO", 0.1f64)?,
            min_apr_24h: parse_var("MIN_APR_24H", 5.0f64)?,
            min_burn_pct: parse_var("MIN_BURN_PCT", 50.0f64)?,

            max_score: parse_var("MAX_SCORE", 60.0f64)?,
            max_top10_holder_pct: parse_var("MAX_TOP10_HOLDER_PCT", 50.0f64)?,
            max_single_holder_pct: parse_var("MAX_SINGLE_HOLDER_PCT", 20.0f64)?,
            min_token_holders: parse_var("MIN_TOKEN_HOLDERS", 200u64)?,

            min_safe_lp_pct: parse_var("MIN_SAFE_LP_PCT", 50.0f64)?,
            max_single_lp_holder_pct: parse_var("MAX_SINGLE_LP_HOLDER_PCT", 25.0f64)?,

            cooldown_tiers_sec: parse_tiers("COOLDOWN_TIERS", &[86_400, 172_800])?,
            permanent_blacklist_strikes: parse_var("PERMANENT_BLACKLIST_STRIKES", 3u32)?,

            position_check_sec: parse_var("POSITION_CHECK_SEC", 1u64)?,
            display_sec: parse_var("DISPLAY_SEC", 4u64)?,
            pool_scan_sec: parse_var("POOL_SCAN_SEC", 180u64)?,

            rpc_url: env::var("RPC_URL")
                .unwrap_or_else(|_| "https://api.mainnet-beta.solana.com".to_string()),
            wallet_keypair_path: env::var("WALLET_KEYPAIR_PATH")
                .unwrap_or_else(|_| "wallet/id.json".to_string()),
            executor_cmd: env::var("EXECUTOR_CMD").ok().filter(|s| !s.trim().is_empty()),
            state_dir: env::var("STATE_DIR").unwrap_or_else(|_| "state".to_string()),
            backend_timeout_sec: parse_var("BACKEND_TIMEOUT_SEC", 60u64)?,
            coingecko_api_key: env::var("COINGECKO_API_KEY")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            recovery_auto: parse_bool("RECOVERY_AUTO", false)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.min_position_sol > self.max_absolute_position_sol {
            return Err(EngineError::Config(format!(
                "MIN_POSITION_SOL ({}) exceeds MAX_ABSOLUTE_POSITION_SOL ({})",
                self.min_position_sol, self.max_absolute_position_sol
            )));
        }
        if self.stop_loss_pct >= 0.0 {
            return Err(EngineError::Config(
                "STOP_LOSS_PCT must be negative (loss threshold)".into(),
            ));
        }
        if self.take_profit_pct <= 0.0 {
            return Err(EngineError::Config(
                "TAKE_PROFIT_PCT must be positive".into(),
            ));
        }
        if self.max_il_pct >= 0.0 {
            return Err(EngineError::Config(
                "MAX_IL_PCT must be negative (IL is a loss)".into(),
            ));
        }
        if self.cooldown_tiers_sec.is_empty() {
            return Err(EngineError::Config(
                "COOLDOWN_TIERS must list at least one tier".into(),
            ));
        }
        if self.permanent_blacklist_strikes == 0 {
            return Err(EngineError::Config(
                "PERMANENT_BLACKLIST_STRIKES must be >= 1".into(),
            ));
        }
        if self.position_check_sec == 0 || self.display_sec == 0 || self.pool_scan_sec == 0 {
            return Err(EngineError::Config("worker periods must be > 0".into()));
        }
        if self.trading_enabled && !self.dry_run && self.executor_cmd.is_none() {
            return Err(EngineError::Config(
                "TRADING_ENABLED=true with DRY_RUN=false requires EXECUTOR_CMD".into(),
            ));
        }
        Ok(())
    }

    pub fn position_check_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.position_check_sec)
    }

    pub fn display_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.display_sec)
    }

    pub fn pool_scan_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.pool_scan_sec)
    }

    pub fn backend_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.backend_timeout_sec)
    }
}

impl Default for Config {
    /// Defaults used by tests; identical to `from_env` with no variables set
    /// except that dry-run stays on and trading stays off.
    fn default() -> Self {
        Config {
            trading_enabled: false,
            dry_run: true,
            max_absolute_position_sol: Decimal::new(5, 0),
            min_position_sol: Decimal::new(5, 2),
            max_concurrent_positions: 5,
            reserve_sol: Decimal::new(1, 1),
            slippage_pct: 1.0,
            stop_loss_pct: -15.0,
            take_profit_pct: 25.0,
            max_hold_hours: 48.0,
            max_il_pct: -10.0,
            min_liquidity_usd: 20_000.0,
            min_volume_tvl_ratio: 0.1,
            min_apr_24h: 5.0,
            min_burn_pct: 50.0,
            max_score: 60.0,
            max_top10_holder_pct: 50.0,
            max_single_holder_pct: 20.0,
            min_token_holders: 200,
            min_safe_lp_pct: 50.0,
            max_single_lp_holder_pct: 25.0,
            cooldown_tiers_sec: vec![86_400, 172_800],
            permanent_blacklist_strikes: 3,
            position_check_sec: 1,
            display_sec: 4,
            pool_scan_sec: 180,
            rpc_url: "https://api.mainnet-beta.solana.com".to_string(),
            wallet_keypair_path: "wallet/id.json".to_string(),
            executor_cmd: None,
            state_dir: "state".to_string(),
            backend_timeout_sec: 60,
            coingecko_api_key: None,
            recovery_auto: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_positive_stop_loss() {
        let mut config = Config::default();
        config.stop_loss_pct = 5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_sizing_bounds() {
        let mut config = Config::default();
        config.min_position_sol = Decimal::new(10, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn live_trading_requires_executor() {
        let mut config = Config::default();
        config.trading_enabled = true;
        config.dry_run = false;
        assert!(config.validate().is_err());
        config.executor_cmd = Some("lp-executor".into());
        config.validate().unwrap();
    }

    #[test]
    fn tier_parsing() {
        std::env::set_var("COOLDOWN_TIERS", "3600, 7200,14400");
        let tiers = parse_tiers("COOLDOWN_TIERS", &[1]).unwrap();
        std::env::remove_var("COOLDOWN_TIERS");
        assert_eq!(tiers, vec![3600, 7200, 14400]);
    }
}
