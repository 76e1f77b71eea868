// Weighted five-factor pool score and position sizing. Factors map into
// [0,100] monotonically with saturating caps; the composite is a convex
// combination, so the score itself stays inside [0,100].

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::{Config, TVL_REF_USD};
use crate::external_apis::Pool;

const WEIGHT_APR: f64 = 0.35;
const WEIGHT_VOL_TVL: f64 = 0.20;
const WEIGHT_LIQ: f64 = 0.20;
const WEIGHT_IL: f64 = 0.10;
const WEIGHT_BURN: f64 = 0.15;

/// APR where the log curve tops out at 100.
const APR_SATURATION_PCT: f64 = 500.0;
/// Volume/TVL ratio where that factor tops out.
const VOL_TVL_SATURATION: f64 = 2.0;
/// TVL where the liquidity factor tops out.
const LIQ_SATURATION_USD: f64 = 1_000_000.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub apr: f64,
    pub vol_tvl: f64,
    pub liq: f64,
    pub il: f64,
    pub burn: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Score {
    pub pool_id: String,
    pub score: f64,
    pub components: ScoreComponents,
    pub sized_amount_sol: Decimal,
}

/// Coarse threshold filter applied before the (remote, expensive) safety
/// screen. Returns the failure reason, or None when the pool moves on.
pub fn prefilter(pool: &Pool, config: &Config) -> Option<String> {
    if pool.tvl_usd < config.min_liquidity_usd {
        return Some(format!(
            "TVL ${:.0} below minimum ${:.0}",
            pool.tvl_usd, config.min_liquidity_usd
        ));
    }
    let vol_tvl = if pool.tvl_usd > 0.0 {
        pool.volume_24h_usd / pool.tvl_usd
    } else {
        0.0
    };
    if vol_tvl < config.min_volume_tvl_ratio {
        return Some(format!(
            "volume/TVL {:.3} below minimum {:.3}",
            vol_tvl, config.min_volume_tvl_ratio
        ));
    }
    if pool.apr_24h_pct < config.min_apr_24h {
        return Some(format!(
            "24h APR {:.1}% below minimum {:.1}%",
            pool.apr_24h_pct, config.min_apr_24h
        ));
    }
    None
}

fn apr_factor(apr_pct: f64) -> f64 {
    if apr_pct <= 0.0 {
        return 0.0;
    }
    (100.0 * (1.0 + apr_pct).ln() / (1.0 + APR_SATURATION_PCT).ln()).clamp(0.0, 100.0)
}

fn vol_tvl_factor(volume_usd: f64, tvl_usd: f64) -> f64 {
    if tvl_usd <= 0.0 {
        return 0.0;
    }
    ((volume_usd / tvl_usd) / VOL_TVL_SATURATION * 100.0).clamp(0.0, 100.0)
}

fn liquidity_factor(tvl_usd: f64) -> f64 {
    (tvl_usd / LIQ_SATURATION_USD * 100.0).clamp(0.0, 100.0)
}

fn burn_factor(burn_pct: f64) -> f64 {
    burn_pct.clamp(0.0, 100.0)
}

/// Composite score for an admitted pool. `il_factor` comes from the price
/// oracle's volatility history (50 = neutral, no history).
pub fn score_pool(pool: &Pool, il_factor: f64) -> Score {
    let components = ScoreComponents {
        apr: apr_factor(pool.apr_24h_pct),
        vol_tvl: vol_tvl_factor(pool.volume_24h_usd, pool.tvl_usd),
        liq: liquidity_factor(pool.tvl_usd),
        il: il_factor.clamp(0.0, 100.0),
        burn: burn_factor(pool.burn_pct),
    };
    let score = WEIGHT_APR * components.apr
        + WEIGHT_VOL_TVL * components.vol_tvl
        + WEIGHT_LIQ * components.liq
        + WEIGHT_IL * components.il
        + WEIGHT_BURN * components.burn;
    Score {
        pool_id: pool.pool_id.clone(),
        score,
        components,
        sized_amount_sol: Decimal::ZERO,
    }
}

/// Position size in SOL: deployable capital scaled by score and a TVL
/// factor, clamped into the configured band.
pub fn size_position(
    score: f64,
    tvl_usd: f64,
    deployable_sol: Decimal,
    config: &Config,
) -> Decimal {
    let base_sol = (deployable_sol - config.reserve_sol).max(Decimal::ZERO);
    let pool_factor = (tvl_usd / TVL_REF_USD).min(1.0).max(0.0);
    let scale = Decimal::try_from(score / 100.0 * pool_factor).unwrap_or(Decimal::ZERO);
    (base_sol * scale)
        .max(config.min_position_sol)
        .min(config.max_absolute_position_sol)
}
