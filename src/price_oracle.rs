// Reserve-derived pricing and LP valuation. All reserve math runs on
// integers (u64 raw amounts widened to u128 for products); floats appear
// only at the display/decision boundary. A 53-bit mantissa cannot carry a
// decimal-9 mint above ~9M supply, so the f64 shortcut is a correctness
// bug, not an optimization.

use std::collections::{HashMap, VecDeque};

use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::external_apis::FiatPriceClient;

const HISTORY_CAP: usize = 360;
const MIN_VOLATILITY_SAMPLES: usize = 3;

/// Effective reserve snapshot of one pool, assembled by the backend from
/// the AMM state account, its vaults and its open-orders account.
#[derive(Debug, Clone)]
pub struct PoolReserves {
    pub base_vault: u64,
    pub quote_vault: u64,
    pub base_open_orders: u64,
    pub quote_open_orders: u64,
    pub base_need_take_pnl: u64,
    pub quote_need_take_pnl: u64,
    /// The AMM's internal LP accounting counter, not the LP mint supply.
    pub lp_circulating: u64,
    pub base_decimals: u8,
    pub quote_decimals: u8,
    pub base_is_wsol: bool,
}

impl PoolReserves {
    /// vault + open-orders − accrued-pnl offset, guarded: if the offset
    /// exceeds the gross reserve the offset is ignored rather than going
    /// negative.
    pub fn effective_base(&self) -> u128 {
        effective_reserve(
            self.base_vault,
            self.base_open_orders,
            self.base_need_take_pnl,
        )
    }

    pub fn effective_quote(&self) -> u128 {
        effective_reserve(
            self.quote_vault,
            self.quote_open_orders,
            self.quote_need_take_pnl,
        )
    }

    /// Quote per base in natural (decimals-normalized) units. Float is fine
    /// here: the ratio is a display/decision value, not position math.
    pub fn price_ratio(&self) -> f64 {
        let base = self.effective_base();
        let quote = self.effective_quote();
        if base == 0 {
            return 0.0;
        }
        let base_units = base as f64 / 10f64.powi(self.base_decimals as i32);
        let quote_units = quote as f64 / 10f64.powi(self.quote_decimals as i32);
        if base_units == 0.0 {
            0.0
        } else {
            quote_units / base_units
        }
    }

    /// WSOL-denominated value of `lp_raw` LP units, in lamports. The holder
    /// share of each side is `lp_raw·reserve/lp_circulating`; the non-WSOL
    /// share converts at the pool ratio, all in u128 integer space.
    pub fn lp_value_lamports(&self, lp_raw: u64) -> u128 {
        if self.lp_circulating == 0 || lp_raw == 0 {
            return 0;
        }
        let base = self.effective_base();
        let quote = self.effective_quote();
        let lp_raw = lp_raw as u128;
        let lp_circulating = self.lp_circulating as u128;

        let share_base = lp_raw * base / lp_circulating;
        let share_quote = lp_raw * quote / lp_circulating;

        let (wsol_reserve, other_reserve, share_wsol, share_other) = if self.base_is_wsol {
            (base, quote, share_base, share_quote)
        } else {
            (quote, base, share_quote, share_base)
        };

        if other_reserve == 0 {
            return share_wsol;
        }
        let other_in_wsol = share_other * wsol_reserve / other_reserve;
        share_wsol + other_in_wsol
    }
}

fn effective_reserve(vault: u64, open_orders: u64, need_take_pnl: u64) -> u128 {
    let gross = vault as u128 + open_orders as u128;
    let pnl = need_take_pnl as u128;
    if pnl > gross {
        gross
    } else {
        gross - pnl
    }
}

/// Lamports → SOL at the display boundary, exact (scale-9 decimal).
pub fn lamports_to_sol(lamports: u128) -> Decimal {
    Decimal::from_i128_with_scale(lamports as i128, 9)
}

pub fn sol_to_lamports(sol: Decimal) -> u64 {
    use num_traits::ToPrimitive;
    (sol * Decimal::from(1_000_000_000u64))
        .trunc()
        .to_u64()
        .unwrap_or(0)
}

// ============================================================================
// PRICE ORACLE
// ============================================================================

/// Keeps a bounded price-ratio history per pool (feeding the scorer's
/// IL-safety factor) and fronts the fiat conversion services.
pub struct PriceOracle {
    history: RwLock<HashMap<String, VecDeque<(i64, f64)>>>,
    fiat: FiatPriceClient,
}

impl PriceOracle {
    pub fn new(fiat: FiatPriceClient) -> Self {
        Self {
            history: RwLock::new(HashMap::new()),
            fiat,
        }
    }

    pub async fn record_ratio(&self, pool_id: &str, ts: i64, ratio: f64) {
        if !ratio.is_finite() || ratio <= 0.0 {
            return;
        }
        let mut history = self.history.write().await;
        let ring = history.entry(pool_id.to_string()).or_default();
        ring.push_back((ts, ratio));
        while ring.len() > HISTORY_CAP {
            ring.pop_front();
        }
    }

    pub async fn forget_pool(&self, pool_id: &str) {
        self.history.write().await.remove(pool_id);
    }

    /// Standard deviation of log returns over the recorded history.
    pub async fn volatility(&self, pool_id: &str) -> Option<f64> {
        let history = self.history.read().await;
        let ring = history.get(pool_id)?;
        if ring.len() < MIN_VOLATILITY_SAMPLES {
            return None;
        }
        let returns: Vec<f64> = ring
            .iter()
            .zip(ring.iter().skip(1))
            .map(|((_, prev), (_, next))| (next / prev).ln())
            .collect();
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance =
            returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
        Some(variance.sqrt())
    }

    /// IL-safety factor for the scorer: calm pools near 100, volatile pools
    /// toward 0, neutral 50 with no usable history.
    pub async fn il_safety_factor(&self, pool_id: &str) -> f64 {
        match self.volatility(pool_id).await {
            Some(sigma) => (100.0 - sigma * 2_000.0).clamp(0.0, 100.0),
            None => 50.0,
        }
    }

    pub async fn sol_usd(&self) -> Result<f64, crate::errors::EngineError> {
        self.fiat.sol_usd().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserves(base: u64, quote: u64, lp: u64) -> PoolReserves {
        PoolReserves {
            base_vault: base,
            quote_vault: quote,
            base_open_orders: 0,
            quote_open_orders: 0,
            base_need_take_pnl: 0,
            quote_need_take_pnl: 0,
            lp_circulating: lp,
            base_decimals: 9,
            quote_decimals: 9,
            base_is_wsol: false,
        }
    }

    #[test]
    fn effective_reserve_never_negative() {
        // pnl offset larger than the gross reserve falls back to gross
        assert_eq!(effective_reserve(100, 50, 1_000), 150);
        assert_eq!(effective_reserve(100, 50, 30), 120);
        assert_eq!(effective_reserve(0, 0, 5), 0);
    }

    #[test]
    fn price_ratio_normalizes_decimals() {
        let mut r = reserves(2_000_000_000, 500_000_000, 1);
        r.base_decimals = 9;
        r.quote_decimals = 6;
        // 2.0 base units, 500 quote units -> 250 quote per base
        assert!((r.price_ratio() - 250.0).abs() < 1e-9);
    }

    #[test]
    fn lp_value_is_pro_rata() {
        // Own a quarter of the pool: value = quarter of base side twice
        // (quote side converts 1:1 at equal reserves).
        let r = reserves(1_000_000, 1_000_000, 1_000);
        let value = r.lp_value_lamports(250);
        assert_eq!(value, 500_000);
    }

    #[test]
    fn lp_value_survives_huge_reserves_exactly() {
        // base 2^60 + odd tail, quote 10^12: far past the 53-bit mantissa.
        let base: u64 = (1u64 << 60) + 987_654_321;
        let quote: u64 = 1_000_000_000_000;
        let lp_circulating: u64 = 1u64 << 55;
        let lp_raw: u64 = 1u64 << 50;

        let mut r = reserves(base, quote, lp_circulating);
        r.base_is_wsol = true; // base side is WSOL

        // Exact reference, same share formula in plain u128 arithmetic.
        let share_wsol = (lp_raw as u128) * (base as u128) / (lp_circulating as u128);
        let share_other = (lp_raw as u128) * (quote as u128) / (lp_circulating as u128);
        let other_in_wsol = share_other * (base as u128) / (quote as u128);
        let expected = share_wsol + other_in_wsol;

        assert_eq!(r.lp_value_lamports(lp_raw), expected);

        // The naive double path must NOT reproduce the exact figure.
        let naive = ((lp_raw as f64) * (base as f64) / (lp_circulating as f64)
            + (lp_raw as f64) * (quote as f64) / (lp_circulating as f64) * (base as f64)
                / (quote as f64)) as u128;
        assert_ne!(naive, expected);
    }

    #[test]
    fn lp_value_zero_circulating_is_zero() {
        let r = reserves(1_000_000, 1_000_000, 0);
        assert_eq!(r.lp_value_lamports(500), 0);
    }

    #[test]
    fn lamports_decimal_conversion_is_exact() {
        assert_eq!(lamports_to_sol(1_500_000_000), Decimal::new(15, 1));
        assert_eq!(sol_to_lamports(Decimal::new(25, 1)), 2_500_000_000);
    }

    #[tokio::test]
    async fn il_factor_neutral_without_history() {
        let oracle = PriceOracle::new(FiatPriceClient::new(None));
        assert!((oracle.il_safety_factor("p1").await - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn il_factor_drops_for_volatile_pool() {
        let oracle = PriceOracle::new(FiatPriceClient::new(None));
        for (i, ratio) in [1.0, 1.4, 0.8, 1.6, 0.7].iter().enumerate() {
            oracle.record_ratio("wild", i as i64, *ratio).await;
        }
        for (i, ratio) in [1.0, 1.001, 0.999, 1.002, 1.0].iter().enumerate() {
            oracle.record_ratio("calm", i as i64, *ratio).await;
        }
        let wild = oracle.il_safety_factor("wild").await;
        let calm = oracle.il_safety_factor("calm").await;
        assert!(wild < calm);
        assert!(calm > 90.0);
    }
}
