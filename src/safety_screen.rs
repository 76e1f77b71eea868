// Three-layer rug-pull screen, evaluated in order with short-circuiting:
// burn percentage from the listing, on-chain LP-lock analysis over the top
// holders, then the external token-safety report. Any single failure
// rejects the pool; every reason is kept for the log.

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::backend::{ExecutionBackend, LpHolders};
use crate::config::Config;
use crate::errors::EngineError;
use crate::external_apis::{Pool, TokenReport, TokenSafetyClient};

/// Known incinerator sinks. LP sent here is gone for good.
const BURN_ADDRESSES: &[&str] = &[
    "1nc1nerator11111111111111111111111111111111",
    "11111111111111111111111111111111",
];

/// The AMM's own authority. LP parked under it counts as protocol-locked.
const PROTOCOL_AUTHORITY: &str = "5Q544fKrFoe6tsEbD7S8EmxGTJYAKtTVhAW5Q5pge4j1";

/// Time-lock escrow programs in circulation on mainnet.
const LOCK_PROGRAMS: &[&str] = &[
    "strmRqUCoQUgGUan5YhzUZa6KqdzwX5L6FpUxfmKg5m",  // Streamflow
    "LocpQgucEQHbqNABEYvBvwoxCPsSbG91A1QaQhQQqjn",  // Jupiter Lock
    "CChTq6PthWU82YZkbveA3WDf7s97BWhBK4Vx9bmsT743", // Bonfida vesting
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockClass {
    Burned,
    ProtocolLocked,
    ContractLocked,
    Unlocked,
}

pub fn classify_holder(address: &str) -> LockClass {
    if BURN_ADDRESSES.contains(&address) {
        LockClass::Burned
    } else if address == PROTOCOL_AUTHORITY {
        LockClass::ProtocolLocked
    } else if LOCK_PROGRAMS.contains(&address) {
        LockClass::ContractLocked
    } else {
        LockClass::Unlocked
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyReport {
    pub burn_ok: bool,
    pub lp_lock_ok: bool,
    pub token_ok: bool,
    pub reasons: Vec<String>,
}

impl SafetyReport {
    pub fn passed(&self) -> bool {
        self.burn_ok && self.lp_lock_ok && self.token_ok
    }
}

pub struct SafetyScreen {
    token_safety: TokenSafetyClient,
}

impl SafetyScreen {
    pub fn new(token_safety: TokenSafetyClient) -> Self {
        Self { token_safety }
    }

    /// Runs the three layers against one pool. Remote failures bubble as
    /// errors (the scan worker skips the pool for this cycle); safety
    /// verdicts land in the report.
    pub async fn screen(
        &self,
        pool: &Pool,
        backend: &dyn ExecutionBackend,
        config: &Config,
    ) -> Result<SafetyReport, EngineError> {
        let mut report = SafetyReport {
            burn_ok: false,
            lp_lock_ok: false,
            token_ok: false,
            reasons: Vec::new(),
        };

        // Layer 1: LP burn percentage straight off the listing row.
        if pool.burn_pct < config.min_burn_pct {
            report.reasons.push(format!(
                "LP burn {:.1}% below minimum {:.1}%",
                pool.burn_pct, config.min_burn_pct
            ));
            debug!("🛑 {} rejected at burn layer", pool.pool_id);
            return Ok(report);
        }
        report.burn_ok = true;

        // Layer 2: who actually holds the LP.
        let holders = backend.lp_holders(&pool.lp_mint).await?;
        let lp_reasons = check_lp_holders(&holders, config);
        if !lp_reasons.is_empty() {
            report.reasons.extend(lp_reasons);
            debug!("🛑 {} rejected at LP-lock layer", pool.pool_id);
            return Ok(report);
        }
        report.lp_lock_ok = true;

        // Layer 3: token-safety report for the risked mint.
        let token_report = self.token_safety.token_report(pool.risk_mint()).await?;
        let token_reasons = check_token_report(&token_report, config);
        if !token_reasons.is_empty() {
            report.reasons.extend(token_reasons);
            debug!("🛑 {} rejected at token-safety layer", pool.pool_id);
            return Ok(report);
        }
        report.token_ok = true;

        info!(
            "🛡️ {} ({}) passed all safety layers",
            pool.pool_id,
            pool.risk_symbol()
        );
        Ok(report)
    }
}

/// LP-lock layer verdicts: enough of the supply must be burned or locked,
/// and no single unlocked wallet may dominate.
pub fn check_lp_holders(holders: &LpHolders, config: &Config) -> Vec<String> {
    let mut reasons = Vec::new();
    if holders.supply == 0 {
        reasons.push("LP supply reported as zero".to_string());
        return reasons;
    }

    let mut locked_raw: u128 = 0;
    let mut max_unlocked_pct: f64 = 0.0;
    for (address, raw) in &holders.holders {
        match classify_holder(address) {
            LockClass::Burned | LockClass::ProtocolLocked | LockClass::ContractLocked => {
                locked_raw += *raw as u128;
            }
            LockClass::Unlocked => {
                let pct = *raw as f64 / holders.supply as f64 * 100.0;
                max_unlocked_pct = max_unlocked_pct.max(pct);
            }
        }
    }

    let locked_pct = locked_raw as f64 / holders.supply as f64 * 100.0;
    if locked_pct < config.min_safe_lp_pct {
        reasons.push(format!(
            "only {:.1}% of LP burned/locked (minimum {:.1}%)",
            locked_pct, config.min_safe_lp_pct
        ));
    }
    if max_unlocked_pct > config.max_single_lp_holder_pct {
        reasons.push(format!(
            "single unlocked wallet holds {:.1}% of LP (maximum {:.1}%)",
            max_unlocked_pct, config.max_single_lp_holder_pct
        ));
    }
    reasons
}

/// Token-safety layer verdicts over the external report.
pub fn check_token_report(report: &TokenReport, config: &Config) -> Vec<String> {
    let mut reasons = Vec::new();

    if report.score_normalised > config.max_score {
        reasons.push(format!(
            "safety score {:.0} above maximum {:.0}",
            report.score_normalised, config.max_score
        ));
    }
    for risk in &report.risks {
        if risk.level.eq_ignore_ascii_case("danger") {
            reasons.push(format!("danger risk flagged: {}", risk.name));
        }
    }

    let top10_pct: f64 = report.top_holders.iter().take(10).map(|h| h.pct).sum();
    if top10_pct > config.max_top10_holder_pct {
        reasons.push(format!(
            "top-10 holders control {:.1}% (maximum {:.1}%)",
            top10_pct, config.max_top10_holder_pct
        ));
    }
    if let Some(worst) = report
        .top_holders
        .iter()
        .map(|h| h.pct)
        .fold(None, |acc: Option<f64>, pct| {
            Some(acc.map_or(pct, |a| a.max(pct)))
        })
    {
        if worst > config.max_single_holder_pct {
            reasons.push(format!(
                "single holder controls {:.1}% (maximum {:.1}%)",
                worst, config.max_single_holder_pct
            ));
        }
    }
    if report.total_holders < config.min_token_holders {
        reasons.push(format!(
            "only {} holders (minimum {})",
            report.total_holders, config.min_token_holders
        ));
    }
    if report.freeze_authority.is_some() {
        reasons.push("freeze authority still present".to_string());
    }
    if report.mint_authority.is_some() {
        reasons.push("mint authority still present".to_string());
    }
    reasons
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_apis::{TokenHolder, TokenRisk};

    fn holders(entries: &[(&str, u64)], supply: u64) -> LpHolders {
        LpHolders {
            holders: entries
                .iter()
                .map(|(address, raw)| (address.to_string(), *raw))
                .collect(),
            supply,
        }
    }

    fn clean_report() -> TokenReport {
        TokenReport {
            score: 500.0,
            score_normalised: 20.0,
            risks: vec![],
            top_holders: vec![
                TokenHolder {
                    address: "h1".into(),
                    pct: 8.0,
                    insider: false,
                },
                TokenHolder {
                    address: "h2".into(),
                    pct: 5.0,
                    insider: false,
                },
            ],
            total_holders: 9_000,
            freeze_authority: None,
            mint_authority: None,
        }
    }

    #[test]
    fn classifies_registry_addresses() {
        assert_eq!(
            classify_holder("1nc1nerator11111111111111111111111111111111"),
            LockClass::Burned
        );
        assert_eq!(classify_holder(PROTOCOL_AUTHORITY), LockClass::ProtocolLocked);
        assert_eq!(
            classify_holder("strmRqUCoQUgGUan5YhzUZa6KqdzwX5L6FpUxfmKg5m"),
            LockClass::ContractLocked
        );
        assert_eq!(classify_holder("SomeRandomWallet"), LockClass::Unlocked);
    }

    #[test]
    fn lp_layer_accepts_mostly_burned_supply() {
        let config = Config::default();
        let h = holders(
            &[
                ("1nc1nerator11111111111111111111111111111111", 700),
                ("wallet-a", 200),
                ("wallet-b", 100),
            ],
            1_000,
        );
        assert!(check_lp_holders(&h, &config).is_empty());
    }

    #[test]
    fn lp_layer_rejects_low_locked_share() {
        let config = Config::default();
        let h = holders(&[("wallet-a", 200), ("wallet-b", 200)], 1_000);
        let reasons = check_lp_holders(&h, &config);
        assert!(reasons.iter().any(|r| r.contains("burned/locked")));
    }

    #[test]
    fn lp_layer_rejects_dominant_unlocked_wallet() {
        let config = Config::default();
        // plenty locked, but one unlocked whale over the 25% line
        let h = holders(
            &[
                ("1nc1nerator11111111111111111111111111111111", 600),
                ("whale", 300),
            ],
            1_000,
        );
        let reasons = check_lp_holders(&h, &config);
        assert!(reasons.iter().any(|r| r.contains("single unlocked wallet")));
    }

    #[test]
    fn token_layer_accepts_clean_report() {
        assert!(check_token_report(&clean_report(), &Config::default()).is_empty());
    }

    #[test]
    fn token_layer_rejects_danger_and_authorities() {
        let config = Config::default();
        let mut report = clean_report();
        report.risks.push(TokenRisk {
            name: "Honeypot".into(),
            description: String::new(),
            score: 5_000.0,
            level: "danger".into(),
        });
        report.freeze_authority = Some("auth".into());
        let reasons = check_token_report(&report, &config);
        assert!(reasons.iter().any(|r| r.contains("Honeypot")));
        assert!(reasons.iter().any(|r| r.contains("freeze authority")));
    }

    #[test]
    fn token_layer_rejects_concentration() {
        let config = Config::default();
        let mut report = clean_report();
        report.top_holders = vec![TokenHolder {
            address: "whale".into(),
            pct: 35.0,
            insider: true,
        }];
        let reasons = check_token_report(&report, &config);
        assert!(reasons.iter().any(|r| r.contains("single holder")));
    }

    #[test]
    fn token_layer_rejects_thin_holder_base() {
        let config = Config::default();
        let mut report = clean_report();
        report.total_holders = 12;
        let reasons = check_token_report(&report, &config);
        assert!(reasons.iter().any(|r| r.contains("12 holders")));
    }

    #[tokio::test]
    async fn screen_short_circuits_on_burn_layer() {
        use crate::backend::SimulatedBackend;
        let config = Config::default();
        let screen = SafetyScreen::new(TokenSafetyClient::new());
        let backend = SimulatedBackend::new();

        let pool = Pool {
            pool_id: "pool-a".into(),
            lp_mint: "lp".into(),
            base_mint: "mint-a".into(),
            quote_mint: crate::external_apis::WSOL_MINT.into(),
            base_symbol: "TKN".into(),
            quote_symbol: "WSOL".into(),
            base_decimals: 6,
            quote_decimals: 9,
            tvl_usd: 100_000.0,
            volume_24h_usd: 50_000.0,
            apr_24h_pct: 30.0,
            burn_pct: 10.0,
            fee_tier_bps: 25,
        };

        // No holder data seeded: reaching layer 2 would error, proving the
        // burn layer short-circuited first.
        let report = screen.screen(&pool, &backend, &config).await.unwrap();
        assert!(!report.passed());
        assert!(!report.burn_ok);
        assert_eq!(report.reasons.len(), 1);
    }
}
